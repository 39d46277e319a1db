// src/dispatch.rs
//! Push dispatch policy. Pure: takes device records, current warning
//! snapshots and quakes, and returns the messages to send plus the
//! per-device dedup state to persist. Persistence and delivery belong to
//! external collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::area::AreaTable;
use crate::classify::Severity;
use crate::quakes::{intensity_rank, QuakeItem, QuakesSnapshot};
use crate::warnings::AreaSnapshot;

/// Repeat notifications of equal-or-lower severity are suppressed inside
/// this window. Escalations always pass.
pub const DEDUP_WINDOW_HOURS: i64 = 12;
/// Hard cap per device per dispatch cycle, warnings and quakes combined.
pub const MAX_SENDS_PER_CYCLE: usize = 3;
/// A device keeps at most this many subscribed cells, most recent first.
pub const MAX_SUBSCRIBED_CELLS: usize = 12;
/// Quakes qualify at intensity 5- and up, or magnitude 6.0 and up.
pub const QUAKE_MIN_INTENSITY_RANK: u8 = 5;
pub const QUAKE_MIN_MAGNITUDE: f64 = 6.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribedCell {
    pub cell_id: String,
    pub pref_code: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifiedEntry {
    pub level: Severity,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub push_token: String,
    #[serde(default)]
    pub subscribed_cells: Vec<SubscribedCell>,
    /// Only grows or overwrites per key, never globally cleared.
    #[serde(default)]
    pub last_notified: BTreeMap<String, NotifiedEntry>,
}

impl DeviceRecord {
    /// Record a cell sighting: dedup by cell id, most-recent-first,
    /// bounded length.
    pub fn touch_cell(&mut self, cell: SubscribedCell) {
        self.subscribed_cells.retain(|c| c.cell_id != cell.cell_id);
        self.subscribed_cells.insert(0, cell);
        self.subscribed_cells.truncate(MAX_SUBSCRIBED_CELLS);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub device_id: String,
    pub push_token: String,
    pub title: String,
    pub body: String,
    pub category: String,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub messages: Vec<PushMessage>,
    /// device id → updated last_notified map, only for devices that
    /// changed this cycle.
    pub updated: BTreeMap<String, BTreeMap<String, NotifiedEntry>>,
}

pub struct DispatchEngine {
    areas: Arc<AreaTable>,
}

impl DispatchEngine {
    pub fn new(areas: Arc<AreaTable>) -> Self {
        Self { areas }
    }

    pub fn dispatch(
        &self,
        devices: &[DeviceRecord],
        warnings_by_area: &BTreeMap<String, AreaSnapshot>,
        quakes: &QuakesSnapshot,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let window = Duration::hours(DEDUP_WINDOW_HOURS);
        let quake_candidates = qualify_quakes(quakes);

        let mut outcome = DispatchOutcome::default();
        for device in devices {
            let mut notified = device.last_notified.clone();
            let mut changed = false;
            let mut sent = 0usize;
            let mut categories_done: HashSet<String> = HashSet::new();

            // Warnings first.
            'areas: for (office, cell_id) in self.offices_for(device) {
                let Some(snap) = warnings_by_area.get(&office) else {
                    continue;
                };
                let mut items: Vec<_> = snap
                    .items
                    .iter()
                    .filter(|i| i.severity > Severity::Advisory)
                    .collect();
                items.sort_by(|a, b| b.severity.cmp(&a.severity));

                for item in items {
                    let category = format!("warning:{}", item.kind);
                    if !categories_done.insert(category.clone()) {
                        continue;
                    }
                    let key = format!("{category}:{cell_id}");
                    if !may_send(notified.get(&key), item.severity, now, window) {
                        continue;
                    }

                    outcome.messages.push(PushMessage {
                        device_id: device.device_id.clone(),
                        push_token: device.push_token.clone(),
                        title: format!("【{}】{}", item.kind, snap.area_name),
                        body: warning_body(&snap.area_name, &item.kind, item.status.as_deref()),
                        category,
                    });
                    notified.insert(
                        key,
                        NotifiedEntry {
                            level: item.severity,
                            sent_at: now,
                        },
                    );
                    changed = true;
                    sent += 1;
                    if sent >= MAX_SENDS_PER_CYCLE {
                        break 'areas;
                    }
                }
            }

            // Then quakes, within the same combined cap.
            for quake in &quake_candidates {
                if sent >= MAX_SENDS_PER_CYCLE {
                    break;
                }
                let key = format!("quake:{}", quake.id);
                let level = quake_level(quake);
                if !may_send(notified.get(&key), level, now, window) {
                    continue;
                }
                outcome.messages.push(PushMessage {
                    device_id: device.device_id.clone(),
                    push_token: device.push_token.clone(),
                    title: format!(
                        "【地震情報】{}",
                        quake.epicenter.as_deref().unwrap_or("震源不明")
                    ),
                    body: quake_body(quake),
                    category: "quake".to_string(),
                });
                notified.insert(
                    key,
                    NotifiedEntry {
                        level,
                        sent_at: now,
                    },
                );
                changed = true;
                sent += 1;
            }

            if changed {
                outcome.updated.insert(device.device_id.clone(), notified);
            }
        }
        outcome
    }

    /// Office-level area codes for a device: at most one cell counted per
    /// derived office, most-recently-seen preferred. Cells are stored
    /// most-recent-first, so first hit wins.
    fn offices_for(&self, device: &DeviceRecord) -> Vec<(String, String)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for cell in &device.subscribed_cells {
            let Some(office) = self.areas.office_for_pref(&cell.pref_code) else {
                continue;
            };
            if seen.insert(office.to_string()) {
                out.push((office.to_string(), cell.cell_id.clone()));
            }
        }
        out
    }
}

fn may_send(
    prev: Option<&NotifiedEntry>,
    level: Severity,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    match prev {
        None => true,
        // Escalation always overrides the window.
        Some(entry) if level > entry.level => true,
        Some(entry) => now - entry.sent_at > window,
    }
}

/// Top 3 most severe/recent qualifying quakes for this cycle.
fn qualify_quakes(quakes: &QuakesSnapshot) -> Vec<QuakeItem> {
    let mut candidates: Vec<QuakeItem> = quakes
        .items
        .iter()
        .filter(|q| {
            let strong = q
                .max_intensity
                .as_deref()
                .map(|i| intensity_rank(i) >= QUAKE_MIN_INTENSITY_RANK)
                .unwrap_or(false);
            let big = q.magnitude.map(|m| m >= QUAKE_MIN_MAGNITUDE).unwrap_or(false);
            strong || big
        })
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
        let ra = a.max_intensity.as_deref().map(intensity_rank).unwrap_or(0);
        let rb = b.max_intensity.as_deref().map(intensity_rank).unwrap_or(0);
        rb.cmp(&ra).then(b.time.cmp(&a.time))
    });
    candidates.truncate(MAX_SENDS_PER_CYCLE);
    candidates
}

fn quake_level(q: &QuakeItem) -> Severity {
    let rank = q.max_intensity.as_deref().map(intensity_rank).unwrap_or(0);
    if rank >= 7 {
        Severity::Special
    } else {
        Severity::Warning
    }
}

fn warning_body(area_name: &str, kind: &str, status: Option<&str>) -> String {
    match status {
        Some(status) => format!("{area_name}に{kind}（{status}）"),
        None => format!("{area_name}に{kind}"),
    }
}

fn quake_body(q: &QuakeItem) -> String {
    let mut parts = Vec::new();
    if let Some(i) = &q.max_intensity {
        parts.push(format!("最大震度{i}"));
    }
    if let Some(m) = q.magnitude {
        parts.push(format!("M{m:.1}"));
    }
    if let Some(d) = q.depth_km {
        parts.push(format!("深さ約{d}km"));
    }
    if parts.is_empty() {
        q.title.clone()
    } else {
        parts.join(" ")
    }
}
