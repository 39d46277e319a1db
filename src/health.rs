// src/health.rs
//! Reduces all per-source polling states into one fetch-status summary
//! for the read API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::SourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub fetch_status: FetchStatus,
    pub updated_at: Option<DateTime<Utc>>,
    /// First non-null error seen. Informational only: several sources may
    /// be failing independently.
    pub last_error: Option<String>,
}

pub fn source_degraded(s: &SourceState) -> bool {
    s.last_success_at.is_none() || s.last_error.is_some()
}

pub fn aggregate<'a, I>(states: I) -> Health
where
    I: IntoIterator<Item = &'a SourceState>,
{
    let mut any = false;
    let mut degraded = false;
    let mut updated_at: Option<DateTime<Utc>> = None;
    let mut last_error: Option<String> = None;

    for s in states {
        any = true;
        if source_degraded(s) {
            degraded = true;
        }
        updated_at = match (updated_at, s.last_success_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if last_error.is_none() {
            last_error = s.last_error.clone();
        }
    }

    // No sources at all reads as degraded: there is nothing fresh.
    let fetch_status = if !any || degraded || updated_at.is_none() {
        FetchStatus::Degraded
    } else {
        FetchStatus::Ok
    };

    Health {
        fetch_status,
        updated_at,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn healthy(at: DateTime<Utc>) -> SourceState {
        let mut s = SourceState::new("https://example.test/a.xml", 60_000);
        s.record_success(at);
        s
    }

    #[test]
    fn all_healthy_is_ok_with_max_updated() {
        let t0 = Utc::now();
        let newer = t0 + Duration::seconds(30);
        let states = [healthy(t0), healthy(newer)];
        let h = aggregate(states.iter());
        assert_eq!(h.fetch_status, FetchStatus::Ok);
        assert_eq!(h.updated_at, Some(newer));
        assert_eq!(h.last_error, None);
    }

    #[test]
    fn one_erroring_source_degrades_all() {
        let t0 = Utc::now();
        let mut bad = healthy(t0);
        bad.record_error("HTTP 503");
        let states = [healthy(t0), bad];
        let h = aggregate(states.iter());
        assert_eq!(h.fetch_status, FetchStatus::Degraded);
        assert_eq!(h.last_error.as_deref(), Some("HTTP 503"));
        // The summary still reports the freshest success it has.
        assert_eq!(h.updated_at, Some(t0));
    }

    #[test]
    fn never_succeeded_source_degrades() {
        let states = [SourceState::new("https://example.test/a.xml", 60_000)];
        let h = aggregate(states.iter());
        assert_eq!(h.fetch_status, FetchStatus::Degraded);
        assert_eq!(h.updated_at, None);
    }

    #[test]
    fn empty_input_is_degraded() {
        let h = aggregate(std::iter::empty::<&SourceState>());
        assert_eq!(h.fetch_status, FetchStatus::Degraded);
    }
}
