// src/push.rs
//! Outbound push boundary: batches messages to the external delivery
//! gateway and exposes the externally-owned device registry as a trait.
//! The gateway reports invalid tokens and per-message errors; the caller
//! reconciles those against the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DeviceRecord, NotifiedEntry, PushMessage};

#[derive(Debug, Clone, Serialize)]
struct GatewayBatch<'a> {
    messages: &'a [GatewayMessage],
}

#[derive(Debug, Clone, Serialize)]
struct GatewayMessage {
    token: String,
    title: String,
    body: String,
    category: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayReport {
    #[serde(default)]
    pub invalid_tokens: Vec<String>,
    #[serde(default)]
    pub errors: Vec<GatewayError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayError {
    pub token: String,
    pub message: String,
}

impl GatewayReport {
    fn absorb(&mut self, other: GatewayReport) {
        self.invalid_tokens.extend(other.invalid_tokens);
        self.errors.extend(other.errors);
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<GatewayReport>;
}

/// Externally-owned device storage. Only the pieces this core needs.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn load_devices(&self) -> Result<Vec<DeviceRecord>>;
    async fn save_last_notified(
        &self,
        device_id: &str,
        map: &BTreeMap<String, NotifiedEntry>,
    ) -> Result<()>;
    /// Drop registrations the gateway reported as invalid.
    async fn remove_tokens(&self, tokens: &[String]) -> Result<()>;
}

pub struct HttpPushGateway {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl HttpPushGateway {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<GatewayReport> {
        let payload: Vec<GatewayMessage> = messages
            .iter()
            .map(|m| GatewayMessage {
                token: m.push_token.clone(),
                title: m.title.clone(),
                body: m.body.clone(),
                category: m.category.clone(),
            })
            .collect();
        let batch = GatewayBatch { messages: &payload };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&batch)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    if let Err(e) = rsp.error_for_status_ref() {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1)))
                                .await;
                            continue;
                        }
                        return Err(anyhow!("push gateway HTTP error: {e}"));
                    }
                    return rsp
                        .json::<GatewayReport>()
                        .await
                        .context("push gateway response body");
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(anyhow!("push gateway request failed: {e}"));
                }
            }
        }
    }
}

/// Send in bounded-size chunks, accumulating one combined report. A chunk
/// that fails outright is recorded as per-message errors so delivery of
/// the remaining chunks still proceeds.
pub async fn send_all(
    gateway: &dyn PushGateway,
    messages: &[PushMessage],
    batch_size: usize,
) -> GatewayReport {
    let mut report = GatewayReport::default();
    let size = batch_size.max(1);
    for chunk in messages.chunks(size) {
        match gateway.send_batch(chunk).await {
            Ok(r) => report.absorb(r),
            Err(e) => {
                tracing::warn!(error = ?e, count = chunk.len(), "push batch failed");
                for m in chunk {
                    report.errors.push(GatewayError {
                        token: m.push_token.clone(),
                        message: format!("{e:#}"),
                    });
                }
            }
        }
    }
    report
}

// --- Test helper ---
pub struct MockGateway {
    pub batches: std::sync::Mutex<Vec<usize>>,
    pub invalid: Vec<String>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
            invalid: Vec::new(),
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushGateway for MockGateway {
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<GatewayReport> {
        self.batches.lock().unwrap().push(messages.len());
        Ok(GatewayReport {
            invalid_tokens: self.invalid.clone(),
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> PushMessage {
        PushMessage {
            device_id: format!("dev-{n}"),
            push_token: format!("tok-{n}"),
            title: "t".into(),
            body: "b".into(),
            category: "warning:大雨警報".into(),
        }
    }

    #[tokio::test]
    async fn chunks_are_bounded() {
        let gw = MockGateway::new();
        let messages: Vec<PushMessage> = (0..250).map(msg).collect();
        let report = send_all(&gw, &messages, 100).await;
        assert!(report.errors.is_empty());
        assert_eq!(*gw.batches.lock().unwrap(), vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn zero_batch_size_still_sends() {
        let gw = MockGateway::new();
        let messages: Vec<PushMessage> = (0..2).map(msg).collect();
        send_all(&gw, &messages, 0).await;
        assert_eq!(*gw.batches.lock().unwrap(), vec![1, 1]);
    }
}
