// src/fetch.rs
//! Conditional HTTP fetch boundary. The refresh scheduler only ever talks
//! to this trait, so tests can script responses without a network.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug)]
pub enum FetchResult {
    /// 2xx with a body; validators from the response, when present.
    Fresh {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// 304 — the cached body is still current.
    NotModified,
}

#[async_trait]
pub trait ConditionalFetch: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchResult>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("bousai-feed/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConditionalFetch for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchResult> {
        let mut req = self.client.get(url);
        if let Some(tag) = etag {
            req = req.header(header::IF_NONE_MATCH, tag);
        }
        if let Some(lm) = last_modified {
            req = req.header(header::IF_MODIFIED_SINCE, lm);
        }

        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchResult::NotModified);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET {url} non-2xx"))?;

        let header_str = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_str(header::ETAG);
        let last_modified = header_str(header::LAST_MODIFIED);

        let body = resp
            .text()
            .await
            .with_context(|| format!("GET {url} body"))?;
        Ok(FetchResult::Fresh {
            body,
            etag,
            last_modified,
        })
    }
}

// --- Test helper ---
// Scripted fetcher: responses are consumed in order; every call is
// counted so staleness-gating tests can assert on network traffic.
pub struct ScriptedFetch {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<FetchResult>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedFetch {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn push_fresh(&self, body: &str) {
        self.push_fresh_with(body, None, None);
    }

    pub fn push_fresh_with(&self, body: &str, etag: Option<&str>, last_modified: Option<&str>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(FetchResult::Fresh {
                body: body.to_string(),
                etag: etag.map(str::to_string),
                last_modified: last_modified.map(str::to_string),
            }));
    }

    pub fn push_not_modified(&self) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(FetchResult::NotModified));
    }

    pub fn push_error(&self, msg: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!("{msg}")));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for ScriptedFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConditionalFetch for ScriptedFetch {
    async fn fetch(
        &self,
        _url: &str,
        _etag: Option<&str>,
        _last_modified: Option<&str>,
    ) -> Result<FetchResult> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted response left")))
    }
}
