use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Client, Url};
use tokio::sync::mpsc;

use crate::http::resume::ResumeToken;
use crate::http::task::{spawn_download, spawn_upload, TaskEvent, TaskHandle};
use crate::types::{CachePolicy, TransferError};

/// Connection-level knobs for the underlying HTTP client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub max_connections_per_host: usize,
    pub tcp_nodelay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connections_per_host: 8,
            tcp_nodelay: true,
        }
    }
}

/// Everything needed to issue one request, resolved from a descriptor.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
}

impl RequestSpec {
    pub fn parse(
        url: &str,
        headers: HashMap<String, String>,
        cache_policy: CachePolicy,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let url = Url::parse(url).map_err(|_| TransferError::InvalidUrl(url.to_string()))?;
        Ok(Self {
            url,
            headers,
            cache_policy,
            timeout,
        })
    }

    /// Applies headers, cache policy, and timeout to a request builder.
    /// Skips any caller-supplied `Range` header — the driver sets its own
    /// when resuming, and a stale one would corrupt the byte accounting.
    pub fn apply(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut has_cache_control = false;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("range") {
                continue;
            }
            if key.eq_ignore_ascii_case("cache-control") {
                has_cache_control = true;
            }
            builder = builder.header(key, value);
        }
        if self.cache_policy == CachePolicy::ReloadIgnoringCache && !has_cache_control {
            builder = builder.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }
        if !self.timeout.is_zero() {
            builder = builder.timeout(self.timeout);
        }
        builder
    }
}

/// One batch's HTTP session: a configured client plus the task-event sender
/// the spawned drivers report back through. Dropping the session is the
/// invalidation step; the next batch builds a fresh one.
pub(crate) struct HttpSession {
    client: Client,
    events: mpsc::Sender<TaskEvent>,
}

impl HttpSession {
    pub fn new(config: &SessionConfig, events: mpsc::Sender<TaskEvent>) -> Self {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .tcp_nodelay(config.tcp_nodelay)
            .no_gzip()
            .no_deflate()
            .no_brotli()
            .build()
            .expect("failed to build HTTP client");
        Self { client, events }
    }

    /// Creates a suspended download task for `spec`.
    pub fn download(&self, spec: RequestSpec) -> TaskHandle {
        spawn_download(self.client.clone(), spec, self.events.clone(), None)
    }

    /// Creates a suspended download task primed with an opaque resume token.
    pub fn download_from_resume(&self, token: &[u8]) -> Result<TaskHandle, TransferError> {
        let token = ResumeToken::decode(token)?;
        let spec = token.spec()?;
        Ok(spawn_download(
            self.client.clone(),
            spec,
            self.events.clone(),
            Some(token),
        ))
    }

    /// Creates a suspended upload task whose body is the spool file's bytes.
    pub fn upload(&self, spec: RequestSpec, spool_path: PathBuf, spool_len: u64) -> TaskHandle {
        spawn_upload(
            self.client.clone(),
            spec,
            self.events.clone(),
            spool_path,
            spool_len,
        )
    }
}
