use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

use crate::descriptor::download::DEFAULT_TIMEOUT;
use crate::types::CachePolicy;

/// Default cap on the spooled multipart body.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// What goes into the multipart body of an upload.
#[derive(Debug, Clone)]
pub enum UploadPayload {
    /// In-memory bytes posted as a single file part.
    Data {
        bytes: Bytes,
        field_name: String,
        file_name: String,
        mime: String,
    },
    /// A single local file; mime inferred from its extension.
    File { path: PathBuf, field_name: String },
    /// Several local files under one field name.
    Files { paths: Vec<PathBuf>, field_name: String },
}

/// Immutable description of one multipart upload.
///
/// Upload identity is the freshly generated record id, not the descriptor,
/// so there is no equality derive here.
#[derive(Debug, Clone)]
pub struct Uploadable {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
    pub payload: UploadPayload,
    /// Plain text parts written before the payload, in this order.
    pub parameters: Vec<(String, String)>,
    /// Spool files larger than this fail before the task is created.
    pub max_bytes: u64,
}

impl Uploadable {
    pub fn new(url: impl Into<String>, payload: UploadPayload) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            payload,
            parameters: Vec::new(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn add_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn add_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}
