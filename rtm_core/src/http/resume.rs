use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::session::RequestSpec;
use crate::types::{CachePolicy, TransferError};

/// Payload behind the opaque resume-token bytes handed to callers.
///
/// Captures enough of the interrupted attempt to rebuild the request and
/// continue appending to the part file with a `Range` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResumeToken {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cache_policy: CachePolicy,
    pub timeout_secs: u64,
    pub part_path: PathBuf,
    pub received: u64,
    pub total_expected: u64,
    pub etag: Option<String>,
}

impl ResumeToken {
    pub fn from_attempt(
        spec: &RequestSpec,
        part_path: &Path,
        received: u64,
        total_expected: u64,
        etag: Option<&str>,
    ) -> Self {
        Self {
            url: spec.url.to_string(),
            headers: spec.headers.clone(),
            cache_policy: spec.cache_policy,
            timeout_secs: spec.timeout.as_secs(),
            part_path: part_path.to_path_buf(),
            received,
            total_expected,
            etag: etag.map(str::to_string),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("resume token encoding")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        serde_json::from_slice(bytes)
            .map_err(|_| TransferError::Failure("malformed resume token".to_string()))
    }

    pub fn spec(&self) -> Result<RequestSpec, TransferError> {
        RequestSpec::parse(
            &self.url,
            self.headers.clone(),
            self.cache_policy,
            Duration::from_secs(self.timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let spec = RequestSpec::parse(
            "http://host/big.bin",
            HashMap::from([("X-Key".to_string(), "1".to_string())]),
            CachePolicy::ReloadIgnoringCache,
            Duration::from_secs(30),
        )
        .unwrap();
        let token = ResumeToken::from_attempt(
            &spec,
            Path::new("/tmp/big.part"),
            4096,
            1_000_000,
            Some("\"etag-1\""),
        );

        let decoded = ResumeToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded.received, 4096);
        assert_eq!(decoded.total_expected, 1_000_000);
        assert_eq!(decoded.etag.as_deref(), Some("\"etag-1\""));

        let rebuilt = decoded.spec().unwrap();
        assert_eq!(rebuilt.url.as_str(), "http://host/big.bin");
        assert_eq!(rebuilt.headers.get("X-Key").map(String::as_str), Some("1"));
        assert_eq!(rebuilt.timeout, Duration::from_secs(30));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(ResumeToken::decode(b"not a token").is_err());
    }
}
