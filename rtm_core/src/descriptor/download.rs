use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::CachePolicy;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fallback file name when the source URL has no usable path segment.
const FALLBACK_FILE_NAME: &str = "download";

/// Immutable description of one download.
///
/// Two download records are considered the same transfer when all of these
/// fields match, so equality derives over the full struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Downloadable {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
    /// Directory to save into; `None` keeps the bytes in-memory only.
    pub directory: Option<PathBuf>,
    /// Overrides the name derived from the URL's last path segment.
    pub file_name: Option<String>,
}

impl Downloadable {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            directory: None,
            file_name: None,
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

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// The name the downloaded file is saved under: the explicit override if
    /// set, otherwise the last path segment of the URL.
    pub fn resolved_file_name(&self) -> String {
        if let Some(name) = &self.file_name {
            return name.clone();
        }
        let no_query = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        let after_scheme = no_query
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(no_query);
        let path = after_scheme
            .split_once('/')
            .map(|(_, path)| path)
            .unwrap_or("");
        path.rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_string()
    }

    /// Full destination path (`directory` joined with the resolved name), if
    /// a directory was configured.
    pub fn destination(&self) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(self.resolved_file_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_defaults_to_last_path_segment() {
        let d = Downloadable::new("http://host/files/archive.tar.gz");
        assert_eq!(d.resolved_file_name(), "archive.tar.gz");
    }

    #[test]
    fn file_name_ignores_query_and_fragment() {
        let d = Downloadable::new("http://host/a/b.bin?token=x#frag");
        assert_eq!(d.resolved_file_name(), "b.bin");
    }

    #[test]
    fn file_name_falls_back_when_url_has_no_path() {
        let d = Downloadable::new("http://host/");
        assert_eq!(d.resolved_file_name(), "download");
    }

    #[test]
    fn explicit_file_name_wins() {
        let d = Downloadable::new("http://host/x.bin").with_file_name("renamed.bin");
        assert_eq!(d.resolved_file_name(), "renamed.bin");
        let dest = d.with_directory("/tmp/out").destination().unwrap();
        assert_eq!(dest, PathBuf::from("/tmp/out/renamed.bin"));
    }

    #[test]
    fn identity_covers_all_request_fields() {
        let a = Downloadable::new("http://host/x").with_timeout(Duration::from_secs(5));
        let b = Downloadable::new("http://host/x").with_timeout(Duration::from_secs(5));
        assert_eq!(a, b);
        assert_ne!(a, b.clone().add_header("X-Key", "1"));
    }
}
