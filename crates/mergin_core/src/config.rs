use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default Mergin instance used when no API root is configured.
pub const DEFAULT_API_ROOT: &str = "https://public.cloudmergin.com/";

/// Engine configuration
///
/// Holds the server to talk to and the local directory under which all
/// project directories live (one sub-directory per project).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the Mergin server, with trailing slash
    pub api_root: String,

    /// Local directory containing all project directories
    pub data_dir: PathBuf,
}

impl ApiConfig {
    /// Create a config for the given server and data directory.
    ///
    /// A missing trailing slash on `api_root` is added so endpoint paths can
    /// be appended directly.
    pub fn new(api_root: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let mut api_root = api_root.into();
        if !api_root.ends_with('/') {
            api_root.push('/');
        }
        Self {
            api_root,
            data_dir: data_dir.into(),
        }
    }

    /// Config pointing at the public Mergin instance.
    pub fn public(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(DEFAULT_API_ROOT, data_dir)
    }

    /// Build a full URL for an endpoint path relative to the API root.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path.trim_start_matches('/'))
    }
}
