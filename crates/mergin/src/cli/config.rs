//! CLI configuration persisted as TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Settings the CLI keeps between invocations.
///
/// Note: the password is stored in plain text in the config file, the same
/// trade-off the desktop client makes. Point `--config` at a file with
/// restrictive permissions, or skip `login` and export
/// `MERGIN_PASSWORD` for the session instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Server to talk to; the public Mergin instance when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_root: Option<String>,

    /// Directory holding all project directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Stored login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Stored password (see the struct docs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CliConfig {
    /// Load the config from a TOML file; missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        match fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| format!("Could not parse {}: {}", path.display(), e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(format!("Could not read {}: {}", path.display(), e)),
        }
    }

    /// Write the config back.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Could not serialize config: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Could not create {}: {}", parent.display(), e))?;
        }
        fs::write(path, content).map_err(|e| format!("Could not write {}: {}", path.display(), e))
    }

    /// Directory all projects live in (`./mergin-projects` by default).
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("mergin-projects"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let config = CliConfig::load(Path::new("/nonexistent/mergin.toml")).unwrap();
        assert!(config.username.is_none());
        assert_eq!(config.data_dir(), PathBuf::from("mergin-projects"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mergin.toml");

        let config = CliConfig {
            api_root: Some("https://example.com/".to_string()),
            data_dir: Some(PathBuf::from("/data")),
            username: Some("alice".to_string()),
            password: None,
        };
        config.save(&path).unwrap();

        let loaded = CliConfig::load(&path).unwrap();
        assert_eq!(loaded.api_root.as_deref(), Some("https://example.com/"));
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert!(loaded.password.is_none());
    }
}
