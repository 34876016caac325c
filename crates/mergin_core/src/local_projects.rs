//! Registry of locally downloaded projects.
//!
//! The engine needs to know which projects already have a working copy, in
//! which directory, and at what version. That bookkeeping belongs to the
//! embedding application (it usually wants to persist it together with its
//! own state), so the engine only talks to the object-safe [`LocalProjects`]
//! trait. [`InMemoryLocalProjects`] is a complete implementation suitable
//! for tests and short-lived tools; [`scan_data_dir`] rebuilds entries from
//! the metadata files on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::metadata::ProjectMetadata;

/// One locally downloaded project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProjectInfo {
    /// Directory of the working copy
    pub project_dir: PathBuf,
    /// Project name
    pub name: String,
    /// Owning namespace
    pub namespace: String,
    /// Version of the last synced metadata snapshot
    pub local_version: u32,
}

impl LocalProjectInfo {
    /// The `namespace/name` full name of this project.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Store of [`LocalProjectInfo`] entries the engine reads and writes.
pub trait LocalProjects: Send + Sync {
    /// Entry for a `namespace/name` full name, when the project is local.
    fn project(&self, full_name: &str) -> Option<LocalProjectInfo>;

    /// Insert or replace an entry.
    fn upsert(&self, info: LocalProjectInfo);

    /// Remove an entry (project directory deleted).
    fn remove(&self, full_name: &str);

    /// All known entries, in no particular order.
    fn all(&self) -> Vec<LocalProjectInfo>;
}

/// Thread-safe in-memory [`LocalProjects`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryLocalProjects {
    entries: Mutex<HashMap<String, LocalProjectInfo>>,
}

impl InMemoryLocalProjects {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated by scanning a data directory.
    pub fn from_data_dir(data_dir: &Path) -> Self {
        let store = Self::new();
        for info in scan_data_dir(data_dir) {
            store.upsert(info);
        }
        store
    }
}

impl LocalProjects for InMemoryLocalProjects {
    fn project(&self, full_name: &str) -> Option<LocalProjectInfo> {
        self.entries.lock().unwrap().get(full_name).cloned()
    }

    fn upsert(&self, info: LocalProjectInfo) {
        self.entries
            .lock()
            .unwrap()
            .insert(info.full_name(), info);
    }

    fn remove(&self, full_name: &str) {
        self.entries.lock().unwrap().remove(full_name);
    }

    fn all(&self) -> Vec<LocalProjectInfo> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

/// Rebuild project entries from the metadata files under a data directory.
///
/// Each immediate sub-directory holding a parseable `.mergin/metadata.json`
/// becomes one entry. The namespace and name are recovered from the stored
/// full name when present; directories without readable metadata are
/// skipped silently (they are not projects).
pub fn scan_data_dir(data_dir: &Path) -> Vec<LocalProjectInfo> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(_) => return found,
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let meta = match ProjectMetadata::read_from_project(&dir) {
            Ok(Some(meta)) => meta,
            _ => continue,
        };
        let name_file = dir.join(crate::metadata::METADATA_DIR).join("project");
        let full_name = fs::read_to_string(&name_file).unwrap_or_default();
        let (namespace, name) = match split_full_name(full_name.trim()) {
            Some(parts) => parts,
            // fall back to the directory name with an unknown namespace
            None => (
                String::new(),
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        };
        found.push(LocalProjectInfo {
            project_dir: dir,
            name,
            namespace,
            local_version: meta.version,
        });
    }
    found
}

/// Record the full name of the project owning a directory, so a later scan
/// can reconstruct the registry entry.
pub fn write_project_name_file(project_dir: &Path, full_name: &str) -> std::io::Result<()> {
    let dir = project_dir.join(crate::metadata::METADATA_DIR);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("project"), full_name)
}

/// Split a `namespace/name` string; also accepts a URL-ish string and takes
/// the last two path segments.
pub fn split_full_name(source: &str) -> Option<(String, String)> {
    let mut parts = source.split('/').filter(|p| !p.is_empty());
    let mut namespace = parts.next()?;
    let mut name = parts.next()?;
    for next in parts {
        namespace = name;
        name = next;
    }
    Some((namespace.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MerginFile;

    fn info(namespace: &str, name: &str, version: u32) -> LocalProjectInfo {
        LocalProjectInfo {
            project_dir: PathBuf::from("/data").join(name),
            name: name.to_string(),
            namespace: namespace.to_string(),
            local_version: version,
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let store = InMemoryLocalProjects::new();
        store.upsert(info("acme", "survey", 3));

        let found = store.project("acme/survey").unwrap();
        assert_eq!(found.local_version, 3);
        assert!(store.project("acme/other").is_none());

        store.upsert(info("acme", "survey", 4));
        assert_eq!(store.project("acme/survey").unwrap().local_version, 4);
        assert_eq!(store.all().len(), 1);

        store.remove("acme/survey");
        assert!(store.project("acme/survey").is_none());
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(
            split_full_name("acme/survey"),
            Some(("acme".to_string(), "survey".to_string()))
        );
        assert_eq!(
            split_full_name("https://example.com/projects/acme/survey"),
            Some(("acme".to_string(), "survey".to_string()))
        );
        assert_eq!(split_full_name("loner"), None);
        assert_eq!(split_full_name(""), None);
    }

    #[test]
    fn test_scan_data_dir_recovers_entries() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = data_dir.path().join("survey");
        std::fs::create_dir_all(&project_dir).unwrap();

        let mut meta = ProjectMetadata::new(5);
        meta.insert(MerginFile::new("a.txt", "abc", 3));
        meta.write_to_project(&project_dir).unwrap();
        write_project_name_file(&project_dir, "acme/survey").unwrap();

        // a non-project directory is skipped
        std::fs::create_dir_all(data_dir.path().join("random")).unwrap();

        let found = scan_data_dir(data_dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].full_name(), "acme/survey");
        assert_eq!(found[0].local_version, 5);
        assert_eq!(found[0].project_dir, project_dir);
    }
}
