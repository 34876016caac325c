//! Project metadata snapshots and local file listing.
//!
//! A metadata snapshot is the server's description of one project version:
//! the version number plus one entry per file with its size, checksum and
//! (for uploads) chunk plan. The snapshot that was current at the end of the
//! last successful sync is persisted inside the project directory at
//! `.mergin/metadata.json`; the path convention is fixed for compatibility
//! with other Mergin clients.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::{MerginError, Result};
use crate::ignore;

/// Directory inside a project that holds engine state.
pub const METADATA_DIR: &str = ".mergin";

/// Metadata file name inside [`METADATA_DIR`].
pub const METADATA_FILE: &str = "metadata.json";

/// Hidden directory for download staging, sibling of the user files.
pub const TEMP_DIR: &str = ".temp";

/// One file entry of a metadata snapshot.
///
/// `path` is project-relative with forward slashes, never absolute and never
/// containing `..`. `chunks` holds the ordered upload chunk ids and is empty
/// on entries that only describe server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerginFile {
    /// Project-relative path, forward slashes
    pub path: String,
    /// SHA-1 content checksum, lowercase hex
    pub checksum: String,
    /// File size in bytes
    pub size: u64,
    /// Ordered upload chunk ids; order defines transfer order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
}

impl MerginFile {
    /// Create an entry without a chunk plan.
    pub fn new(path: impl Into<String>, checksum: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            checksum: checksum.into(),
            size,
            chunks: Vec::new(),
        }
    }
}

/// Parsed snapshot of one project version.
///
/// Within one snapshot every path appears at most once; the map keyed by
/// path enforces that for programmatic construction, and parsing rejects
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MetadataJson", into = "MetadataJson")]
pub struct ProjectMetadata {
    /// Server version this snapshot describes
    pub version: u32,
    files: BTreeMap<String, MerginFile>,
}

/// Wire form of a snapshot: `{"version": "v2", "files": [...]}`.
#[derive(Clone, Serialize, Deserialize)]
struct MetadataJson {
    #[serde(with = "version_string")]
    version: u32,
    files: Vec<MerginFile>,
}

impl TryFrom<MetadataJson> for ProjectMetadata {
    type Error = String;

    fn try_from(json: MetadataJson) -> std::result::Result<Self, String> {
        let mut files = BTreeMap::new();
        for file in json.files {
            if !is_safe_relative_path(&file.path) {
                return Err(format!("unsafe file path in metadata: '{}'", file.path));
            }
            if files.insert(file.path.clone(), file).is_some() {
                return Err("duplicate file path in metadata".to_string());
            }
        }
        Ok(ProjectMetadata {
            version: json.version,
            files,
        })
    }
}

impl From<ProjectMetadata> for MetadataJson {
    fn from(meta: ProjectMetadata) -> Self {
        MetadataJson {
            version: meta.version,
            files: meta.files.into_values().collect(),
        }
    }
}

impl ProjectMetadata {
    /// Create an empty snapshot at the given version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            files: BTreeMap::new(),
        }
    }

    /// Parse a snapshot from JSON bytes.
    ///
    /// `origin` names the source (file path or URL) for the
    /// [`MerginError::MetadataCorrupt`] error on failure.
    pub fn parse(data: &[u8], origin: &str) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| MerginError::MetadataCorrupt {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize to the canonical pretty JSON used on disk.
    ///
    /// Entries are emitted sorted by path, so serialize → parse → serialize
    /// is byte-identical.
    pub fn to_json(&self) -> String {
        let mut out = serde_json::to_string_pretty(self).unwrap_or_default();
        out.push('\n');
        out
    }

    /// Path of the metadata file inside a project directory.
    pub fn path_in(project_dir: &Path) -> PathBuf {
        project_dir.join(METADATA_DIR).join(METADATA_FILE)
    }

    /// Read the persisted snapshot of a project directory.
    ///
    /// Returns `Ok(None)` when no metadata file exists (project never
    /// synced); parse failures surface as [`MerginError::MetadataCorrupt`].
    pub fn read_from_project(project_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(project_dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MerginError::local_io(&path, e)),
        };
        Self::parse(&data, &path.to_string_lossy()).map(Some)
    }

    /// Persist the snapshot into a project directory.
    ///
    /// Written to a temporary sibling first and renamed into place, so a
    /// crash never leaves a half-written metadata file.
    pub fn write_to_project(&self, project_dir: &Path) -> Result<()> {
        let path = Self::path_in(project_dir);
        let dir = path.parent().unwrap_or(project_dir);
        fs::create_dir_all(dir).map_err(|e| MerginError::local_io(dir, e))?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| MerginError::local_io(&tmp, e))?;
            file.write_all(self.to_json().as_bytes())
                .map_err(|e| MerginError::local_io(&tmp, e))?;
            file.sync_all().map_err(|e| MerginError::local_io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| MerginError::local_io(&path, e))
    }

    /// Look up an entry by project-relative path.
    pub fn file(&self, path: &str) -> Option<&MerginFile> {
        self.files.get(path)
    }

    /// Iterate entries in path order.
    pub fn files(&self) -> impl Iterator<Item = &MerginFile> {
        self.files.values()
    }

    /// Entries as an owned, path-sorted list.
    pub fn files_vec(&self) -> Vec<MerginFile> {
        self.files.values().cloned().collect()
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, file: MerginFile) {
        self.files.insert(file.path.clone(), file);
    }

    /// Remove an entry; returns it when present.
    pub fn remove(&mut self, path: &str) -> Option<MerginFile> {
        self.files.remove(path)
    }

    /// Whether an entry exists for the path.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the snapshot has no entries.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// One project in the server listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectListEntry {
    /// Project name
    pub name: String,
    /// Owning namespace
    pub namespace: String,
    /// Latest version available on the server
    #[serde(with = "version_string")]
    pub version: u32,
    /// Server-side user id of the project owner
    #[serde(default)]
    pub creator: Option<i64>,
    /// Server-side user ids with write access
    #[serde(default)]
    pub writers: Vec<i64>,
    /// When the latest version was created on the server
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl ProjectListEntry {
    /// The `namespace/name` full name of this project.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Entry paths must stay inside the project directory: relative, forward
/// slashes, no `.`/`..` components, no empty components.
fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Serde helper for the server's `"v{N}"` version strings.
pub(crate) mod version_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("v{}", version))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid version '{}'", s)))
    }

    /// Parse `"v3"` (or a bare `"3"`) into an integer version.
    pub fn parse(s: &str) -> Option<u32> {
        s.strip_prefix('v').unwrap_or(s).parse().ok()
    }
}

/// Enumerate the files of a working directory as metadata entries.
///
/// Walks the tree recursively, skipping the `.mergin` and `.temp` subtrees
/// and every path matching the ignore rules, and computes a fresh checksum
/// for each file. Entries come back sorted by path.
pub fn list_local_files(project_dir: &Path) -> Result<Vec<MerginFile>> {
    let mut files = Vec::new();
    if project_dir.is_dir() {
        walk(project_dir, project_dir, &mut files)?;
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<MerginFile>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| MerginError::local_io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| MerginError::local_io(dir, e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if path.is_dir() {
            if name == METADATA_DIR || name == TEMP_DIR {
                continue;
            }
            walk(root, &path, out)?;
        } else {
            if ignore::is_ignored(&name) {
                continue;
            }
            let rel = relative_slash_path(root, &path);
            let size = entry
                .metadata()
                .map_err(|e| MerginError::local_io(&path, e))?
                .len();
            let checksum = checksum::file_checksum(&path)?;
            out.push(MerginFile::new(rel, checksum, size));
        }
    }
    Ok(())
}

/// Project-relative path with forward slashes, for cross-platform metadata.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ProjectMetadata {
        let mut meta = ProjectMetadata::new(3);
        meta.insert(MerginFile::new("b/two.txt", "bbbb", 20));
        meta.insert(MerginFile::new("one.txt", "aaaa", 10));
        meta
    }

    #[test]
    fn test_parse_server_json() {
        let json = br#"{
            "name": "survey",
            "namespace": "acme",
            "version": "v7",
            "files": [
                {"path": "a.txt", "checksum": "abc", "size": 5},
                {"path": "b/c.dat", "checksum": "def", "size": 9}
            ]
        }"#;
        let meta = ProjectMetadata::parse(json, "server").unwrap();
        assert_eq!(meta.version, 7);
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.file("a.txt").unwrap().checksum, "abc");
        assert_eq!(meta.file("b/c.dat").unwrap().size, 9);
    }

    #[test]
    fn test_parse_rejects_duplicate_paths() {
        let json = br#"{"version": "v1", "files": [
            {"path": "a.txt", "checksum": "x", "size": 1},
            {"path": "a.txt", "checksum": "y", "size": 2}
        ]}"#;
        let err = ProjectMetadata::parse(json, "server").unwrap_err();
        assert!(matches!(err, MerginError::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_parse_rejects_escaping_paths() {
        for path in ["../evil", "/etc/passwd", "a/../b", "a//b", "a\\b"] {
            let json = format!(
                r#"{{"version": "v1", "files": [{{"path": "{}", "checksum": "x", "size": 1}}]}}"#,
                path.replace('\\', "\\\\")
            );
            let result = ProjectMetadata::parse(json.as_bytes(), "server");
            assert!(result.is_err(), "path '{}' should be rejected", path);
        }
    }

    #[test]
    fn test_parse_garbage_is_corrupt() {
        let err = ProjectMetadata::parse(b"not json", "meta.json").unwrap_err();
        match err {
            MerginError::MetadataCorrupt { path, .. } => assert_eq!(path, "meta.json"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_serialize_roundtrip_byte_identical() {
        let meta = sample_metadata();
        let json = meta.to_json();
        let parsed = ProjectMetadata::parse(json.as_bytes(), "roundtrip").unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.to_json(), json);
    }

    #[test]
    fn test_version_string_forms() {
        assert_eq!(version_string::parse("v12"), Some(12));
        assert_eq!(version_string::parse("0"), Some(0));
        assert_eq!(version_string::parse("v"), None);
        assert_eq!(version_string::parse("vx"), None);
    }

    #[test]
    fn test_write_and_read_project_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_metadata();
        meta.write_to_project(dir.path()).unwrap();

        assert!(ProjectMetadata::path_in(dir.path()).is_file());
        let read = ProjectMetadata::read_from_project(dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(read, meta);
    }

    #[test]
    fn test_read_missing_metadata_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectMetadata::read_from_project(dir.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_local_files_skips_internal_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::create_dir_all(dir.path().join(".mergin")).unwrap();
        fs::create_dir_all(dir.path().join(".temp/x")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();
        fs::write(dir.path().join("data.gpkg-wal"), b"wal").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        fs::write(dir.path().join(".mergin/metadata.json"), b"{}").unwrap();
        fs::write(dir.path().join(".temp/x/partial"), b"bytes").unwrap();

        let files = list_local_files(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].checksum, crate::checksum::checksum_bytes(b"hello"));
    }

    #[test]
    fn test_list_local_files_missing_dir_is_empty() {
        let files = list_local_files(Path::new("/nonexistent/project")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_project_list_entry_full_name() {
        let json = br#"[{"name": "survey", "namespace": "acme", "version": "v4"}]"#;
        let list: Vec<ProjectListEntry> = serde_json::from_slice(json).unwrap();
        assert_eq!(list[0].full_name(), "acme/survey");
        assert_eq!(list[0].version, 4);
        assert!(list[0].writers.is_empty());
    }
}
