//! Ignore rules for paths excluded from synchronization.
//!
//! Certain files must never be diffed, uploaded, or deleted by sync: editor
//! backups, GeoPackage write-ahead logs of a database that is currently
//! open, compiled Python files, and OS metadata droppings. The rules are a
//! closed set of filename suffixes and exact names; there is no user-defined
//! pattern matching.

use std::path::Path;

/// Filename suffixes that are excluded from sync.
const IGNORED_EXTENSIONS: &[&str] = &["~", ".gpkg-shm", ".gpkg-wal", ".qgs~", ".qgz~", ".pyc"];

/// Exact file names that are excluded from sync.
const IGNORED_FILES: &[&str] = &[".DS_Store", ".directory"];

/// Returns true when the path must be excluded from all sync logic.
///
/// Only the final path component is examined; the function never touches the
/// filesystem.
pub fn is_ignored(path: &str) -> bool {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);

    if IGNORED_FILES.contains(&name) {
        return true;
    }
    IGNORED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_extensions() {
        assert!(is_ignored("data.gpkg-wal"));
        assert!(is_ignored("data.gpkg-shm"));
        assert!(is_ignored("project.qgs~"));
        assert!(is_ignored("project.qgz~"));
        assert!(is_ignored("script.pyc"));
        assert!(is_ignored("notes.txt~"));
    }

    #[test]
    fn test_ignored_names() {
        assert!(is_ignored(".DS_Store"));
        assert!(is_ignored(".directory"));
    }

    #[test]
    fn test_nested_paths_use_basename() {
        assert!(is_ignored("survey/data.gpkg-wal"));
        assert!(is_ignored("a/b/.DS_Store"));
        assert!(!is_ignored("survey/data.gpkg"));
    }

    #[test]
    fn test_regular_files_pass() {
        assert!(!is_ignored("readme.md"));
        assert!(!is_ignored("data.gpkg"));
        assert!(!is_ignored("project.qgz"));
        // suffix must match the end, not a middle segment
        assert!(!is_ignored("archive.pyc.bak"));
    }
}
