//! Three-way project diff.
//!
//! Compares project files from three sources:
//! - the "old" server version (what the last sync downloaded), read from the
//!   project directory's stored metadata,
//! - the "new" server version (what is on the server right now), freshly
//!   fetched,
//! - the local files (what is in the project directory right now), listed on
//!   the fly.
//!
//! With only two of the sources it is possible to miss updates that need
//! handling (concurrent edits in particular); the three-way comparison
//! assigns every path to exactly one kind of change. Unchanged paths are
//! absent from the diff.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ignore;
use crate::metadata::MerginFile;

/// Classification of every changed path, partitioned into ten disjoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectDiff {
    /// Created locally; to upload
    pub local_added: BTreeSet<String>,
    /// Modified locally; to upload
    pub local_updated: BTreeSet<String>,
    /// Deleted locally; to remove on the server
    pub local_deleted: BTreeSet<String>,

    /// Created on the server; to download
    pub remote_added: BTreeSet<String>,
    /// Modified on the server; to download
    pub remote_updated: BTreeSet<String>,
    /// Deleted on the server; to remove locally
    pub remote_deleted: BTreeSet<String>,

    /// Both sides modified; resolved by keeping the remote file and copying
    /// the local one aside under a conflict name
    pub conflict_remote_updated_local_updated: BTreeSet<String>,
    /// Both sides created the same path; resolved like a double update
    pub conflict_remote_added_local_added: BTreeSet<String>,

    /// Server deleted, local modified; resolved by keeping the local file
    pub conflict_remote_deleted_local_updated: BTreeSet<String>,
    /// Server modified, local deleted; resolved by keeping the server file
    pub conflict_remote_updated_local_deleted: BTreeSet<String>,
}

impl ProjectDiff {
    /// True when no path changed on either side.
    pub fn is_empty(&self) -> bool {
        self.local_added.is_empty()
            && self.local_updated.is_empty()
            && self.local_deleted.is_empty()
            && self.remote_added.is_empty()
            && self.remote_updated.is_empty()
            && self.remote_deleted.is_empty()
            && self.conflict_remote_updated_local_updated.is_empty()
            && self.conflict_remote_added_local_added.is_empty()
            && self.conflict_remote_deleted_local_updated.is_empty()
            && self.conflict_remote_updated_local_deleted.is_empty()
    }

    /// True when anything needs to be pushed.
    pub fn has_local_changes(&self) -> bool {
        !self.local_added.is_empty()
            || !self.local_updated.is_empty()
            || !self.local_deleted.is_empty()
    }

    /// Paths that must be downloaded: plain remote changes plus the remote
    /// side of copy-resolved conflicts.
    pub fn download_paths(&self) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        paths.extend(self.remote_added.iter().cloned());
        paths.extend(self.remote_updated.iter().cloned());
        paths.extend(self.conflict_remote_updated_local_updated.iter().cloned());
        paths.extend(self.conflict_remote_added_local_added.iter().cloned());
        paths.extend(self.conflict_remote_updated_local_deleted.iter().cloned());
        paths
    }

    /// Paths whose local file must be preserved as a conflict copy before
    /// the server file overwrites it.
    pub fn conflict_copy_paths(&self) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        paths.extend(self.conflict_remote_updated_local_updated.iter().cloned());
        paths.extend(self.conflict_remote_added_local_added.iter().cloned());
        paths
    }

    /// Multi-line summary, one line per category with counts.
    pub fn dump(&self) -> String {
        format!(
            "--- project diff ---\n\
             local: {} added, {} updated, {} deleted\n\
             remote: {} added, {} updated, {} deleted\n\
             conflicts: {} RU-LU, {} RA-LA, {} RD-LU, {} RU-LD",
            self.local_added.len(),
            self.local_updated.len(),
            self.local_deleted.len(),
            self.remote_added.len(),
            self.remote_updated.len(),
            self.remote_deleted.len(),
            self.conflict_remote_updated_local_updated.len(),
            self.conflict_remote_added_local_added.len(),
            self.conflict_remote_deleted_local_updated.len(),
            self.conflict_remote_updated_local_deleted.len(),
        )
    }
}

/// Compute the three-way diff over old-server, new-server and local files.
///
/// Pure and deterministic: the result depends only on the (path, checksum)
/// pairs of the inputs, not on their ordering. Ignored paths are excluded
/// from all three inputs before comparison.
pub fn compare_project_files(
    old_server: &[MerginFile],
    new_server: &[MerginFile],
    local: &[MerginFile],
) -> ProjectDiff {
    let old = checksum_map(old_server);
    let new = checksum_map(new_server);
    let local = checksum_map(local);

    let mut paths: BTreeSet<&str> = BTreeSet::new();
    paths.extend(old.keys());
    paths.extend(new.keys());
    paths.extend(local.keys());

    let mut diff = ProjectDiff::default();
    for path in paths {
        let key = path.to_string();
        match (old.get(path), new.get(path), local.get(path)) {
            // server created a file we do not have
            (None, Some(_), None) => {
                diff.remote_added.insert(key);
            }
            // both sides created the same path independently
            (None, Some(new_chk), Some(local_chk)) => {
                if new_chk != local_chk {
                    diff.conflict_remote_added_local_added.insert(key);
                }
            }
            // created locally, unknown to the server
            (None, None, Some(_)) => {
                diff.local_added.insert(key);
            }
            // server deleted; keep or drop depending on local edits
            (Some(old_chk), None, Some(local_chk)) => {
                if local_chk == old_chk {
                    diff.remote_deleted.insert(key);
                } else {
                    diff.conflict_remote_deleted_local_updated.insert(key);
                }
            }
            // deleted locally; fine unless the server changed it meanwhile
            (Some(old_chk), Some(new_chk), None) => {
                if new_chk == old_chk {
                    diff.local_deleted.insert(key);
                } else {
                    diff.conflict_remote_updated_local_deleted.insert(key);
                }
            }
            // gone everywhere
            (Some(_), None, None) => {}
            (None, None, None) => unreachable!("path came from one of the maps"),
            // present everywhere: compare all three checksums
            (Some(old_chk), Some(new_chk), Some(local_chk)) => {
                let remote_changed = new_chk != old_chk;
                let local_changed = local_chk != old_chk;
                match (remote_changed, local_changed) {
                    (false, false) => {}
                    (true, false) => {
                        diff.remote_updated.insert(key);
                    }
                    (false, true) => {
                        diff.local_updated.insert(key);
                    }
                    (true, true) => {
                        // both edited to identical content collapses to a no-op
                        if new_chk != local_chk {
                            diff.conflict_remote_updated_local_updated.insert(key);
                        }
                    }
                }
            }
        }
    }
    diff
}

fn checksum_map(files: &[MerginFile]) -> BTreeMap<&str, &str> {
    files
        .iter()
        .filter(|f| !ignore::is_ignored(&f.path))
        .map(|f| (f.path.as_str(), f.checksum.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, checksum: &str) -> MerginFile {
        MerginFile::new(path, checksum, 10)
    }

    fn all_sets(diff: &ProjectDiff) -> Vec<&BTreeSet<String>> {
        vec![
            &diff.local_added,
            &diff.local_updated,
            &diff.local_deleted,
            &diff.remote_added,
            &diff.remote_updated,
            &diff.remote_deleted,
            &diff.conflict_remote_updated_local_updated,
            &diff.conflict_remote_added_local_added,
            &diff.conflict_remote_deleted_local_updated,
            &diff.conflict_remote_updated_local_deleted,
        ]
    }

    #[test]
    fn test_no_changes() {
        let files = vec![file("a.txt", "h1"), file("b.txt", "h2")];
        let diff = compare_project_files(&files, &files, &files);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_remote_added() {
        let diff = compare_project_files(&[], &[file("a.txt", "h1")], &[]);
        assert!(diff.remote_added.contains("a.txt"));
    }

    #[test]
    fn test_local_added() {
        let diff = compare_project_files(&[], &[], &[file("a.txt", "h1")]);
        assert!(diff.local_added.contains("a.txt"));
    }

    #[test]
    fn test_both_added_same_content_is_noop() {
        let diff = compare_project_files(&[], &[file("a.txt", "h1")], &[file("a.txt", "h1")]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_both_added_different_content_conflicts() {
        let diff = compare_project_files(&[], &[file("x.txt", "h2")], &[file("x.txt", "h1")]);
        assert!(diff.conflict_remote_added_local_added.contains("x.txt"));
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_remote_deleted_vs_local_unchanged() {
        let old = vec![file("r.txt", "h0")];
        let diff = compare_project_files(&old, &[], &old);
        assert!(diff.remote_deleted.contains("r.txt"));
    }

    #[test]
    fn test_remote_deleted_vs_local_updated() {
        let diff = compare_project_files(&[file("r.txt", "h0")], &[], &[file("r.txt", "h1")]);
        assert!(diff.conflict_remote_deleted_local_updated.contains("r.txt"));
    }

    #[test]
    fn test_local_deleted_vs_remote_unchanged() {
        let old = vec![file("d.txt", "h0")];
        let diff = compare_project_files(&old, &old, &[]);
        assert!(diff.local_deleted.contains("d.txt"));
    }

    #[test]
    fn test_local_deleted_vs_remote_updated() {
        let diff =
            compare_project_files(&[file("d.txt", "h0")], &[file("d.txt", "h1")], &[]);
        assert!(diff.conflict_remote_updated_local_deleted.contains("d.txt"));
    }

    #[test]
    fn test_gone_everywhere_is_omitted() {
        let diff = compare_project_files(&[file("gone.txt", "h0")], &[], &[]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_three_way_matrix() {
        let old = vec![file("a", "0"), file("b", "0"), file("c", "0"), file("d", "0")];
        let new = vec![file("a", "0"), file("b", "1"), file("c", "0"), file("d", "1")];
        let local = vec![file("a", "0"), file("b", "0"), file("c", "1"), file("d", "2")];

        let diff = compare_project_files(&old, &new, &local);
        assert!(!all_sets(&diff).iter().any(|s| s.contains("a")));
        assert!(diff.remote_updated.contains("b"));
        assert!(diff.local_updated.contains("c"));
        assert!(diff.conflict_remote_updated_local_updated.contains("d"));
    }

    #[test]
    fn test_both_updated_to_same_content_is_noop() {
        let diff = compare_project_files(
            &[file("a", "0")],
            &[file("a", "1")],
            &[file("a", "1")],
        );
        assert!(diff.is_empty());
    }

    #[test]
    fn test_disjointness() {
        // exercise every branch at once and verify each path lands in at
        // most one set
        let old = vec![
            file("three_same", "0"),
            file("remote_upd", "0"),
            file("local_upd", "0"),
            file("both_upd", "0"),
            file("remote_del", "0"),
            file("del_vs_upd", "0"),
            file("upd_vs_del", "0"),
            file("local_del", "0"),
            file("gone", "0"),
        ];
        let new = vec![
            file("three_same", "0"),
            file("remote_upd", "1"),
            file("local_upd", "0"),
            file("both_upd", "1"),
            file("upd_vs_del", "1"),
            file("local_del", "0"),
            file("remote_add", "1"),
            file("both_add", "1"),
        ];
        let local = vec![
            file("three_same", "0"),
            file("remote_upd", "0"),
            file("local_upd", "1"),
            file("both_upd", "2"),
            file("remote_del", "0"),
            file("del_vs_upd", "1"),
            file("local_add", "1"),
            file("both_add", "2"),
        ];

        let diff = compare_project_files(&old, &new, &local);
        let sets = all_sets(&diff);
        let mut seen = BTreeSet::new();
        for set in &sets {
            for path in set.iter() {
                assert!(seen.insert(path.clone()), "path '{}' in two sets", path);
            }
        }
        assert_eq!(seen.len(), 10); // every path except the unchanged + gone ones
    }

    #[test]
    fn test_order_independence() {
        let mut old = vec![file("a", "0"), file("b", "0")];
        let mut local = vec![file("b", "1"), file("a", "0")];
        let new = vec![file("a", "1"), file("b", "0")];

        let forward = compare_project_files(&old, &new, &local);
        old.reverse();
        local.reverse();
        let reversed = compare_project_files(&old, &new, &local);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_ignored_paths_excluded() {
        let local = vec![file("data.gpkg-wal", "h1"), file(".DS_Store", "h2")];
        let new = vec![file("data.gpkg-wal", "h3")];
        let diff = compare_project_files(&[], &new, &local);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_dump_counts() {
        let diff = compare_project_files(&[], &[file("a", "1")], &[file("b", "2")]);
        let dump = diff.dump();
        assert!(dump.contains("local: 1 added"));
        assert!(dump.contains("remote: 1 added"));
    }
}
