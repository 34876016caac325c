//! Pull protocol: bring the working copy up to the server version.
//!
//! The pull fetches the server metadata, diffs it against the stored
//! snapshot and the current local files, downloads every changed file
//! chunk-by-chunk into a hidden staging directory, and only then touches the
//! working copy. The apply phase is ordered so an interruption never leaves
//! a mix of old and new content without the conflict copies in place:
//! conflict renames happen first, then staged files move in, then
//! server-side deletions are carried out, then the new metadata snapshot is
//! written.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::MerginApi;
use crate::checksum;
use crate::diff::compare_project_files;
use crate::error::{MerginError, Result};
use crate::http::{encode_query_component, CancelToken, HttpRequest};
use crate::local_projects::{write_project_name_file, LocalProjectInfo};
use crate::metadata::{self, MerginFile, ProjectMetadata, TEMP_DIR};
use crate::transaction::{SyncStage, TransactionHandle};

/// What a successful pull produced.
#[derive(Debug)]
pub(crate) struct PullOutcome {
    /// Local project directory (freshly created on first download)
    pub project_dir: PathBuf,
    /// Metadata snapshot that is now current
    pub metadata: ProjectMetadata,
    /// True when no local copy existed before
    pub first_download: bool,
    /// True when the working copy was modified (downloads or deletions)
    pub changed: bool,
}

/// Run the pull protocol for one project inside an existing transaction.
///
/// Terminal stage and event emission stay with the caller; this function
/// cleans up its own staging area (and the whole project directory on a
/// failed first download).
pub(crate) async fn execute(
    api: &MerginApi,
    namespace: &str,
    name: &str,
    handle: &TransactionHandle,
) -> Result<PullOutcome> {
    let cancel = handle.cancel_token();
    let full_name = MerginApi::full_project_name(namespace, name);

    handle.set_stage(SyncStage::FetchingInfo);
    let info_url = api.url(&format!("v1/project/{}/{}", namespace, name));
    let response = api
        .send_authorized(HttpRequest::get(&info_url), &cancel)
        .await?;
    let new_meta = ProjectMetadata::parse(&response.body, &info_url)?;
    debug!(project = %full_name, version = new_meta.version, "fetched server metadata");

    let (project_dir, first_download) = match api.local_projects().project(&full_name) {
        Some(info) => (info.project_dir, false),
        None => (create_unique_project_dir(&api.config().data_dir, name)?, true),
    };
    handle.update(|t| {
        t.project_dir = project_dir.clone();
        t.first_time_download = first_download;
        t.version = new_meta.version;
        t.new_metadata = Some(new_meta.clone());
    });

    let staging_dir = project_dir.join(TEMP_DIR).join(Uuid::new_v4().to_string());
    handle.update(|t| t.staging_dir = Some(staging_dir.clone()));

    let result = transfer_and_apply(
        api,
        handle,
        &full_name,
        namespace,
        name,
        &project_dir,
        &staging_dir,
        &new_meta,
        &cancel,
    )
    .await;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            remove_staging(&staging_dir);
            if first_download {
                if let Err(e) = fs::remove_dir_all(&project_dir) {
                    warn!(dir = %project_dir.display(), error = %e,
                        "could not remove project directory after failed first download");
                }
                api.local_projects().remove(&full_name);
            }
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn transfer_and_apply(
    api: &MerginApi,
    handle: &TransactionHandle,
    full_name: &str,
    namespace: &str,
    name: &str,
    project_dir: &Path,
    staging_dir: &Path,
    new_meta: &ProjectMetadata,
    cancel: &CancelToken,
) -> Result<PullOutcome> {
    let old_meta = ProjectMetadata::read_from_project(project_dir)?.unwrap_or_default();
    let local_files = metadata::list_local_files(project_dir)?;
    let diff = compare_project_files(&old_meta.files_vec(), &new_meta.files_vec(), &local_files);
    debug!(project = %full_name, "{}", diff.dump());

    let to_download: Vec<MerginFile> = diff
        .download_paths()
        .iter()
        .filter_map(|path| new_meta.file(path).cloned())
        .collect();
    let total_bytes: u64 = to_download.iter().map(|f| f.size).sum();
    handle.update(|t| {
        t.files = to_download.clone();
        t.total_bytes = total_bytes;
        t.diff = Some(diff.clone());
    });

    // download into staging
    handle.set_stage(SyncStage::Downloading);
    if !to_download.is_empty() {
        api.emit(&crate::events::SyncEvent::PullFilesStarted);
        fs::create_dir_all(staging_dir).map_err(|e| MerginError::local_io(staging_dir, e))?;
    }
    for file in &to_download {
        download_file(
            api,
            handle,
            full_name,
            namespace,
            name,
            new_meta.version,
            file,
            staging_dir,
            cancel,
        )
        .await?;
        handle.update(|t| t.files.retain(|f| f.path != file.path));
    }

    // apply: conflict renames, then overwrites, then deletes, then metadata
    cancel.check()?;
    handle.set_stage(SyncStage::Applying);

    for path in diff.conflict_copy_paths() {
        if let Some(copy) = make_conflict_copy(project_dir, &path)? {
            debug!(project = %full_name, file = %path, copy = %copy, "kept local file as conflict copy");
            api.emit(&crate::events::SyncEvent::notify(format!(
                "Local changes of {} saved as {}",
                path, copy
            )));
        }
    }

    for file in &to_download {
        let staged = staging_dir.join(slash_to_path(&file.path));
        let target = project_dir.join(slash_to_path(&file.path));
        move_into_place(&staged, &target)?;
    }

    for path in &diff.remote_deleted {
        let target = project_dir.join(slash_to_path(path));
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MerginError::local_io(&target, e)),
        }
    }

    remove_staging(staging_dir);

    new_meta.write_to_project(project_dir)?;
    let _ = write_project_name_file(project_dir, full_name);
    api.local_projects().upsert(LocalProjectInfo {
        project_dir: project_dir.to_path_buf(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        local_version: new_meta.version,
    });

    let changed = !to_download.is_empty() || !diff.remote_deleted.is_empty();
    Ok(PullOutcome {
        project_dir: project_dir.to_path_buf(),
        metadata: new_meta.clone(),
        first_download: handle.snapshot().first_time_download,
        changed,
    })
}

/// Download one file chunk-by-chunk into the staging directory and verify
/// its checksum against the server metadata.
#[allow(clippy::too_many_arguments)]
async fn download_file(
    api: &MerginApi,
    handle: &TransactionHandle,
    full_name: &str,
    namespace: &str,
    name: &str,
    version: u32,
    file: &MerginFile,
    staging_dir: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let staged = staging_dir.join(slash_to_path(&file.path));
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent).map_err(|e| MerginError::local_io(parent, e))?;
    }

    let mut out = fs::File::create(&staged).map_err(|e| MerginError::local_io(&staged, e))?;
    let chunk_count = checksum::download_chunk_count(file.size);
    for chunk_no in 0..chunk_count {
        cancel.check()?;
        let url = api.url(&format!(
            "v1/project/raw/{}/{}?file={}&version=v{}&chunk={}",
            namespace,
            name,
            encode_query_component(&file.path),
            version,
            chunk_no
        ));
        let response = api
            .send_authorized(HttpRequest::get(url).streaming(), cancel)
            .await?;
        out.write_all(&response.body)
            .map_err(|e| MerginError::local_io(&staged, e))?;

        let progress = handle.add_transferred(response.body.len() as u64);
        api.emit(&crate::events::SyncEvent::status_changed(
            full_name, progress,
        ));
    }
    out.flush().map_err(|e| MerginError::local_io(&staged, e))?;
    drop(out);

    let actual = checksum::file_checksum(&staged)?;
    if actual != file.checksum {
        return Err(MerginError::ChecksumMismatch {
            path: file.path.clone(),
            expected: file.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Rename the local file of a conflicted path to the first free
/// `*_conflict_copy` name. Returns the project-relative name of the copy,
/// or `None` when there is no local file to preserve.
fn make_conflict_copy(project_dir: &Path, rel_path: &str) -> Result<Option<String>> {
    let source = project_dir.join(slash_to_path(rel_path));
    if !source.exists() {
        return Ok(None);
    }

    let (stem, extension) = match rel_path.rsplit_once('.') {
        // the dot must be inside the final component and not lead it
        // (a leading dot is a hidden file, not an extension)
        Some((stem, ext)) if !ext.contains('/') && !stem.is_empty() && !stem.ends_with('/') => {
            (stem.to_string(), Some(ext.to_string()))
        }
        _ => (rel_path.to_string(), None),
    };

    let mut n = 0u32;
    loop {
        let suffix = if n == 0 {
            String::new()
        } else {
            format!("_{}", n)
        };
        let candidate_rel = match &extension {
            Some(ext) => format!("{}_conflict_copy{}.{}", stem, suffix, ext),
            None => format!("{}_conflict_copy{}", stem, suffix),
        };
        let candidate = project_dir.join(slash_to_path(&candidate_rel));
        if !candidate.exists() {
            fs::rename(&source, &candidate).map_err(|e| MerginError::local_io(&source, e))?;
            return Ok(Some(candidate_rel));
        }
        n += 1;
    }
}

/// Move a staged file to its final path, replacing any existing file.
fn move_into_place(staged: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| MerginError::local_io(parent, e))?;
    }
    if target.exists() {
        fs::remove_file(target).map_err(|e| MerginError::local_io(target, e))?;
    }
    fs::rename(staged, target).map_err(|e| MerginError::local_io(staged, e))
}

/// Allocate a fresh project directory under the data dir, appending `_N` to
/// the name until an unused path is found.
fn create_unique_project_dir(data_dir: &Path, name: &str) -> Result<PathBuf> {
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            data_dir.join(name)
        } else {
            data_dir.join(format!("{}_{}", name, n))
        };
        if !candidate.exists() {
            fs::create_dir_all(&candidate).map_err(|e| MerginError::local_io(&candidate, e))?;
            return Ok(candidate);
        }
        n += 1;
    }
}

fn remove_staging(staging_dir: &Path) {
    if staging_dir.exists() {
        if let Err(e) = fs::remove_dir_all(staging_dir) {
            warn!(dir = %staging_dir.display(), error = %e, "could not remove staging directory");
        }
    }
    // drop the .temp parent as well once it is empty
    if let Some(parent) = staging_dir.parent() {
        let _ = fs::remove_dir(parent);
    }
}

/// Turn a forward-slash metadata path into a platform path.
pub(crate) fn slash_to_path(rel: &str) -> PathBuf {
    rel.split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_copy_naming() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"local").unwrap();

        let copy = make_conflict_copy(dir.path(), "x.txt").unwrap().unwrap();
        assert_eq!(copy, "x_conflict_copy.txt");
        assert!(!dir.path().join("x.txt").exists());
        assert_eq!(
            fs::read(dir.path().join("x_conflict_copy.txt")).unwrap(),
            b"local"
        );
    }

    #[test]
    fn test_conflict_copy_unique_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"one").unwrap();
        fs::write(dir.path().join("x_conflict_copy.txt"), b"earlier").unwrap();
        fs::write(dir.path().join("x_conflict_copy_1.txt"), b"earlier2").unwrap();

        let copy = make_conflict_copy(dir.path(), "x.txt").unwrap().unwrap();
        assert_eq!(copy, "x_conflict_copy_2.txt");
    }

    #[test]
    fn test_conflict_copy_no_extension_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/Makefile"), b"all:").unwrap();

        let copy = make_conflict_copy(dir.path(), "sub/Makefile").unwrap().unwrap();
        assert_eq!(copy, "sub/Makefile_conflict_copy");
        assert!(dir.path().join("sub/Makefile_conflict_copy").exists());
    }

    #[test]
    fn test_conflict_copy_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(make_conflict_copy(dir.path(), "ghost.txt").unwrap().is_none());
    }

    #[test]
    fn test_move_into_place_replaces() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("staged"), b"new").unwrap();
        fs::write(dir.path().join("target"), b"old").unwrap();

        move_into_place(&dir.path().join("staged"), &dir.path().join("target")).unwrap();
        assert_eq!(fs::read(dir.path().join("target")).unwrap(), b"new");
        assert!(!dir.path().join("staged").exists());
    }

    #[test]
    fn test_create_unique_project_dir() {
        let data = tempfile::tempdir().unwrap();
        let first = create_unique_project_dir(data.path(), "survey").unwrap();
        assert_eq!(first, data.path().join("survey"));

        let second = create_unique_project_dir(data.path(), "survey").unwrap();
        assert_eq!(second, data.path().join("survey_1"));
        assert!(second.is_dir());
    }

    #[test]
    fn test_slash_to_path() {
        assert_eq!(slash_to_path("a/b/c.txt"), PathBuf::from("a/b/c.txt"));
    }
}
