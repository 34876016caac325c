//! Push protocol: upload local changes under a server transaction.
//!
//! A push always pulls first, so conflicts are resolved before anything is
//! sent: after the pre-pull the stored snapshot matches the server and every
//! surviving local difference is genuinely ours (conflict copies re-appear
//! as added files). The server hands out a transaction UUID on
//! `push/{ns}/{name}`; every chunk is uploaded under that UUID and the
//! transaction either commits on `push/finish` or must be aborted with
//! `push/cancel` — also on our own failures, so the server does not keep a
//! half-open transaction around.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::MerginApi;
use crate::checksum::{self, UPLOAD_CHUNK_SIZE};
use crate::diff::{compare_project_files, ProjectDiff};
use crate::error::{MerginError, Result};
use crate::events::SyncEvent;
use crate::http::{CancelToken, HttpRequest};
use crate::local_projects::LocalProjectInfo;
use crate::metadata::{self, version_string, MerginFile, ProjectMetadata};
use crate::pull::{self, slash_to_path};
use crate::transaction::{SyncStage, TransactionHandle};

/// What a finished push produced.
#[derive(Debug)]
pub(crate) struct PushOutcome {
    /// Local project directory
    pub project_dir: PathBuf,
    /// Version the project is at now
    pub version: u32,
    /// False when there was nothing to upload
    pub uploaded_any: bool,
    /// True when the pre-pull modified the working copy
    pub pulled_changed: bool,
}

/// Reply of `POST /v1/project/push/{ns}/{name}`.
#[derive(Debug, Deserialize)]
struct PushStartReply {
    transaction: String,
    #[serde(with = "version_string")]
    version: u32,
}

/// Run the push protocol for one project inside an existing transaction.
pub(crate) async fn execute(
    api: &MerginApi,
    namespace: &str,
    name: &str,
    handle: &TransactionHandle,
) -> Result<PushOutcome> {
    let cancel = handle.cancel_token();
    let full_name = MerginApi::full_project_name(namespace, name);

    // 1. bring the working copy up to the server version first
    handle.set_stage(SyncStage::PrePull);
    let pulled = pull::execute(api, namespace, name, handle).await?;
    let project_dir = pulled.project_dir.clone();

    // the pre-pull used the progress counters for the download
    handle.update(|t| {
        t.total_bytes = 0;
        t.transferred_bytes = 0;
        t.files.clear();
    });

    // 2. re-diff: old and new server state match now, local drives the push
    cancel.check()?;
    handle.set_stage(SyncStage::ComputingDiff);
    let server_files = pulled.metadata.files_vec();
    let local_files = metadata::list_local_files(&project_dir)?;
    let diff = compare_project_files(&server_files, &server_files, &local_files);
    debug!(project = %full_name, "{}", diff.dump());
    handle.update(|t| t.diff = Some(diff.clone()));

    if !diff.has_local_changes() {
        return Ok(PushOutcome {
            project_dir,
            version: pulled.metadata.version,
            uploaded_any: false,
            pulled_changed: pulled.changed,
        });
    }

    // 3. open the server transaction
    let (upload_files, changes) = prepare_upload(&diff, &local_files, pulled.metadata.version);
    let total_bytes: u64 = upload_files.iter().map(|f| f.size).sum();
    handle.update(|t| {
        t.files = upload_files.clone();
        t.total_bytes = total_bytes;
    });

    handle.set_stage(SyncStage::TxStarting);
    let start_url = api.url(&format!("v1/project/push/{}/{}", namespace, name));
    let response = api
        .send_authorized(HttpRequest::post_json(start_url, &changes), &cancel)
        .await?;
    let reply: PushStartReply =
        serde_json::from_slice(&response.body).map_err(|e| MerginError::MetadataCorrupt {
            path: format!("push reply for {}", full_name),
            reason: e.to_string(),
        })?;

    // cancellation may have arrived while the reply was in flight; the
    // empty-string sentinel means the server transaction must die now
    let cancelled_on_arrival = handle.update(|t| {
        if matches!(&t.uuid, Some(uuid) if uuid.is_empty()) {
            true
        } else {
            t.uuid = Some(reply.transaction.clone());
            t.version = reply.version;
            false
        }
    });
    if cancelled_on_arrival {
        send_push_cancel(api, &reply.transaction).await;
        return Err(MerginError::Cancelled);
    }

    // 4.+5. upload chunks and finish; abort the server transaction on any
    // failure from here on
    let result = upload_and_finish(
        api,
        handle,
        &full_name,
        namespace,
        name,
        &project_dir,
        &upload_files,
        &reply.transaction,
        &cancel,
    )
    .await;

    match result {
        Ok(new_meta) => {
            handle.update(|t| {
                t.uuid = None;
                t.version = new_meta.version;
            });
            Ok(PushOutcome {
                project_dir,
                version: new_meta.version,
                uploaded_any: true,
                pulled_changed: pulled.changed,
            })
        }
        Err(err) => {
            send_push_cancel(api, &reply.transaction).await;
            Err(err)
        }
    }
}

/// Build the transfer list (with chunk plans) and the `UploadChanges` JSON
/// body from the diff's local sets.
fn prepare_upload(
    diff: &ProjectDiff,
    local_files: &[MerginFile],
    version: u32,
) -> (Vec<MerginFile>, serde_json::Value) {
    let by_path: BTreeMap<&str, &MerginFile> =
        local_files.iter().map(|f| (f.path.as_str(), f)).collect();

    let with_chunks = |path: &String| -> Option<MerginFile> {
        by_path.get(path.as_str()).map(|f| {
            let mut file = (*f).clone();
            file.chunks = checksum::generate_chunk_ids(file.size);
            file
        })
    };

    let added: Vec<MerginFile> = diff.local_added.iter().filter_map(with_chunks).collect();
    let updated: Vec<MerginFile> = diff.local_updated.iter().filter_map(with_chunks).collect();
    let removed: Vec<serde_json::Value> = diff
        .local_deleted
        .iter()
        .map(|path| serde_json::json!({ "path": path }))
        .collect();

    let changes = serde_json::json!({
        "version": format!("v{}", version),
        "added": &added,
        "updated": &updated,
        "removed": removed,
    });

    // transfer order: all files sorted by path
    let mut upload_files: Vec<MerginFile> = added.into_iter().chain(updated).collect();
    upload_files.sort_by(|a, b| a.path.cmp(&b.path));
    (upload_files, changes)
}

#[allow(clippy::too_many_arguments)]
async fn upload_and_finish(
    api: &MerginApi,
    handle: &TransactionHandle,
    full_name: &str,
    namespace: &str,
    name: &str,
    project_dir: &Path,
    upload_files: &[MerginFile],
    uuid: &str,
    cancel: &CancelToken,
) -> Result<ProjectMetadata> {
    handle.set_stage(SyncStage::Uploading);
    api.emit(&SyncEvent::PushFilesStarted);

    for file in upload_files {
        upload_file(api, handle, full_name, project_dir, file, uuid, cancel).await?;
        handle.update(|t| t.files.retain(|f| f.path != file.path));
    }

    cancel.check()?;
    handle.set_stage(SyncStage::TxFinishing);
    let finish_url = api.url(&format!("v1/project/push/finish/{}", uuid));
    let response = api
        .send_authorized(HttpRequest::post(&finish_url, Vec::new()), cancel)
        .await?;
    let new_meta = ProjectMetadata::parse(&response.body, &finish_url)?;

    new_meta.write_to_project(project_dir)?;
    api.local_projects().upsert(LocalProjectInfo {
        project_dir: project_dir.to_path_buf(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        local_version: new_meta.version,
    });
    Ok(new_meta)
}

/// Upload one file's chunks in order under the transaction UUID.
async fn upload_file(
    api: &MerginApi,
    handle: &TransactionHandle,
    full_name: &str,
    project_dir: &Path,
    file: &MerginFile,
    uuid: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let path = project_dir.join(slash_to_path(&file.path));
    let mut source = fs::File::open(&path).map_err(|e| MerginError::local_io(&path, e))?;

    for chunk_id in &file.chunks {
        cancel.check()?;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE as usize];
        let mut filled = 0usize;
        // a chunk may need several reads to fill
        loop {
            let n = source
                .read(&mut buf[filled..])
                .map_err(|e| MerginError::local_io(&path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        buf.truncate(filled);

        let url = api.url(&format!("v1/project/push/chunk/{}/{}", uuid, chunk_id));
        let sent = buf.len() as u64;
        api.send_authorized(HttpRequest::post(url, buf).streaming(), cancel)
            .await?;

        let progress = handle.add_transferred(sent);
        api.emit(&SyncEvent::status_changed(full_name, progress));
    }
    Ok(())
}

/// Best-effort abort of a server transaction; the outcome is ignored.
pub(crate) async fn send_push_cancel(api: &MerginApi, uuid: &str) {
    let url = api.url(&format!("v1/project/push/cancel/{}", uuid));
    // a fresh token-less cancel context: the abort must go out even though
    // the transaction's own token has fired
    let cancel = CancelToken::new();
    if let Err(e) = api
        .send_authorized(HttpRequest::post(&url, Vec::new()), &cancel)
        .await
    {
        warn!(uuid = %uuid, error = %e, "push cancel request failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(path: &str, size: u64) -> MerginFile {
        MerginFile::new(path, format!("chk-{}", path), size)
    }

    #[test]
    fn test_prepare_upload_shapes_changes_json() {
        let mut diff = ProjectDiff::default();
        diff.local_added.insert("new.txt".to_string());
        diff.local_updated.insert("changed.txt".to_string());
        diff.local_deleted.insert("gone.txt".to_string());

        let local_files = vec![local("new.txt", 5), local("changed.txt", UPLOAD_CHUNK_SIZE + 1)];
        let (upload_files, changes) = prepare_upload(&diff, &local_files, 7);

        assert_eq!(changes["version"], "v7");
        assert_eq!(changes["added"][0]["path"], "new.txt");
        assert_eq!(changes["added"][0]["size"], 5);
        assert_eq!(changes["added"][0]["checksum"], "chk-new.txt");
        assert_eq!(changes["added"][0]["chunks"].as_array().unwrap().len(), 1);
        assert_eq!(changes["updated"][0]["chunks"].as_array().unwrap().len(), 2);
        assert_eq!(changes["removed"], serde_json::json!([{"path": "gone.txt"}]));

        // sorted by path: changed.txt before new.txt
        let order: Vec<_> = upload_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, vec!["changed.txt", "new.txt"]);
    }

    #[test]
    fn test_prepare_upload_zero_byte_file_has_one_chunk() {
        let mut diff = ProjectDiff::default();
        diff.local_added.insert("empty.txt".to_string());

        let local_files = vec![local("empty.txt", 0)];
        let (upload_files, _) = prepare_upload(&diff, &local_files, 1);
        assert_eq!(upload_files[0].chunks.len(), 1);
    }

    #[test]
    fn test_push_start_reply_parses() {
        let reply: PushStartReply =
            serde_json::from_slice(br#"{"transaction": "abc-123", "version": "v9"}"#).unwrap();
        assert_eq!(reply.transaction, "abc-123");
        assert_eq!(reply.version, 9);
    }
}
