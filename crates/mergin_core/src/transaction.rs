//! Per-project transaction state.
//!
//! At most one sync transaction exists per project full name at any time.
//! The registry arbitrates that rule, carries the shared state the protocol
//! drivers and the cancel path both need (progress counters, the upload
//! UUID, the cancel token), and exposes snapshots so tests can observe the
//! state machine from outside.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::diff::ProjectDiff;
use crate::error::{MerginError, Result};
use crate::http::CancelToken;
use crate::metadata::{MerginFile, ProjectMetadata};

/// Whether a transaction pulls from or pushes to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Download remote changes (update)
    Pull,
    /// Upload local changes
    Push,
}

/// Protocol stage of a transaction.
///
/// Pull moves through `FetchingInfo → Downloading → Applying`; push through
/// `PrePull → ComputingDiff → TxStarting → Uploading → TxFinishing` (the
/// pre-pull re-enters the pull stages). Every transaction ends in exactly
/// one of the three terminal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Waiting for server metadata
    FetchingInfo,
    /// Transferring chunks from the server into staging
    Downloading,
    /// Moving staged files into the working directory
    Applying,
    /// Push: bringing the working copy up to the server version first
    PrePull,
    /// Push: re-computing the diff after the pre-pull
    ComputingDiff,
    /// Push: waiting for the server-issued transaction UUID
    TxStarting,
    /// Push: transferring chunks to the server
    Uploading,
    /// Push: waiting for the server to commit the transaction
    TxFinishing,
    /// Finished successfully
    Done,
    /// Cancelled by the user
    Cancelled,
    /// Failed
    Failed,
}

impl SyncStage {
    /// True for `Done`, `Cancelled` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStage::Done | SyncStage::Cancelled | SyncStage::Failed
        )
    }
}

/// State of one in-flight sync transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Pull or push
    pub kind: TransactionKind,
    /// `namespace/name` of the project
    pub full_name: String,
    /// Local project directory (empty until the pull resolves it)
    pub project_dir: PathBuf,
    /// Total bytes this transaction will transfer
    pub total_bytes: u64,
    /// Bytes transferred so far
    pub transferred_bytes: u64,
    /// Push only: server-issued transaction UUID.
    ///
    /// `None` before `uploadStart` replies. The empty string is the
    /// cancel-on-arrival sentinel: cancellation arrived first, so the UUID
    /// must be cancelled on the server the moment it is received.
    pub uuid: Option<String>,
    /// Target version of this transaction
    pub version: u32,
    /// True when no local copy existed before this pull; failure then
    /// removes the whole project directory
    pub first_time_download: bool,
    /// Current protocol stage
    pub stage: SyncStage,
    /// Remaining files to transfer, in transfer order
    pub files: Vec<MerginFile>,
    /// Staging directory of a pull
    pub staging_dir: Option<PathBuf>,
    /// Server metadata that becomes current on success
    pub new_metadata: Option<ProjectMetadata>,
    /// The diff driving a push
    pub diff: Option<ProjectDiff>,
    cancel: CancelToken,
}

impl Transaction {
    fn new(kind: TransactionKind, full_name: &str) -> Self {
        Self {
            kind,
            full_name: full_name.to_string(),
            project_dir: PathBuf::new(),
            total_bytes: 0,
            transferred_bytes: 0,
            uuid: None,
            version: 0,
            first_time_download: false,
            stage: match kind {
                TransactionKind::Pull => SyncStage::FetchingInfo,
                TransactionKind::Push => SyncStage::PrePull,
            },
            files: Vec::new(),
            staging_dir: None,
            new_metadata: None,
            diff: None,
            cancel: CancelToken::new(),
        }
    }

    /// Fraction of bytes transferred, 0.0 when nothing is planned yet.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.transferred_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Shared handle to one transaction's state.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<Transaction>>,
    cancel: CancelToken,
}

impl TransactionHandle {
    fn new(transaction: Transaction) -> Self {
        let cancel = transaction.cancel.clone();
        Self {
            inner: Arc::new(Mutex::new(transaction)),
            cancel,
        }
    }

    /// The cancel token observed by this transaction's requests.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Mutate the state under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Transaction {
        self.inner.lock().unwrap().clone()
    }

    /// Move to a new protocol stage.
    pub fn set_stage(&self, stage: SyncStage) {
        self.update(|t| t.stage = stage);
    }

    /// Account transferred bytes; returns the new progress fraction.
    pub fn add_transferred(&self, bytes: u64) -> f64 {
        self.update(|t| {
            t.transferred_bytes += bytes;
            t.progress()
        })
    }
}

/// Mapping from project full name to its single in-flight transaction.
#[derive(Default)]
pub struct TransactionRegistry {
    active: Mutex<HashMap<String, TransactionHandle>>,
}

impl TransactionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction for a project.
    ///
    /// Fails with [`MerginError::AlreadyInProgress`] while another
    /// transaction for the same full name occupies the slot.
    pub fn begin(&self, kind: TransactionKind, full_name: &str) -> Result<TransactionHandle> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(full_name) {
            return Err(MerginError::AlreadyInProgress(full_name.to_string()));
        }
        let handle = TransactionHandle::new(Transaction::new(kind, full_name));
        active.insert(full_name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Signal cancellation to the transaction of a project, if any.
    ///
    /// For a push that has not received its UUID yet, the empty-string
    /// sentinel is stored so the driver cancels the server transaction on
    /// arrival. Idempotent; returns false when no transaction exists.
    pub fn cancel(&self, full_name: &str) -> bool {
        let handle = {
            let active = self.active.lock().unwrap();
            match active.get(full_name) {
                Some(handle) => handle.clone(),
                None => return false,
            }
        };
        handle.update(|t| {
            if t.kind == TransactionKind::Push && t.uuid.is_none() {
                t.uuid = Some(String::new());
            }
        });
        handle.cancel_token().cancel();
        true
    }

    /// Free the slot of a finished transaction.
    pub fn finish(&self, full_name: &str) {
        self.active.lock().unwrap().remove(full_name);
    }

    /// Handle of the active transaction of a project, if any.
    pub fn get(&self, full_name: &str) -> Option<TransactionHandle> {
        self.active.lock().unwrap().get(full_name).cloned()
    }

    /// Snapshots of every active transaction, for tests and status views.
    pub fn snapshots(&self) -> Vec<Transaction> {
        self.active
            .lock()
            .unwrap()
            .values()
            .map(|h| h.snapshot())
            .collect()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.active.lock().unwrap();
        f.debug_struct("TransactionRegistry")
            .field("active", &active.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_transaction_per_project() {
        let registry = TransactionRegistry::new();
        let _first = registry.begin(TransactionKind::Pull, "ns/p").unwrap();

        let second = registry.begin(TransactionKind::Push, "ns/p");
        assert!(matches!(second, Err(MerginError::AlreadyInProgress(_))));

        // other projects are unaffected
        assert!(registry.begin(TransactionKind::Pull, "ns/other").is_ok());

        registry.finish("ns/p");
        assert!(registry.begin(TransactionKind::Push, "ns/p").is_ok());
    }

    #[test]
    fn test_cancel_pull_fires_token() {
        let registry = TransactionRegistry::new();
        let handle = registry.begin(TransactionKind::Pull, "ns/p").unwrap();

        assert!(registry.cancel("ns/p"));
        assert!(handle.cancel_token().is_cancelled());
        // pull transactions never grow a UUID
        assert_eq!(handle.snapshot().uuid, None);
        // idempotent
        assert!(registry.cancel("ns/p"));
    }

    #[test]
    fn test_cancel_push_before_uuid_sets_sentinel() {
        let registry = TransactionRegistry::new();
        let handle = registry.begin(TransactionKind::Push, "ns/p").unwrap();

        registry.cancel("ns/p");
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.uuid, Some(String::new()));
        assert!(handle.cancel_token().is_cancelled());
    }

    #[test]
    fn test_cancel_push_after_uuid_keeps_uuid() {
        let registry = TransactionRegistry::new();
        let handle = registry.begin(TransactionKind::Push, "ns/p").unwrap();
        handle.update(|t| t.uuid = Some("real-uuid".to_string()));

        registry.cancel("ns/p");
        assert_eq!(handle.snapshot().uuid, Some("real-uuid".to_string()));
    }

    #[test]
    fn test_cancel_unknown_project() {
        let registry = TransactionRegistry::new();
        assert!(!registry.cancel("ns/ghost"));
    }

    #[test]
    fn test_progress_accounting() {
        let registry = TransactionRegistry::new();
        let handle = registry.begin(TransactionKind::Pull, "ns/p").unwrap();
        handle.update(|t| t.total_bytes = 100);

        assert_eq!(handle.add_transferred(25), 0.25);
        assert_eq!(handle.add_transferred(75), 1.0);
    }

    #[test]
    fn test_progress_with_no_work() {
        let t = Transaction::new(TransactionKind::Pull, "ns/p");
        assert_eq!(t.progress(), 0.0);
    }

    #[test]
    fn test_initial_stage_per_kind() {
        let pull = Transaction::new(TransactionKind::Pull, "ns/p");
        assert_eq!(pull.stage, SyncStage::FetchingInfo);
        let push = Transaction::new(TransactionKind::Push, "ns/p");
        assert_eq!(push.stage, SyncStage::PrePull);
        assert!(!pull.stage.is_terminal());
        assert!(SyncStage::Cancelled.is_terminal());
    }

    #[test]
    fn test_snapshots_observe_stages() {
        let registry = TransactionRegistry::new();
        let handle = registry.begin(TransactionKind::Push, "ns/p").unwrap();
        handle.set_stage(SyncStage::Uploading);

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].stage, SyncStage::Uploading);
    }
}
