//! Engine events and the callback registry.
//!
//! The engine reports progress and results exclusively through
//! [`SyncEvent`] values delivered to registered callbacks; it never renders
//! anything itself. Event names match the signals of the original client so
//! shells can be ported one handler at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::auth::ApiVersionStatus;
use crate::metadata::ProjectListEntry;

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for engine events.
///
/// Callbacks are invoked synchronously on the emitting task and should not
/// block for extended periods.
pub type EventCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// The server project listing arrived.
    ListProjectsFinished {
        /// Projects returned by the server
        projects: Vec<ProjectListEntry>,
    },

    /// The server project listing failed.
    ListProjectsFailed,

    /// Sync progress changed for a project.
    ///
    /// `progress` is `transferred / total ∈ [0, 1]` while data moves and
    /// `-1.0` once no sync is pending.
    SyncProjectStatusChanged {
        /// `namespace/name` of the project
        full_name: String,
        /// Fraction transferred, or -1.0
        progress: f64,
    },

    /// A sync (pull or push) reached its terminal state.
    SyncProjectFinished {
        /// Local project directory
        dir: PathBuf,
        /// `namespace/name` of the project
        full_name: String,
        /// True on success, false on failure or cancellation
        success: bool,
    },

    /// A pull rewrote files of a project that may be open in the shell.
    ReloadProject {
        /// Local project directory
        dir: PathBuf,
    },

    /// A request failed; the shell decides how loudly to surface it.
    NetworkErrorOccurred {
        /// Human-readable message
        message: String,
        /// Server-provided detail, empty when none
        detail: String,
        /// Hint that the shell should use a dialog instead of a toast
        as_dialog: bool,
    },

    /// Short status string for the shell's notification area.
    Notify {
        /// The message
        message: String,
    },

    /// Chunk downloads are about to start.
    PullFilesStarted,

    /// Chunk uploads are about to start.
    PushFilesStarted,

    /// Stored credentials were rejected and a fresh login is required.
    AuthRequested,

    /// Login state changed (token obtained or cleared).
    AuthChanged,

    /// A login attempt failed.
    AuthFailed,

    /// The `/ping` probe classified the server version.
    ApiVersionStatusChanged {
        /// New verdict
        status: ApiVersionStatus,
    },

    /// Administrative project creation finished.
    ProjectCreated {
        /// Project name
        name: String,
        /// Whether the server accepted it
        success: bool,
    },

    /// Administrative project deletion finished.
    ServerProjectDeleted {
        /// `namespace/name` of the project
        full_name: String,
        /// Whether the server accepted it
        success: bool,
    },

    /// Fresh user storage numbers arrived.
    UserInfoChanged {
        /// Username the info belongs to
        username: String,
        /// Bytes currently used
        disk_usage: u64,
        /// Quota in bytes
        storage_limit: u64,
    },

    /// The `/ping` probe answered.
    PingFinished {
        /// Server version string, empty on failure
        version: String,
        /// Error message, empty on success
        message: String,
    },
}

impl SyncEvent {
    /// Create a progress event.
    pub fn status_changed(full_name: impl Into<String>, progress: f64) -> Self {
        Self::SyncProjectStatusChanged {
            full_name: full_name.into(),
            progress,
        }
    }

    /// Create a terminal sync event.
    pub fn sync_finished(dir: PathBuf, full_name: impl Into<String>, success: bool) -> Self {
        Self::SyncProjectFinished {
            dir,
            full_name: full_name.into(),
            success,
        }
    }

    /// Create a network error event.
    pub fn network_error(
        message: impl Into<String>,
        detail: impl Into<String>,
        as_dialog: bool,
    ) -> Self {
        Self::NetworkErrorOccurred {
            message: message.into(),
            detail: detail.into(),
            as_dialog,
        }
    }

    /// Create a notification event.
    pub fn notify(message: impl Into<String>) -> Self {
        Self::Notify {
            message: message.into(),
        }
    }

    /// Event kind as a string, for logging and test assertions.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ListProjectsFinished { .. } => "ListProjectsFinished",
            Self::ListProjectsFailed => "ListProjectsFailed",
            Self::SyncProjectStatusChanged { .. } => "SyncProjectStatusChanged",
            Self::SyncProjectFinished { .. } => "SyncProjectFinished",
            Self::ReloadProject { .. } => "ReloadProject",
            Self::NetworkErrorOccurred { .. } => "NetworkErrorOccurred",
            Self::Notify { .. } => "Notify",
            Self::PullFilesStarted => "PullFilesStarted",
            Self::PushFilesStarted => "PushFilesStarted",
            Self::AuthRequested => "AuthRequested",
            Self::AuthChanged => "AuthChanged",
            Self::AuthFailed => "AuthFailed",
            Self::ApiVersionStatusChanged { .. } => "ApiVersionStatusChanged",
            Self::ProjectCreated { .. } => "ProjectCreated",
            Self::ServerProjectDeleted { .. } => "ServerProjectDeleted",
            Self::UserInfoChanged { .. } => "UserInfoChanged",
            Self::PingFinished { .. } => "PingFinished",
        }
    }
}

/// Thread-safe registry for event subscriptions.
///
/// Supports subscribing with unique ids, unsubscribing by id, and emitting
/// to all active subscribers. A panicking callback does not affect the
/// others.
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback>>,
    next_id: AtomicU64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events; returns the id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.write().unwrap().insert(id, callback);
        id
    }

    /// Remove a subscription. Returns true when it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.write().unwrap().remove(&id).is_some()
    }

    /// Deliver an event to every subscriber.
    pub fn emit(&self, event: &SyncEvent) {
        let callbacks = self.callbacks.read().unwrap();
        for callback in callbacks.values() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
        }
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_and_emit() {
        let registry = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let _id = registry.subscribe(Arc::new(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&SyncEvent::PullFilesStarted);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let id = registry.subscribe(Arc::new(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&SyncEvent::PushFilesStarted);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_isolated() {
        let registry = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_| panic!("listener bug")));
        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&SyncEvent::ListProjectsFailed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_payloads() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new();

        let sink = Arc::clone(&events);
        registry.subscribe(Arc::new(move |event| {
            sink.lock().unwrap().push(event.event_type().to_string());
        }));

        registry.emit(&SyncEvent::status_changed("ns/p", 0.5));
        registry.emit(&SyncEvent::sync_finished(PathBuf::from("/x"), "ns/p", true));
        registry.emit(&SyncEvent::network_error("msg", "", false));

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "SyncProjectStatusChanged",
                "SyncProjectFinished",
                "NetworkErrorOccurred"
            ]
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&SyncEvent::notify("hello")).unwrap();
        assert!(json.contains("\"type\":\"Notify\""));
        assert!(json.contains("hello"));
    }
}
