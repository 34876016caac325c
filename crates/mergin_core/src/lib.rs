#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Orchestrator entry points (`update`, `upload`, `cancel`, listing)
pub mod api;

/// Credentials, token exchange and server version probing
pub mod auth;

/// Content checksums and chunk planning
pub mod checksum;

/// Engine configuration
pub mod config;

/// Three-way project diff
pub mod diff;

/// Error taxonomy (common error types)
pub mod error;

/// Engine events and the callback registry
pub mod events;

/// HTTP transport abstraction
pub mod http;

/// Ignore rules for paths excluded from sync
pub mod ignore;

/// Registry of locally downloaded projects
pub mod local_projects;

/// Project metadata snapshots and local file listing
pub mod metadata;

/// Per-project transaction state
pub mod transaction;

/// In-process mock server and HTTP client for tests
pub mod test_utils;

mod pull;
mod push;

pub use api::{MerginApi, ProjectFilter};
pub use config::ApiConfig;
pub use diff::{ProjectDiff, compare_project_files};
pub use error::{MerginError, Result};
pub use events::SyncEvent;
pub use metadata::{MerginFile, ProjectMetadata};
