//! Line-based progress rendering from engine events.

use std::io::{self, Write};
use std::sync::Arc;

use mergin_core::api::MerginApi;
use mergin_core::events::{SubscriptionId, SyncEvent};

/// Subscribe a stderr progress printer to the engine.
///
/// Progress updates rewrite one line; terminal events finish it. The
/// subscription should be dropped with [`MerginApi::unsubscribe`] once the
/// operation is done.
pub fn attach(api: &MerginApi) -> SubscriptionId {
    api.subscribe(Arc::new(|event| match event {
        SyncEvent::SyncProjectStatusChanged {
            full_name,
            progress,
        } => {
            if *progress >= 0.0 {
                eprint!("\r{}: {:>5.1}%", full_name, progress * 100.0);
                let _ = io::stderr().flush();
            }
        }
        SyncEvent::SyncProjectFinished {
            full_name, success, ..
        } => {
            eprintln!(
                "\r{}: {}",
                full_name,
                if *success { "done" } else { "failed" }
            );
        }
        SyncEvent::Notify { message } => eprintln!("{}", message),
        SyncEvent::NetworkErrorOccurred {
            message, detail, ..
        } => {
            if detail.is_empty() {
                eprintln!("error: {}", message);
            } else {
                eprintln!("error: {} ({})", message, detail);
            }
        }
        _ => {}
    }))
}
