pub mod core;
pub mod logging;
pub mod parser;
pub mod poller;
pub mod process;
pub mod socket;

use std::any::Any;

use playlist_proto::protocol::{RunId, RunOutcome};

/// Defines what the Coordinator broadcasts to connected clients.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The run snapshot changed; receivers should fetch it from the StateManager.
    StateUpdated,
    /// New log text for a run (full file contents, not a delta).
    Log { run_id: RunId, text: String },
    /// The generator side of a run completed.
    Playlist { run_id: RunId, outcome: RunOutcome },
    /// A WARN/ERROR line from our own tracing output.
    Notice(String),
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
