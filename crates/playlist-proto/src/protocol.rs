use serde::{Deserialize, Serialize};

use crate::selection::{DurationRange, Selection};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// What readers see in place of a playlist when a run did not produce one.
pub const FAILURE_SENTINEL: &str = "$$FAILURE$$";

pub type RunId = u64;

/// Messages sent from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Submit {
        selection: Selection,
        duration: DurationRange,
    },
    Cancel,
    GetState,
}

/// Messages sent from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        state: RunSnapshot,
    },
    State {
        data: RunSnapshot,
    },
    Accepted {
        run_id: RunId,
        command: String,
    },
    Rejected {
        reason: String,
    },
    Log {
        run_id: RunId,
        text: String,
    },
    Playlist {
        run_id: RunId,
        outcome: RunOutcome,
    },
    /// WARN/ERROR lines from the daemon's own tracing output.
    Notice {
        message: String,
    },
}

/// How the generator side of a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Generator succeeded and its output was parsed.
    Playlist { text: String },
    /// Generator ran but exited nonzero (`None` when killed by a signal).
    GeneratorFailed { code: Option<i32> },
    /// Generator could not be started at all.
    LaunchFailed { message: String },
    /// Generator succeeded but we could not read its output.
    /// `unsupported` is set when parsing is simply not available yet.
    ParseFailed { message: String, unsupported: bool },
    Cancelled,
    /// The daemon's own run task failed; the generator may still have run.
    Internal { message: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Playlist { .. })
    }

    /// Playlist text, or the failure sentinel for everything else.
    pub fn display_text(&self) -> &str {
        match self {
            RunOutcome::Playlist { text } => text,
            _ => FAILURE_SENTINEL,
        }
    }

    /// One-line explanation for anything that is not a playlist.
    pub fn describe(&self) -> String {
        match self {
            RunOutcome::Playlist { .. } => "playlist ready".to_string(),
            RunOutcome::GeneratorFailed { code: Some(code) } => {
                format!("generator exited with code {}", code)
            }
            RunOutcome::GeneratorFailed { code: None } => {
                "generator was terminated by a signal".to_string()
            }
            RunOutcome::LaunchFailed { message } => format!("could not start generator: {}", message),
            RunOutcome::ParseFailed { message, .. } => {
                format!("could not read generator output: {}", message)
            }
            RunOutcome::Cancelled => "run cancelled".to_string(),
            RunOutcome::Internal { message } => format!("internal error: {}", message),
        }
    }
}

/// Why the log poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// The done sentinel appeared.
    Done,
    /// The done sentinel never appeared within the configured wait.
    TimedOut,
    /// The generator exited and the sentinel still had not appeared after
    /// the exit grace period.
    Abandoned,
    Cancelled,
    /// The poller task itself failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Finished,
}

/// Read-only view of the current (or last) run.  `rev` is a monotonically
/// increasing counter bumped on every change so clients can detect missed
/// updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub run_id: Option<RunId>,
    pub phase: RunPhase,
    /// Space-joined generator arguments.
    pub command: Option<String>,
    /// Full log file text as of the last poll.
    pub log: String,
    pub poll_outcome: Option<PollOutcome>,
    /// Set exactly once per run, when the generator side completes.
    pub outcome: Option<RunOutcome>,
}

impl RunSnapshot {
    pub fn is_active(&self) -> bool {
        self.phase == RunPhase::Running
    }

    /// Playlist text, the failure sentinel, or `None` while still running.
    pub fn playlist_text(&self) -> Option<&str> {
        self.outcome.as_ref().map(RunOutcome::display_text)
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Total length (header included) of the first frame in `data`, or
    /// `None` while that frame is still incomplete.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        (data.len() >= 4 + len).then_some(4 + len)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
