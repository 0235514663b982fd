use crate::protocol::{PollOutcome, RunId, RunOutcome, RunPhase, RunSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What survives a daemon restart: the last command and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistentState {
    pub last_run_id: Option<RunId>,
    pub last_command: Option<String>,
    pub last_outcome: Option<RunOutcome>,
}

/// Canonical run state.  Every mutation is tagged with the run it belongs to;
/// updates for any run other than the current one are dropped, so a
/// superseded run's tasks can never overwrite a newer run's state.
pub struct StateManager {
    state: Arc<RwLock<RunSnapshot>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let phase = if persistent.last_outcome.is_some() {
            RunPhase::Finished
        } else {
            RunPhase::Idle
        };
        let state = RunSnapshot {
            rev: 1,
            run_id: persistent.last_run_id,
            phase,
            command: persistent.last_command,
            log: String::new(),
            poll_outcome: None,
            outcome: persistent.last_outcome,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub async fn get_state(&self) -> RunSnapshot {
        self.state.read().await.clone()
    }

    /// Highest run id seen so far, including one restored from disk.
    pub async fn last_run_id(&self) -> Option<RunId> {
        self.state.read().await.run_id
    }

    /// Reset everything for a fresh run.
    pub async fn begin_run(&self, run_id: RunId, command: String) {
        let mut state = self.state.write().await;
        state.run_id = Some(run_id);
        state.phase = RunPhase::Running;
        state.command = Some(command);
        state.log.clear();
        state.poll_outcome = None;
        state.outcome = None;
        state.rev += 1;
    }

    /// Returns `true` if the log text actually changed.
    pub async fn set_log(&self, run_id: RunId, text: String) -> bool {
        let mut state = self.state.write().await;
        if state.run_id != Some(run_id) || state.log == text {
            return false;
        }
        state.log = text;
        state.rev += 1;
        true
    }

    pub async fn set_poll_outcome(&self, run_id: RunId, outcome: PollOutcome) -> bool {
        let mut state = self.state.write().await;
        if state.run_id != Some(run_id) || state.poll_outcome.is_some() {
            return false;
        }
        state.poll_outcome = Some(outcome);
        state.rev += 1;
        true
    }

    /// The playlist outcome is written at most once per run.
    pub async fn set_outcome(&self, run_id: RunId, outcome: RunOutcome) -> bool {
        let mut state = self.state.write().await;
        if state.run_id != Some(run_id) || state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        state.rev += 1;
        true
    }

    /// Mark the run finished and persist its summary.
    pub async fn finish_run(&self, run_id: RunId) -> anyhow::Result<bool> {
        {
            let mut state = self.state.write().await;
            if state.run_id != Some(run_id) || state.phase != RunPhase::Running {
                return Ok(false);
            }
            state.phase = RunPhase::Finished;
            state.rev += 1;
        }
        self.save().await?;
        Ok(true)
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                last_run_id: state.run_id,
                last_command: state.command.clone(),
                last_outcome: state.outcome.clone(),
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
