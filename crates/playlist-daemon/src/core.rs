//! Coordinator: single-owner event loop for all run state.
//!
//! Every input funnels through one mpsc channel as a `CoreEvent`: client
//! requests (submit, cancel, state), log text from the poller, and the
//! outcome from the generator task.  The Coordinator owns the `StateManager`
//! writes and the handles of the active run; no other task touches them.
//!
//! ```text
//!   submit ─► build RunCommand ─┬─► process task ─► parser ─► RunFinished
//!                               └─► poller task ─► Log* ─► PollerStopped
//! ```
//!
//! A run is finished once both tasks have reported.  Only one run may be
//! active at a time; a second submission is rejected with `Busy`.

use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use playlist_proto::command::{self, RunCommand};
use playlist_proto::config::Config;
use playlist_proto::protocol::{PollOutcome, RunId, RunOutcome, RunSnapshot};
use playlist_proto::selection::{DurationRange, Selection, ValidationError};
use playlist_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::parser::{self, PlaylistParser};
use crate::poller::LogPoller;
use crate::process::{GeneratorProcess, ProcessRunner, RunError};
use crate::{panic_message, BroadcastMessage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the Coordinator loop.
#[derive(Debug)]
pub enum CoreEvent {
    Submit {
        selection: Selection,
        duration: DurationRange,
        reply: oneshot::Sender<Result<RunId, SubmitError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    GetState {
        reply: oneshot::Sender<RunSnapshot>,
    },
    /// Log text read by the poller.
    Log { run_id: RunId, text: String },
    PollerStopped { run_id: RunId, outcome: PollOutcome },
    /// The generator exited (or never started) and its output was parsed.
    RunFinished { run_id: RunId, outcome: RunOutcome },
    /// The generator exited a while ago and the poller is still waiting.
    ExitGraceElapsed { run_id: RunId },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("run {run_id} is still in progress")]
    Busy { run_id: RunId },
    #[error("could not remove stale done file {path}: {source}")]
    StaleSentinel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

// ── Coordinator ───────────────────────────────────────────────────────────────

struct ActiveRun {
    run_id: RunId,
    /// Fires on user cancel; the poller token is a child of it.
    cancel: CancellationToken,
    poll_cancel: CancellationToken,
    process_task: JoinHandle<()>,
    poll_task: JoinHandle<PollOutcome>,
    process_done: bool,
    poller_done: bool,
    /// Poller was stopped because the generator had already exited.
    abandoned: bool,
}

pub struct Coordinator {
    poller: LogPoller,
    exit_grace: Duration,
    clear_stale_done: bool,
    runner: Arc<dyn ProcessRunner>,
    parser: Arc<dyn PlaylistParser>,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    active: Option<ActiveRun>,
    next_run_id: RunId,
}

impl Coordinator {
    pub async fn new(
        config: &Config,
        runner: Arc<dyn ProcessRunner>,
        parser: Arc<dyn PlaylistParser>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));
        let next_run_id = state_manager.last_run_id().await.map_or(1, |id| id + 1);

        Self {
            poller: LogPoller::from_config(&config.polling),
            exit_grace: config.polling.exit_grace(),
            clear_stale_done: config.polling.clear_stale_done,
            runner,
            parser,
            state_manager,
            event_tx,
            broadcast_tx,
            active: None,
            next_run_id,
        }
    }

    /// Coordinator wired to the configured generator executable and parser.
    pub async fn from_config(
        config: &Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        let runner = Arc::new(GeneratorProcess::from_config(&config.generator));
        let parser = parser::from_config(&config.parser);
        Self::new(config, runner, parser, broadcast_tx, event_tx).await
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.state_manager.get_state().await
    }

    /// Run the event loop.  Returns when a `Shutdown` event is received or
    /// every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("coordinator: starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("coordinator: event channel closed, shutting down");
                    break;
                }
                Some(CoreEvent::Shutdown) => {
                    info!("coordinator: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn handle_event(&mut self, evt: CoreEvent) {
        match evt {
            CoreEvent::Submit {
                selection,
                duration,
                reply,
            } => {
                let result = self.submit(&selection, &duration).await;
                if let Err(e) = &result {
                    warn!("coordinator: submission rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            CoreEvent::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            CoreEvent::GetState { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            CoreEvent::Log { run_id, text } => {
                if self.state_manager.set_log(run_id, text.clone()).await {
                    self.broadcast(BroadcastMessage::Log { run_id, text });
                }
            }
            CoreEvent::PollerStopped { run_id, outcome } => {
                self.on_poller_stopped(run_id, outcome).await;
            }
            CoreEvent::RunFinished { run_id, outcome } => {
                self.on_run_finished(run_id, outcome).await;
            }
            CoreEvent::ExitGraceElapsed { run_id } => {
                if let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|active| active.run_id == run_id && !active.poller_done)
                {
                    info!(
                        "coordinator: run {} generator exited without a done sentinel, stopping poller",
                        run_id
                    );
                    active.abandoned = true;
                    active.poll_cancel.cancel();
                }
            }
            CoreEvent::Shutdown => {}
        }
    }

    // ── requests ──────────────────────────────────────────────────────────────

    /// Validate, build the command and start both tasks.  Nothing is spawned
    /// when this returns an error.
    pub async fn submit(
        &mut self,
        selection: &Selection,
        duration: &DurationRange,
    ) -> Result<RunId, SubmitError> {
        let command = command::build(selection, duration)?;

        if let Some(active) = &self.active {
            return Err(SubmitError::Busy {
                run_id: active.run_id,
            });
        }

        if self.clear_stale_done {
            self.clear_stale_done_file().await?;
        }

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.start_run(run_id, command).await;
        Ok(run_id)
    }

    /// Cancel the active run.  Returns `false` when nothing was running.
    pub fn cancel(&mut self) -> bool {
        match &self.active {
            Some(active) => {
                info!("coordinator: cancelling run {}", active.run_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn clear_stale_done_file(&self) -> Result<(), SubmitError> {
        let done_path = self.poller.done_path();
        match tokio::fs::remove_file(done_path).await {
            Ok(()) => {
                info!("coordinator: removed stale done file {}", done_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SubmitError::StaleSentinel {
                path: done_path.to_path_buf(),
                source,
            }),
        }
    }

    async fn start_run(&mut self, run_id: RunId, command: RunCommand) {
        info!("coordinator: run {} starting: {}", run_id, command);
        self.state_manager
            .begin_run(run_id, command.to_string())
            .await;
        self.broadcast(BroadcastMessage::StateUpdated);

        let cancel = CancellationToken::new();
        let poll_cancel = cancel.child_token();

        let runner = Arc::clone(&self.runner);
        let parser = Arc::clone(&self.parser);
        let tx = self.event_tx.clone();
        let run_cancel = cancel.clone();
        let process_task = tokio::spawn(async move {
            // A panic in the runner or parser still has to end the run.
            let outcome = AssertUnwindSafe(generate(
                runner.as_ref(),
                parser.as_ref(),
                command,
                run_cancel,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!("coordinator: run {} generator task panicked: {}", run_id, message);
                RunOutcome::Internal { message }
            });
            let _ = tx.send(CoreEvent::RunFinished { run_id, outcome }).await;
        });

        let poll_task = self
            .poller
            .clone()
            .spawn(run_id, self.event_tx.clone(), poll_cancel.clone());

        self.active = Some(ActiveRun {
            run_id,
            cancel,
            poll_cancel,
            process_task,
            poll_task,
            process_done: false,
            poller_done: false,
            abandoned: false,
        });
    }

    // ── task reports ──────────────────────────────────────────────────────────

    async fn on_poller_stopped(&mut self, run_id: RunId, outcome: PollOutcome) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.run_id == run_id)
        else {
            debug!("coordinator: ignoring poller report for stale run {}", run_id);
            return;
        };

        let outcome = if active.abandoned && outcome == PollOutcome::Cancelled {
            PollOutcome::Abandoned
        } else {
            outcome
        };
        active.poller_done = true;

        match outcome {
            PollOutcome::TimedOut => warn!("coordinator: run {} log polling timed out", run_id),
            PollOutcome::Failed => error!("coordinator: run {} log polling failed", run_id),
            _ => info!("coordinator: run {} log polling stopped: {:?}", run_id, outcome),
        }

        if self.state_manager.set_poll_outcome(run_id, outcome).await {
            self.broadcast(BroadcastMessage::StateUpdated);
        }
        self.maybe_finish(run_id).await;
    }

    async fn on_run_finished(&mut self, run_id: RunId, outcome: RunOutcome) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.run_id == run_id)
        else {
            debug!("coordinator: ignoring generator report for stale run {}", run_id);
            return;
        };
        active.process_done = true;
        let poller_running = !active.poller_done;

        info!("coordinator: run {} {}", run_id, outcome.describe());
        if self.state_manager.set_outcome(run_id, outcome.clone()).await {
            self.broadcast(BroadcastMessage::Playlist { run_id, outcome });
        }

        if poller_running {
            let tx = self.event_tx.clone();
            let grace = self.exit_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(CoreEvent::ExitGraceElapsed { run_id }).await;
            });
        }
        self.maybe_finish(run_id).await;
    }

    async fn maybe_finish(&mut self, run_id: RunId) {
        let complete = self.active.as_ref().is_some_and(|active| {
            active.run_id == run_id && active.process_done && active.poller_done
        });
        if !complete {
            return;
        }

        self.active = None;
        if let Err(e) = self.state_manager.finish_run(run_id).await {
            error!("coordinator: failed to persist run {}: {}", run_id, e);
        }
        info!("coordinator: run {} finished", run_id);
        self.broadcast(BroadcastMessage::StateUpdated);
    }

    fn broadcast(&self, msg: BroadcastMessage) {
        // No receivers is fine.
        let _ = self.broadcast_tx.send(msg);
    }

    async fn cleanup(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!("coordinator: stopping run {} on shutdown", active.run_id);
        active.cancel.cancel();
        let stopped = tokio::time::timeout(REQUEST_TIMEOUT, async {
            let _ = active.process_task.await;
            let _ = active.poll_task.await;
        })
        .await;
        if stopped.is_err() {
            warn!("coordinator: run {} tasks did not stop in time", active.run_id);
        }
    }
}

/// Generator side of a run: execute, then parse on success.
async fn generate(
    runner: &dyn ProcessRunner,
    parser: &dyn PlaylistParser,
    command: RunCommand,
    cancel: CancellationToken,
) -> RunOutcome {
    match runner.run(command, cancel).await {
        Ok(output) if output.success() => match parser.parse(&output) {
            Ok(text) => RunOutcome::Playlist { text },
            Err(e) => {
                warn!("coordinator: {}", e);
                RunOutcome::ParseFailed {
                    message: e.to_string(),
                    unsupported: e.is_unsupported(),
                }
            }
        },
        Ok(output) => RunOutcome::GeneratorFailed { code: output.code },
        Err(RunError::Cancelled) => RunOutcome::Cancelled,
        Err(e @ RunError::Launch { .. }) => {
            error!("coordinator: {}", e);
            RunOutcome::LaunchFailed {
                message: e.to_string(),
            }
        }
        Err(RunError::Wait(e)) => {
            error!("coordinator: lost track of generator: {}", e);
            RunOutcome::GeneratorFailed { code: None }
        }
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable front door to a running Coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoreEvent>,
}

impl CoordinatorHandle {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { tx }
    }

    pub async fn submit(
        &self,
        selection: Selection,
        duration: DurationRange,
    ) -> Result<RunId, SubmitError> {
        let reply = self
            .request(|reply| CoreEvent::Submit {
                selection,
                duration,
                reply,
            })
            .await;
        match reply {
            Ok(result) => result,
            Err(e) => Err(SubmitError::Unavailable(e.to_string())),
        }
    }

    pub async fn cancel(&self) -> anyhow::Result<bool> {
        self.request(|reply| CoreEvent::Cancel { reply }).await
    }

    pub async fn state(&self) -> anyhow::Result<RunSnapshot> {
        self.request(|reply| CoreEvent::GetState { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoreEvent::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CoreEvent,
    ) -> anyhow::Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("coordinator event loop gone"))?;

        tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("coordinator request timed out"))?
            .map_err(|_| anyhow::anyhow!("coordinator reply channel dropped"))
    }
}
