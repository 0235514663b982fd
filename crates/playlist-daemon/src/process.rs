//! External generator process.
//!
//! The runner owns the child for its whole lifetime: it launches it, drains
//! stdout into a buffer for the playlist parser, forwards stderr lines to the
//! log, and waits for exit.  A fired cancellation token kills the child.
//!
//! Anything the generator backgrounds inherits its stdout, so the pipe can
//! outlive the child.  Draining after exit is bounded by `STDOUT_DRAIN` and
//! still honours cancellation.

use futures_util::future::BoxFuture;
use playlist_proto::command::RunCommand;
use playlist_proto::config::GeneratorConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long stdout may stay open after the generator itself has exited.
pub const STDOUT_DRAIN: Duration = Duration::from_secs(2);

/// What the generator left behind when it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The executable could not be started (missing, not executable, ...).
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for generator: {0}")]
    Wait(#[source] std::io::Error),
    #[error("run cancelled")]
    Cancelled,
}

/// Runs one command to completion.  Implementations must return promptly
/// once `cancel` fires.
pub trait ProcessRunner: Send + Sync + 'static {
    fn run(
        &self,
        command: RunCommand,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ProcessOutput, RunError>>;
}

/// Launches the configured generator executable.
#[derive(Debug, Clone)]
pub struct GeneratorProcess {
    program: String,
    base_args: Vec<String>,
    working_dir: Option<PathBuf>,
    stdout_drain: Duration,
}

impl GeneratorProcess {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            working_dir: None,
            stdout_drain: STDOUT_DRAIN,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            program: config.program.clone(),
            base_args: config.base_args.clone(),
            working_dir: config.working_dir.clone(),
            stdout_drain: STDOUT_DRAIN,
        }
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_stdout_drain(mut self, drain: Duration) -> Self {
        self.stdout_drain = drain;
        self
    }
}

impl ProcessRunner for GeneratorProcess {
    fn run(
        &self,
        command: RunCommand,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ProcessOutput, RunError>> {
        let this = self.clone();
        Box::pin(async move { this.run_to_exit(command, cancel).await })
    }
}

impl GeneratorProcess {
    async fn run_to_exit(
        self,
        command: RunCommand,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, RunError> {
        info!("generator: launching {} {}", self.program, command);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(command.into_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunError::Launch {
            program: self.program.clone(),
            source,
        })?;

        // stdout must be drained concurrently or a chatty child blocks on a
        // full pipe and never exits.
        let drain_stop = CancellationToken::new();
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(drain(stdout, drain_stop.clone())));

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("generator: {}", line);
                }
            });
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status.map_err(RunError::Wait)?,
            None => {
                info!("generator: cancellation requested, terminating");
                if let Err(e) = child.kill().await {
                    warn!("generator: failed to terminate: {}", e);
                }
                return Err(RunError::Cancelled);
            }
        };

        let stdout = match stdout_task {
            Some(mut task) => tokio::select! {
                _ = cancel.cancelled() => {
                    info!("generator: cancelled while draining stdout");
                    task.abort();
                    return Err(RunError::Cancelled);
                }
                joined = tokio::time::timeout(self.stdout_drain, &mut task) => match joined {
                    Ok(joined) => joined.unwrap_or_default(),
                    Err(_) => {
                        warn!(
                            "generator: stdout still open {:?} after exit, keeping what was read",
                            self.stdout_drain
                        );
                        drain_stop.cancel();
                        task.await.unwrap_or_default()
                    }
                },
            },
            None => String::new(),
        };

        debug!(
            "generator: exited with {:?} ({} bytes of stdout)",
            status.code(),
            stdout.len()
        );
        Ok(ProcessOutput {
            code: status.code(),
            stdout,
        })
    }
}

/// Read until EOF or until `stop` fires, returning whatever arrived.
async fn drain<R: AsyncRead + Unpin>(mut stdout: R, stop: CancellationToken) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!("generator: stdout read error: {}", e);
                    break;
                }
            },
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
