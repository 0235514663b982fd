//! Log poller: tails the generator's log file until the done sentinel shows up.
//!
//! The generator gives us no channel other than the file system: it appends to
//! `log.txt` while it works and creates `done.txt` when it is finished.  Each
//! iteration checks the sentinel first, then reads the whole log and publishes
//! it if it changed, then sleeps.  Once the sentinel exists at most one more
//! read happens, so the published log can lag the file by one interval.

use futures_util::FutureExt;
use playlist_proto::config::PollingConfig;
use playlist_proto::protocol::{PollOutcome, RunId};
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::CoreEvent;
use crate::panic_message;

#[derive(Debug, Clone)]
pub struct LogPoller {
    log_path: PathBuf,
    done_path: PathBuf,
    interval: Duration,
    max_wait: Duration,
}

impl LogPoller {
    pub fn new(log_path: PathBuf, done_path: PathBuf, interval: Duration, max_wait: Duration) -> Self {
        Self {
            log_path,
            done_path,
            interval,
            max_wait,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(
            config.log_file.clone(),
            config.done_file.clone(),
            config.interval(),
            config.max_wait(),
        )
    }

    pub fn done_path(&self) -> &Path {
        &self.done_path
    }

    /// Start polling on its own task.  Log text goes to `events` as
    /// `CoreEvent::Log`, followed by one `CoreEvent::PollerStopped`; the
    /// handle resolves to the same outcome.  A panic while polling is
    /// reported as `PollOutcome::Failed`.
    pub fn spawn(
        self,
        run_id: RunId,
        events: mpsc::Sender<CoreEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<PollOutcome> {
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(self.poll(run_id, events.clone(), cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    error!(
                        "poller[{}]: panicked: {}",
                        run_id,
                        panic_message(payload.as_ref())
                    );
                    PollOutcome::Failed
                });
            let _ = events
                .send(CoreEvent::PollerStopped { run_id, outcome })
                .await;
            outcome
        })
    }

    pub async fn poll(
        self,
        run_id: RunId,
        events: mpsc::Sender<CoreEvent>,
        cancel: CancellationToken,
    ) -> PollOutcome {
        let started = Instant::now();
        let mut published: Option<String> = None;

        info!(
            "poller[{}]: watching {} until {} exists",
            run_id,
            self.log_path.display(),
            self.done_path.display()
        );

        loop {
            if cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            if is_done(&self.done_path).await {
                debug!("poller[{}]: done sentinel found", run_id);
                return PollOutcome::Done;
            }
            if started.elapsed() >= self.max_wait {
                warn!(
                    "poller[{}]: no done sentinel after {:?}, giving up",
                    run_id, self.max_wait
                );
                return PollOutcome::TimedOut;
            }

            match read_log(&self.log_path).await {
                Ok(text) => {
                    if published.as_deref() != Some(text.as_str()) {
                        let event = CoreEvent::Log {
                            run_id,
                            text: text.clone(),
                        };
                        if events.send(event).await.is_err() {
                            debug!("poller[{}]: event channel closed", run_id);
                            return PollOutcome::Cancelled;
                        }
                        published = Some(text);
                    }
                }
                // Typically the writer holding the file; retry next interval.
                Err(e) => warn!(
                    "poller[{}]: could not read {}: {}",
                    run_id,
                    self.log_path.display(),
                    e
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Read the whole log.  A log that does not exist yet reads as empty.
pub async fn read_log(path: &Path) -> io::Result<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

async fn is_done(done_path: &Path) -> bool {
    tokio::fs::try_exists(done_path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn poller(dir: &Path, interval_ms: u64, max_wait_ms: u64) -> LogPoller {
        LogPoller::new(
            dir.join("log.txt"),
            dir.join("done.txt"),
            Duration::from_millis(interval_ms),
            Duration::from_millis(max_wait_ms),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<CoreEvent>) -> Vec<String> {
        let mut logs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::Log { text, .. } = event {
                logs.push(text);
            }
        }
        logs
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_log(&dir.path().join("absent.txt")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_unchanged_log_reads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "Playlist Creator - started\n").unwrap();

        let first = read_log(&path).await.unwrap();
        let second = read_log(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "Playlist Creator - started\n");
    }

    #[tokio::test]
    async fn test_existing_done_file_stops_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), "old").unwrap();
        std::fs::write(dir.path().join("done.txt"), "").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = poller(dir.path(), 10, 5_000)
            .poll(1, tx, CancellationToken::new())
            .await;
        assert_eq!(outcome, PollOutcome::Done);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_publishes_changes_then_stops_on_done() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.txt");
        let (tx, mut rx) = mpsc::channel(64);
        let handle = poller(dir.path(), 20, 10_000).spawn(9, tx, CancellationToken::new());

        // Missing log is published once as empty.
        match rx.recv().await.unwrap() {
            CoreEvent::Log { run_id, text } => {
                assert_eq!(run_id, 9);
                assert_eq!(text, "");
            }
            other => panic!("unexpected event {:?}", other),
        }

        std::fs::write(&log_path, "line 1\n").unwrap();
        loop {
            if let CoreEvent::Log { text, .. } = rx.recv().await.unwrap() {
                if text == "line 1\n" {
                    break;
                }
            }
        }

        std::fs::write(dir.path().join("done.txt"), "").unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        writeln!(file, "line 2").unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Done);

        let mut rest = Vec::new();
        while let Ok(event) = rx.try_recv() {
            rest.push(event);
        }
        // At most one read after the sentinel appeared.
        let late_logs = rest
            .iter()
            .filter(|event| matches!(event, CoreEvent::Log { .. }))
            .count();
        assert!(late_logs <= 1);
        assert!(matches!(
            rest.last(),
            Some(CoreEvent::PollerStopped {
                run_id: 9,
                outcome: PollOutcome::Done
            })
        ));
    }

    #[tokio::test]
    async fn test_times_out_without_done_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            poller(dir.path(), 10, 100).poll(1, tx, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = poller(dir.path(), 60_000, 600_000).spawn(1, tx, cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = poller(dir.path(), 10, 5_000)
            .poll(1, tx, CancellationToken::new())
            .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
