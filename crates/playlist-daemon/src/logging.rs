//! Tracing setup for both binaries: a plain-text log file, plus (in the
//! daemon) a layer that turns WARN/ERROR events into client notices.

use std::fmt::Write as _;
use std::path::Path;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::BroadcastMessage;

/// Forwards WARN and ERROR events to connected clients as
/// `BroadcastMessage::Notice`.  Generator stderr is logged at WARN, so it
/// reaches clients through here too.
pub struct NoticeLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl NoticeLayer {
    pub fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S: Subscriber> Layer<S> for NoticeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level != Level::WARN && level != Level::ERROR {
            return;
        }

        let mut notice = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut NoticeVisitor(&mut notice));

        // Nobody listening is fine.
        let _ = self.sender.send(BroadcastMessage::Notice(notice));
    }
}

struct NoticeVisitor<'a>(&'a mut String);

impl Visit for NoticeVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            let _ = write!(self.0, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber: non-ANSI fmt output appended to
/// `log_path`, filtered by `RUST_LOG` or `default_filter`, with client
/// notices when `notices` is given.
pub fn init(
    log_path: &Path,
    default_filter: &str,
    notices: Option<broadcast::Sender<BroadcastMessage>>,
) -> anyhow::Result<()> {
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(notices.map(NoticeLayer::new))
        .with(filter)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notices_for(emit: impl FnOnce()) -> Vec<String> {
        let (tx, mut rx) = broadcast::channel(16);
        let subscriber = tracing_subscriber::registry().with(NoticeLayer::new(tx));
        tracing::subscriber::with_default(subscriber, emit);

        let mut notices = Vec::new();
        while let Ok(BroadcastMessage::Notice(text)) = rx.try_recv() {
            notices.push(text);
        }
        notices
    }

    #[test]
    fn test_only_warnings_and_errors_become_notices() {
        let notices = notices_for(|| {
            tracing::debug!("quiet");
            tracing::info!("still quiet");
            tracing::warn!("generator: Playlist Creator - started");
            tracing::error!(run_id = 3, "failed");
        });
        assert_eq!(notices.len(), 2);
        assert!(notices[0].contains("[WARN] generator: Playlist Creator - started"));
        assert!(notices[1].contains("[ERROR]"));
        assert!(notices[1].contains("failed"));
        assert!(notices[1].contains("run_id=3"));
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("test.log");
        // A global subscriber may already be installed by another test;
        // the file is opened either way.
        let _ = init(&path, "info", None);
        assert!(path.exists());
    }
}
