use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use playlist_daemon::core::{Coordinator, CoordinatorHandle, CoreEvent};
use playlist_daemon::parser::PendingParser;
use playlist_daemon::process::GeneratorProcess;
use playlist_daemon::socket;
use playlist_proto::config::{Config, PollingConfig};
use playlist_proto::protocol::{
    Broadcast, Command, Message, RunOutcome, RunPhase, PROTOCOL_VERSION,
};
use playlist_proto::selection::{DurationRange, Selection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

async fn read_broadcast(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Broadcast {
    let mut tmp = [0u8; 4096];
    loop {
        if let Ok((msg, consumed)) = Message::decode(buf) {
            buf.drain(..consumed);
            match msg {
                Message::Broadcast(b) => return b,
                other => panic!("daemon sent a command: {:?}", other),
            }
        }
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut tmp))
            .await
            .expect("no message from daemon")
            .unwrap();
        assert!(n > 0, "daemon closed the connection");
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn send(stream: &mut TcpStream, cmd: Command) {
    let encoded = Message::Command(cmd).encode().unwrap();
    stream.write_all(&encoded).await.unwrap();
}

struct Daemon {
    address: SocketAddr,
    event_tx: mpsc::Sender<CoreEvent>,
    core: JoinHandle<anyhow::Result<()>>,
}

impl Daemon {
    async fn start(dir: &Path) -> Self {
        let mut config = Config::default();
        config.daemon.state_file = dir.join("state.json");
        config.polling = PollingConfig {
            interval_ms: 20,
            exit_grace_ms: 100,
            ..config.polling.clone()
        }
        .with_log_dir(dir);

        let (broadcast_tx, _) = broadcast::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let coordinator = Coordinator::new(
            &config,
            Arc::new(GeneratorProcess::new("/nonexistent/playlist-generator")),
            Arc::new(PendingParser),
            broadcast_tx.clone(),
            event_tx.clone(),
        )
        .await;
        let state_manager = coordinator.state_manager();
        let core = tokio::spawn(coordinator.run(event_rx));

        let listener = socket::bind("127.0.0.1", 0).await.unwrap();
        let address = listener.local_addr().unwrap();
        socket::start_server(
            listener,
            state_manager,
            CoordinatorHandle::new(event_tx.clone()),
            broadcast_tx,
        );

        Self {
            address,
            event_tx,
            core,
        }
    }

    /// Connect and consume the Hello.
    async fn connect(&self) -> (TcpStream, Vec<u8>) {
        let mut stream = TcpStream::connect(self.address).await.unwrap();
        let mut buf = Vec::new();
        match read_broadcast(&mut stream, &mut buf).await {
            Broadcast::Hello {
                protocol_version, ..
            } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected Hello, got {:?}", other),
        }
        (stream, buf)
    }

    async fn stop(self) {
        CoordinatorHandle::new(self.event_tx).shutdown().await;
        self.core.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_submit_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path()).await;

    let (mut stream, mut buf) = daemon.connect().await;

    send(
        &mut stream,
        Command::Submit {
            selection: Selection {
                albums: Some("a.json".to_string()),
                genres: Some("g.json".to_string()),
                ..Selection::default()
            },
            duration: DurationRange::new(30, 120).unwrap(),
        },
    )
    .await;
    match read_broadcast(&mut stream, &mut buf).await {
        Broadcast::Rejected { reason } => {
            assert_eq!(reason, "You can't fill more than 1 value, you filled: 2")
        }
        other => panic!("expected Rejected, got {:?}", other),
    }

    send(
        &mut stream,
        Command::Submit {
            selection: Selection::genres("g.json"),
            duration: DurationRange::new(30, 120).unwrap(),
        },
    )
    .await;
    match read_broadcast(&mut stream, &mut buf).await {
        Broadcast::Accepted { run_id, command } => {
            assert_eq!(run_id, 1);
            assert_eq!(command, "-g g.json -d 30 -u 120");
        }
        other => panic!("expected Accepted, got {:?}", other),
    }

    let mut saw_playlist = false;
    loop {
        match read_broadcast(&mut stream, &mut buf).await {
            Broadcast::Playlist { run_id, outcome } => {
                assert_eq!(run_id, 1);
                assert!(matches!(outcome, RunOutcome::LaunchFailed { .. }));
                saw_playlist = true;
            }
            Broadcast::State { data } if data.phase == RunPhase::Finished => {
                assert!(matches!(data.outcome, Some(RunOutcome::LaunchFailed { .. })));
                break;
            }
            _ => {}
        }
    }
    assert!(saw_playlist);

    daemon.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_is_rejected_and_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path()).await;
    let (mut stream, mut buf) = daemon.connect().await;

    // Well framed, but a negative minimum does not fit the duration type.
    let body = br#"{"cmd":"Submit","selection":{"genres":"g.json"},"duration":{"minimum":-1,"maximum":10}}"#;
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(body);
    stream.write_all(&frame).await.unwrap();

    match read_broadcast(&mut stream, &mut buf).await {
        Broadcast::Rejected { reason } => assert!(reason.starts_with("malformed command")),
        other => panic!("expected Rejected, got {:?}", other),
    }

    send(&mut stream, Command::GetState).await;
    match read_broadcast(&mut stream, &mut buf).await {
        Broadcast::State { data } => {
            assert_eq!(data.phase, RunPhase::Idle);
            assert_eq!(data.run_id, None);
        }
        other => panic!("expected State, got {:?}", other),
    }

    daemon.stop().await;
}
