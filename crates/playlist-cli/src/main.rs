mod connection;
mod report;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use playlist_daemon::core::{Coordinator, CoordinatorHandle, CoreEvent};
use playlist_daemon::{logging, BroadcastMessage};
use playlist_proto::config::Config;
use playlist_proto::protocol::{Broadcast, Command, Message, RunOutcome};
use playlist_proto::selection::{DurationRange, Selection};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use connection::DaemonConnection;
use report::RunReport;

#[derive(Parser, Debug)]
#[command(name = "playlist", version, about = "Generate playlists with the external generator")]
struct Cli {
    /// Config file (default: the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon address (default: from config)
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start a run and follow its log until the playlist is ready
    Run(RunArgs),
    /// Cancel the daemon's active run
    Cancel,
    /// Show the daemon's current or last run
    Status,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Albums file
    #[arg(short = 'l', long)]
    albums: Option<String>,

    /// Artists file
    #[arg(short = 'r', long)]
    artists: Option<String>,

    /// Songs file, optionally followed by ",COUNT"
    #[arg(short = 's', long)]
    songs: Option<String>,

    /// Genres file
    #[arg(short = 'g', long)]
    genres: Option<String>,

    /// Minimum playlist duration in minutes
    #[arg(short = 'd', long = "min")]
    minimum: String,

    /// Maximum playlist duration in minutes
    #[arg(short = 'u', long = "max")]
    maximum: String,

    /// Run the generator in this process instead of through the daemon.
    /// Refused while the daemon has a run in progress.
    #[arg(long)]
    local: bool,
}

impl RunArgs {
    fn selection(&self) -> Selection {
        Selection {
            albums: self.albums.clone(),
            artists: self.artists.clone(),
            songs: self.songs.clone(),
            genres: self.genres.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = playlist_proto::platform::data_dir().join("cli.log");
    logging::init(&log_path, "info", None)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let address = cli
        .address
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.server.bind_address, config.server.port));

    match cli.command {
        CliCommand::Run(args) => {
            let selection = args.selection();
            let duration = DurationRange::parse(&args.minimum, &args.maximum)?;
            let outcome = if args.local {
                ensure_daemon_idle(&address).await?;
                run_local(&local_config(&config), selection, duration).await?
            } else {
                run_remote(&address, selection, duration).await?
            };
            if !outcome.is_success() {
                anyhow::bail!("{}", outcome.describe());
            }
        }
        CliCommand::Cancel => {
            let (mut conn, snapshot) = DaemonConnection::connect(&address).await?;
            if !snapshot.is_active() {
                println!("nothing to cancel");
                return Ok(());
            }
            conn.send_command(Command::Cancel).await?;
            println!("cancel requested for run {}", snapshot.run_id.unwrap_or_default());
        }
        CliCommand::Status => {
            let (_conn, snapshot) = DaemonConnection::connect(&address).await?;
            println!("{}", report::describe_snapshot(&snapshot));
        }
    }

    Ok(())
}

async fn run_remote(
    address: &str,
    selection: Selection,
    duration: DurationRange,
) -> anyhow::Result<RunOutcome> {
    let (mut conn, _) = DaemonConnection::connect(address).await?;
    conn.send_command(Command::Submit {
        selection,
        duration,
    })
    .await?;

    let mut report: Option<RunReport<io::Stdout>> = None;
    let mut cancel_sent = false;

    loop {
        let msg = tokio::select! {
            msg = conn.receive_message() => msg?,
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                warn!("interrupted, cancelling run");
                conn.send_command(Command::Cancel).await?;
                cancel_sent = true;
                continue;
            }
        };

        let broadcast = match msg {
            Some(Message::Broadcast(broadcast)) => broadcast,
            Some(Message::Command(_)) => continue,
            None => anyhow::bail!("daemon closed the connection before the run finished"),
        };

        match broadcast {
            Broadcast::Accepted { run_id, command } if report.is_none() => {
                info!("run {} accepted: {}", run_id, command);
                eprintln!("run {}: {}", run_id, command);
                report = Some(RunReport::new(run_id, io::stdout()));
            }
            Broadcast::Rejected { reason } if report.is_none() => {
                anyhow::bail!("run rejected: {}", reason);
            }
            Broadcast::Notice { message } => eprintln!("{}", message),
            other => {
                if let Some(report) = report.as_mut() {
                    if let Some(outcome) = report.apply(&other)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }
}

const DAEMON_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// A local run writes its own state file.  The generator's log and done
/// files are fixed by the generator, so they stay shared with the daemon.
fn local_config(config: &Config) -> Config {
    let mut local = config.clone();
    local.daemon.state_file = config.daemon.state_file.with_file_name("local-state.json");
    local
}

/// Refuse a local run while the daemon is generating; both would clear and
/// poll the same done file.  An unreachable daemon counts as idle.
async fn ensure_daemon_idle(address: &str) -> anyhow::Result<()> {
    match tokio::time::timeout(DAEMON_CHECK_TIMEOUT, DaemonConnection::connect(address)).await {
        Ok(Ok((_conn, snapshot))) if snapshot.is_active() => anyhow::bail!(
            "daemon at {} is running run {}; a local run would share its log and done files",
            address,
            snapshot.run_id.unwrap_or_default()
        ),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            debug!("no daemon to check before local run: {}", e);
            Ok(())
        }
        Err(_) => {
            debug!("daemon at {} did not answer, running locally", address);
            Ok(())
        }
    }
}

/// Same flow as the daemon, with the Coordinator running in this process.
async fn run_local(
    config: &Config,
    selection: Selection,
    duration: DurationRange,
) -> anyhow::Result<RunOutcome> {
    let (broadcast_tx, mut broadcast_rx) = broadcast::channel::<BroadcastMessage>(256);
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    let coordinator = Coordinator::from_config(config, broadcast_tx, event_tx.clone()).await;
    let core = tokio::spawn(coordinator.run(event_rx));
    let handle = CoordinatorHandle::new(event_tx);

    let result = follow_local(&handle, &mut broadcast_rx, selection, duration).await;

    handle.shutdown().await;
    match core.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("coordinator stopped with error: {}", e),
        Err(e) => warn!("coordinator task ended abnormally: {}", e),
    }
    result
}

async fn follow_local(
    handle: &CoordinatorHandle,
    broadcast_rx: &mut broadcast::Receiver<BroadcastMessage>,
    selection: Selection,
    duration: DurationRange,
) -> anyhow::Result<RunOutcome> {
    let run_id = handle.submit(selection, duration).await?;
    let command = handle.state().await?.command.unwrap_or_default();
    info!("run {} started locally: {}", run_id, command);
    eprintln!("run {}: {}", run_id, command);

    let mut report = RunReport::new(run_id, io::stdout());
    let mut cancel_sent = false;

    loop {
        let msg = tokio::select! {
            msg = broadcast_rx.recv() => msg,
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                warn!("interrupted, cancelling run");
                handle.cancel().await?;
                cancel_sent = true;
                continue;
            }
        };

        let broadcast = match msg {
            Ok(BroadcastMessage::StateUpdated) | Err(broadcast::error::RecvError::Lagged(_)) => {
                Broadcast::State {
                    data: handle.state().await?,
                }
            }
            Ok(BroadcastMessage::Log { run_id, text }) => Broadcast::Log { run_id, text },
            Ok(BroadcastMessage::Playlist { run_id, outcome }) => {
                Broadcast::Playlist { run_id, outcome }
            }
            Ok(BroadcastMessage::Notice(message)) => {
                eprintln!("{}", message);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("coordinator stopped before the run finished")
            }
        };

        if let Some(outcome) = report.apply(&broadcast)? {
            return Ok(outcome);
        }
    }
}
