use playlist_daemon::core::{Coordinator, CoordinatorHandle, CoreEvent};
use playlist_daemon::{logging, socket, BroadcastMessage};
use playlist_proto::config::Config;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Created before logging so WARN/ERROR events can be forwarded to clients.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let log_path = playlist_proto::platform::data_dir().join("daemon.log");
    logging::init(&log_path, "info,playlist_daemon=debug", Some(broadcast_tx.clone()))?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    info!(
        "Generator: {} {} (log {:?}, done {:?})",
        config.generator.program,
        config.generator.base_args.join(" "),
        config.polling.log_file,
        config.polling.done_file
    );

    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);
    let coordinator = Coordinator::from_config(&config, broadcast_tx.clone(), event_tx.clone()).await;

    let listener = socket::bind(&config.server.bind_address, config.server.port).await?;
    let _server = socket::start_server(
        listener,
        coordinator.state_manager(),
        CoordinatorHandle::new(event_tx.clone()),
        broadcast_tx,
    );

    let handle = CoordinatorHandle::new(event_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            handle.shutdown().await;
        }
    });

    info!("Daemon initialised, running event loop");
    coordinator.run(event_rx).await
}
