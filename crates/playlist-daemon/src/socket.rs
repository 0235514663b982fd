use crate::core::CoordinatorHandle;
use crate::BroadcastMessage;
use playlist_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use playlist_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub fn start_server(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    coordinator: CoordinatorHandle,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("TCP server listening at {}", addr);
        }

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let sm = state_manager.clone();
                    let handle = coordinator.clone();
                    let bcast_rx = broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, sm, id, handle, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

/// Bind the configured address.
pub async fn bind(bind_address: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", bind_address, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind TCP socket {}: {}", addr, e))
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    coordinator: CoordinatorHandle,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: state_manager.get_state().await,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(frame_len) = Message::frame_len(&read_buf) {
                            let decoded = Message::decode(&read_buf[..frame_len]);
                            read_buf.drain(..frame_len);

                            let reply = match decoded {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    execute(cmd, &coordinator, &state_manager).await
                                }
                                Ok((Message::Broadcast(_), _)) => continue,
                                Err(e) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, e);
                                    Broadcast::Rejected {
                                        reason: format!("malformed command: {}", e),
                                    }
                                }
                            };
                            if send(&mut write_half, reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let outgoing = match msg {
                    Ok(BroadcastMessage::StateUpdated) => Broadcast::State {
                        data: state_manager.get_state().await,
                    },
                    Ok(BroadcastMessage::Log { run_id, text }) => Broadcast::Log { run_id, text },
                    Ok(BroadcastMessage::Playlist { run_id, outcome }) => {
                        Broadcast::Playlist { run_id, outcome }
                    }
                    Ok(BroadcastMessage::Notice(message)) => Broadcast::Notice { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State {
                            data: state_manager.get_state().await,
                        }
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn execute(
    cmd: Command,
    coordinator: &CoordinatorHandle,
    state_manager: &StateManager,
) -> Broadcast {
    match cmd {
        Command::Submit {
            selection,
            duration,
        } => match coordinator.submit(selection, duration).await {
            Ok(run_id) => {
                let command = state_manager.get_state().await.command.unwrap_or_default();
                Broadcast::Accepted { run_id, command }
            }
            Err(e) => Broadcast::Rejected {
                reason: e.to_string(),
            },
        },
        Command::Cancel => {
            if let Err(e) = coordinator.cancel().await {
                warn!("cancel failed: {}", e);
            }
            Broadcast::State {
                data: state_manager.get_state().await,
            }
        }
        Command::GetState => Broadcast::State {
            data: state_manager.get_state().await,
        },
    }
}

async fn send(write_half: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}
