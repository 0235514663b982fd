use playlist_proto::protocol::{Broadcast, Command, Message, RunSnapshot, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl DaemonConnection {
    /// Connect and consume the daemon's `Hello`, returning its snapshot.
    pub async fn connect(address: &str) -> anyhow::Result<(Self, RunSnapshot)> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to daemon at {}: {}", address, e))?;
        let mut conn = Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        };

        match conn.receive_message().await? {
            Some(Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
            })) => {
                if protocol_version != PROTOCOL_VERSION {
                    anyhow::bail!(
                        "daemon speaks protocol {}, expected {}",
                        protocol_version,
                        PROTOCOL_VERSION
                    );
                }
                Ok((conn, state))
            }
            Some(other) => anyhow::bail!("expected Hello from daemon, got {:?}", other),
            None => anyhow::bail!("daemon closed the connection during handshake"),
        }
    }

    pub async fn send_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        let msg = Message::Command(cmd);
        let encoded = msg.encode()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Next complete frame, or `None` once the daemon closes the connection.
    /// Cancel safe: bytes are only buffered after a read completes.
    pub async fn receive_message(&mut self) -> anyhow::Result<Option<Message>> {
        let mut buf = [0u8; 4096];

        loop {
            if let Some(frame_len) = Message::frame_len(&self.read_buffer) {
                let decoded = Message::decode(&self.read_buffer[..frame_len]);
                self.read_buffer.drain(..frame_len);
                let (msg, _) = decoded?;
                return Ok(Some(msg));
            }

            match self.stream.read(&mut buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => self.read_buffer.extend_from_slice(&buf[..n]),
                Err(e) => return Err(anyhow::anyhow!("Read error: {}", e)),
            }
        }
    }
}
