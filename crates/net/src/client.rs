//! TCP client for connecting to a chat server

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{encode, relay_limit, write_frame, FrameReader};
use crate::protocol::Envelope;

/// Event received from the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A relayed message (or join notification)
    Message(Envelope),
    /// Connection lost or closed
    Disconnected,
}

enum ClientCommand {
    Send(Bytes),
    Disconnect,
}

/// Client handle for network operations
pub struct Client {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    event_rx: mpsc::Receiver<ServerEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl Client {
    /// Connect to a chat server at `addr` (`host:port`)
    pub async fn connect(addr: &str, max_frame_size: usize) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            FrameReader::new(reader, relay_limit(max_frame_size)),
            writer,
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            local_addr,
            peer_addr,
            max_frame_size,
            event_rx,
            cmd_tx,
        })
    }

    /// Our side of the connection, as the server sees it
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the next server event
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.recv().await
    }

    /// Send one line of text
    ///
    /// Text too large for one frame is refused with
    /// [`Error::FrameTooLarge`] and the connection stays open.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let msg = Envelope::new(text, self.local_addr.to_string());
        let frame = encode(&msg, self.max_frame_size)?;
        self.cmd_tx
            .send(ClientCommand::Send(frame))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Main connection task
async fn connection_task(
    mut reader: FrameReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    event_tx: mpsc::Sender<ServerEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            // Incoming message from server
            result = reader.next_envelope() => {
                match result {
                    Ok(msg) => {
                        if event_tx.send(ServerEvent::Message(msg)).await.is_err() {
                            debug!("Event receiver dropped");
                            break;
                        }
                    }
                    Err(Error::MalformedFrame(reason)) => {
                        warn!(reason = %reason, "Dropped malformed frame");
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(frame)) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    cmd_rx.close();
    let _ = writer.shutdown().await;
    let _ = event_tx.send(ServerEvent::Disconnected).await;
    info!("Disconnected from server");
}
