//! Per-connection handler
//!
//! Drives one connection through
//! `Accepted -> Welcomed -> Serving -> Closing -> Closed`.
//!
//! The socket is split: this handler owns the read half, and a writer task
//! owns the write half and drains the connection's outbound queue. Both stop
//! when the entry's close signal is raised.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Broadcaster, Outgoing};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::frame::{encode, relay_limit, FrameReader};
use crate::protocol::Envelope;
use crate::registry::ConnectionEntry;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted and entry registered
    Accepted,
    /// Join notification sent to the other peers
    Welcomed,
    /// Reading and relaying messages
    Serving,
    /// Deregistered, socket being shut down
    Closing,
    /// Terminal
    Closed,
}

/// Why the serve loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Eof,
    ReadError,
    CloseSignal,
}

pub(crate) struct ConnectionHandler {
    entry: Arc<ConnectionEntry>,
    broadcaster: Broadcaster,
    config: Arc<ServerConfig>,
    server_address: String,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// `entry` must already be registered
    pub(crate) fn new(
        entry: Arc<ConnectionEntry>,
        broadcaster: Broadcaster,
        config: Arc<ServerConfig>,
        server_address: String,
    ) -> Self {
        Self {
            entry,
            broadcaster,
            config,
            server_address,
            state: ConnectionState::Accepted,
        }
    }

    /// Run the connection to completion
    pub(crate) async fn run<S>(mut self, stream: S, outbox: mpsc::Receiver<Bytes>) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let addr = self.entry.remote_address().to_string();
        info!(id = %self.entry.id(), addr = %addr, "Client connected");

        let (reader, writer) = tokio::io::split(stream);
        let writer_handle = tokio::spawn(writer_task(
            writer,
            outbox,
            self.entry.clone(),
            self.config.write_timeout(),
        ));

        self.welcome();

        self.transition(ConnectionState::Serving);
        let exit = self.serve(reader).await;
        debug!(addr = %addr, exit = ?exit, "Serve loop finished");

        self.close(writer_handle).await;
        info!(id = %self.entry.id(), addr = %addr, "Client disconnected");
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(addr = %self.entry.remote_address(), from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    fn welcome(&mut self) {
        let addr = self.entry.remote_address();

        if self.config.greet_new_peers {
            let greeting = Envelope::welcome(addr, &self.server_address);
            match encode(&greeting, relay_limit(self.config.max_frame_size)) {
                Ok(frame) => {
                    if let Err(e) = self.entry.try_deliver(frame) {
                        debug!(addr = %addr, error = %e, "Failed to queue greeting");
                    }
                }
                Err(e) => warn!(addr = %addr, error = %e, "Cannot encode greeting"),
            }
        }

        let report = self.broadcaster.broadcast(addr, Outgoing::Join);
        debug!(addr = %addr, notified = report.delivered, "Announced join");
        self.transition(ConnectionState::Welcomed);
    }

    async fn serve<S: AsyncRead>(&mut self, reader: ReadHalf<S>) -> Exit {
        let mut frames = FrameReader::new(reader, self.config.max_frame_size);
        let mut closed = self.entry.closed_signal();
        let addr = self.entry.remote_address().to_string();

        loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return Exit::CloseSignal,
                result = frames.next_envelope() => match result {
                    Ok(msg) if msg.is_blank() => {
                        trace!(addr = %addr, "Ignoring blank message");
                    }
                    Ok(msg) => {
                        info!(addr = %addr, size = msg.text.len(), "Client sent a message");
                        let report = self.broadcaster.broadcast(&addr, Outgoing::Text(msg.text));
                        if report.failed() > 0 {
                            debug!(addr = %addr, delivered = report.delivered, failed = report.failed(), "Broadcast partially delivered");
                        }
                    }
                    Err(Error::MalformedFrame(reason)) => {
                        warn!(addr = %addr, reason = %reason, "Dropped malformed frame");
                    }
                    Err(Error::ConnectionClosed) => return Exit::Eof,
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Read error");
                        return Exit::ReadError;
                    }
                },
            }
        }
    }

    async fn close(&mut self, writer_handle: JoinHandle<()>) {
        self.transition(ConnectionState::Closing);

        // Deregister before raising the signal so no new snapshot sees us
        self.broadcaster.registry().deregister(self.entry.id());
        self.entry.close();

        if let Err(e) = writer_handle.await {
            warn!(addr = %self.entry.remote_address(), error = %e, "Writer task failed");
        }
        self.transition(ConnectionState::Closed);
    }
}

/// Resolves once the close signal is raised
async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

/// Writer task - drains the outbound queue into the socket
async fn writer_task<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbox: mpsc::Receiver<Bytes>,
    entry: Arc<ConnectionEntry>,
    write_timeout: Duration,
) {
    let mut closed = entry.closed_signal();

    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(addr = %entry.remote_address(), error = %e, "Write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(addr = %entry.remote_address(), timeout_ms = write_timeout.as_millis() as u64, "Write timed out");
                        break;
                    }
                }
            }
        }
    }

    // Refuse anything queued from here on, and stop the reader too
    outbox.close();
    entry.close();
    let _ = writer.shutdown().await;
}
