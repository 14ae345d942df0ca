//! TCP relay server
//!
//! Accepts clients, registers each one, and runs a handler task per
//! connection. Every message is relayed to all other connected clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::{ConnectionHandler, ConnectionState};
use crate::registry::Registry;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF_MS: u64 = 50;

/// Relay server handle
pub struct Server {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
    accept_handle: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start accepting
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|source| Error::Connect {
                addr: config.bind.clone(),
                source,
            })?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Chat server started");

        let registry = Arc::new(Registry::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            Arc::new(config),
            shutdown_tx.subscribe(),
        ));

        Ok(Server {
            addr: bound_addr,
            registry,
            shutdown_tx,
            accept_handle,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, close every connection, and wait for all connection
    /// tasks to finish
    pub async fn shutdown(self) {
        info!("Server shutdown initiated");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.accept_handle.await {
            error!(error = %e, "Accept loop failed");
        }
        info!("Server stopped");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let broadcaster = Broadcaster::new(registry.clone(), config.max_frame_size);
    let mut tasks: JoinSet<ConnectionState> = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let server_address = stream
                            .local_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_default();

                        // Registered before the handler starts, so the
                        // connection is broadcastable from its first message
                        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbound_queue);
                        let entry = registry.register(peer.to_string(), outbox_tx);
                        debug!(id = %entry.id(), addr = %peer, "New connection");

                        let handler = ConnectionHandler::new(
                            entry,
                            broadcaster.clone(),
                            config.clone(),
                            server_address,
                        );
                        tasks.spawn(handler.run(stream, outbox_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Connection task failed");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }

    drop(listener);

    let open = registry.close_all();
    debug!(connections = open, "Closing connections");

    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection task failed");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "Aborting connection tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
