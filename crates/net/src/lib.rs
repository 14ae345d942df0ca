//! tcpchat network library
//!
//! A TCP chat relay: every message a client sends is fanned out to every
//! other connected client.
//!
//! # Architecture
//!
//! - **Frame**: length-prefixed protobuf envelopes and a stream de-framer
//! - **Registry**: the set of live connections, snapshotted for broadcast
//! - **Broadcast**: non-blocking fan-out to every peer but the origin
//! - **Handler**: per-connection lifecycle and read loop
//! - **Server**: accept loop, task supervision, graceful shutdown
//! - **Client**: connects to a server and exchanges envelopes
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default()).await?;
//!
//! let mut client = Client::connect("localhost:9090", DEFAULT_MAX_FRAME_SIZE).await?;
//! client.send_text("hello").await?;
//! while let Some(ServerEvent::Message(msg)) = client.next_event().await {
//!     println!("[{}] {}", msg.from_address, msg.body());
//! }
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
mod handler;
pub mod protocol;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastReport, Broadcaster, Outgoing};
pub use client::{Client, ServerEvent};
pub use config::{ClientConfig, Config, ServerConfig};
pub use error::{Error, PeerWriteError, Result};
pub use frame::{decode, encode, Deframer, FrameReader, DEFAULT_MAX_FRAME_SIZE};
pub use handler::ConnectionState;
pub use protocol::{Envelope, MESSAGE_DELIM};
pub use registry::{ConnectionEntry, ConnectionId, Registry};
pub use server::Server;

/// Default server address
pub const DEFAULT_ADDR: &str = "localhost:9090";
