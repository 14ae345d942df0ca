//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Why a frame could not be queued for one broadcast recipient
///
/// Contained to the broadcast that hit it: logged and counted, never
/// returned to the sending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerWriteError {
    /// Outbound queue is full; the recipient is not keeping up
    #[error("outbound queue full")]
    Lagging,
    /// Outbound queue is closed; the recipient is shutting down
    #[error("connection closing")]
    Gone,
}

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Config error: {0}")]
    Config(String),
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::MalformedFrame(e.to_string())
    }
}
