//! Network protocol message types
//!
//! Every frame carries one protobuf-encoded [`Envelope`]. Text is always
//! terminated by [`MESSAGE_DELIM`] and never contains it anywhere else.

use chrono::Utc;
use prost::Message;
use serde::{Deserialize, Serialize};

/// Terminates the text of every envelope
pub const MESSAGE_DELIM: char = '\r';

/// A chat message transmitted over the network
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct Envelope {
    /// Message text, delimiter-terminated
    #[prost(string, tag = "1")]
    pub text: String,
    /// Address of the connection the text came from
    #[prost(string, tag = "2")]
    pub from_address: String,
    /// Send time, seconds since the Unix epoch (UTC)
    #[prost(int64, tag = "3")]
    pub utc_timestamp_seconds: i64,
}

impl Envelope {
    /// Build an envelope stamped with the current time
    pub fn new(text: &str, from_address: impl Into<String>) -> Self {
        Self {
            text: normalize_text(text),
            from_address: from_address.into(),
            utc_timestamp_seconds: Utc::now().timestamp(),
        }
    }

    /// Join notification for a peer that just connected
    pub fn joined(peer_address: &str) -> Self {
        Self::new(&format!("{} joined the chat", peer_address), peer_address)
    }

    /// Greeting sent directly to a new peer, attributed to the server
    pub fn welcome(peer_address: &str, server_address: &str) -> Self {
        Self::new(&format!("Welcome {}", peer_address), server_address)
    }

    /// Whether the text carries nothing worth delivering
    pub fn is_blank(&self) -> bool {
        is_blank(&self.text)
    }

    /// Text without its terminal delimiter
    pub fn body(&self) -> &str {
        self.text
            .strip_suffix(MESSAGE_DELIM)
            .unwrap_or(&self.text)
    }

    /// Serialize to protobuf bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserialize from protobuf bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

/// Strip line terminators and stray delimiters, then terminate with
/// [`MESSAGE_DELIM`]
pub fn normalize_text(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    let mut text: String = trimmed.chars().filter(|c| *c != MESSAGE_DELIM).collect();
    text.push(MESSAGE_DELIM);
    text
}

/// True for empty or whitespace-only text (delimiter included)
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}
