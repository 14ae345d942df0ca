//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte little-endian length][protobuf payload]
//! Maximum frame size: 1MB by default (sanity limit)
//!
//! A socket read may return part of a frame, several frames, or both. The
//! [`Deframer`] buffers across reads and only hands out complete frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Extra payload bytes a relayed envelope may carry over the inbound limit
///
/// The server replaces the sender's address and timestamp when relaying, so
/// a payload accepted at the limit can grow by up to one socket address
/// string plus its field header and a full-width timestamp varint.
pub const RELAY_HEADROOM: usize = 128;

/// Largest payload that can be relayed for a given inbound limit
pub fn relay_limit(max_frame_size: usize) -> usize {
    max_frame_size.saturating_add(RELAY_HEADROOM)
}

/// Encode an envelope as a complete frame
pub fn encode(msg: &Envelope, max_frame_size: usize) -> Result<Bytes> {
    let payload = msg.to_bytes();
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode the frame at the start of `bytes`
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedFrame(format!(
            "truncated header: {} bytes",
            bytes.len()
        )));
    }

    let len = read_len(bytes);
    let available = bytes.len() - HEADER_LEN;
    if len > available {
        return Err(Error::MalformedFrame(format!(
            "declared {} bytes, {} available",
            len, available
        )));
    }

    Ok(Envelope::from_bytes(&bytes[HEADER_LEN..HEADER_LEN + len])?)
}

fn read_len(bytes: &[u8]) -> usize {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// Incremental stream de-framer
#[derive(Debug)]
pub struct Deframer {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Deframer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Append bytes received from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer for reading straight from a socket
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame payload, if one is buffered
    ///
    /// An oversized length prefix is an error; the stream cannot be
    /// resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = read_len(&self.buf);
        if len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Reads frames from a stream through a [`Deframer`]
pub struct FrameReader<R> {
    reader: R,
    deframer: Deframer,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            deframer: Deframer::new(max_frame_size),
        }
    }

    /// Read until a complete frame payload is available
    ///
    /// EOF is reported as [`Error::ConnectionClosed`], even when it cuts a
    /// frame short.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.deframer.next_frame()? {
                return Ok(frame);
            }

            let n = self.reader.read_buf(self.deframer.buffer_mut()).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Read and decode the next envelope
    ///
    /// A payload that fails to decode is consumed; the next call continues
    /// with the following frame.
    pub async fn next_envelope(&mut self) -> Result<Envelope> {
        let frame = self.next_frame().await?;
        Ok(Envelope::from_bytes(&frame)?)
    }
}

/// Write an already encoded frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode an envelope against `max_frame_size` and write it
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Envelope,
    max_frame_size: usize,
) -> Result<()> {
    let frame = encode(msg, max_frame_size)?;
    write_frame(writer, &frame).await
}
