// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replication wire format
//!
//! Every frame is a big-endian `u32` body length followed by the body. The
//! `Challenge` that opens a connection is plain CBOR; every later frame is
//! a CBOR `Message` sealed with the session cipher.

use peerchat_core::{Challenge, Digest, Entry, Role};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::secure::{FrameOpener, FrameSealer};

/// Bumped on any incompatible change to `Message`
pub const PROTOCOL_VERSION: u16 = 2;

/// Default upper bound on a frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_cbor::Error),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("frame failed authentication")]
    Unauthenticated,

    #[error("frame could not be sealed")]
    Seal,
}

/// Messages exchanged by a replication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message in each direction, sent in the clear
    Challenge {
        version: u16,
        peer_id: Vec<u8>,
        nonce: Challenge,
    },
    /// First sealed message: answers the remote's challenge
    Hello {
        peer_id: Vec<u8>,
        room_proof: Digest,
        length: u64,
        last_digest: Digest,
    },
    /// Credit grant: send me sequences `from..to`
    Request { from: u64, to: u64 },
    /// One log entry
    EntryData {
        sequence: u64,
        role: Role,
        content: String,
        digest: Digest,
    },
    /// Orderly close
    Bye { reason: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Challenge { .. } => "challenge",
            Message::Hello { .. } => "hello",
            Message::Request { .. } => "request",
            Message::EntryData { .. } => "entry",
            Message::Bye { .. } => "bye",
        }
    }

    pub fn bye(reason: impl Into<String>) -> Self {
        Message::Bye {
            reason: reason.into(),
        }
    }
}

impl From<Entry> for Message {
    fn from(entry: Entry) -> Self {
        Message::EntryData {
            sequence: entry.sequence,
            role: entry.role,
            content: entry.content,
            digest: entry.digest,
        }
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    Ok(serde_cbor::to_vec(message)?)
}

pub fn decode(body: &[u8]) -> Result<Message, WireError> {
    Ok(serde_cbor::from_slice(body)?)
}

/// Write one length-prefixed body and flush
pub async fn write_body<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed body.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub async fn read_body<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    read_exact_or_truncated(reader, &mut header[1..]).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(WireError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    read_exact_or_truncated(reader, &mut body).await?;
    Ok(Some(body))
}

/// Write one plaintext frame
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_body(writer, &encode(message)?).await
}

/// Read one plaintext frame
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_body(reader, max_len).await? {
        Some(body) => Ok(Some(decode(&body)?)),
        None => Ok(None),
    }
}

/// Seal `message` under the session's outbound key and write it
pub async fn write_sealed<W>(writer: &mut W, sealer: &mut FrameSealer, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = sealer.seal(&encode(message)?)?;
    write_body(writer, &body).await
}

/// Read one frame and open it with the session's inbound key
pub async fn read_sealed<R>(
    reader: &mut R,
    opener: &mut FrameOpener,
    max_len: usize,
) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_body(reader, max_len).await? {
        Some(body) => Ok(Some(opener.open(&body)?)),
        None => Ok(None),
    }
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Truncated),
        Err(e) => Err(e.into()),
    }
}
