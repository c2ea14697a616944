//! # Wire Protocol Messages
//!
//! Every frame on the wire is a big-endian `u32` length followed by a bincode
//! body. Bodies are bounded on both encode and decode.
//!
//! ## Streams
//!
//! | Stream | Direction | Frames |
//! |--------|-----------|--------|
//! | message stream | one unidirectional stream per side | `LinkFrame::Hello`, then `LinkFrame::Message`* |
//! | control stream | one bidirectional stream per request | `ControlRequest` → `ControlResponse` |
//!
//! ## Security Limits
//!
//! - `MAX_PAYLOAD_SIZE`: largest application payload (1 MiB)
//! - `MAX_FRAME_SIZE`: largest encoded frame, payload plus framing overhead
//! - `MAX_PEERS_PER_RESPONSE`: records accepted from one find-node answer

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{NodeId, PeerRecord};

/// Largest application payload carried by one message.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Largest encoded frame body.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 4096;

/// Records accepted from a single find-node response.
pub const MAX_PEERS_PER_RESPONSE: usize = 100;

/// Services a peer may advertise in its Hello.
pub const MAX_SERVICES_PER_HELLO: usize = 64;

pub const MAX_SERVICE_NAME_LEN: usize = 128;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// First frame on each side's message stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Services this node handles.
    pub services: Vec<String>,
    /// Address other nodes should dial, when the sender knows it.
    pub advertised_addr: Option<String>,
}

impl Hello {
    pub fn validate(&self) -> Result<()> {
        if self.services.len() > MAX_SERVICES_PER_HELLO {
            bail!(
                "too many services advertised: {} (max {})",
                self.services.len(),
                MAX_SERVICES_PER_HELLO
            );
        }
        for service in &self.services {
            if service.is_empty() || service.len() > MAX_SERVICE_NAME_LEN {
                bail!("invalid service name length: {}", service.len());
            }
        }
        Ok(())
    }

    /// The advertised address, if present and dialable.
    pub fn dialable_addr(&self) -> Option<SocketAddr> {
        let addr: SocketAddr = self.advertised_addr.as_deref()?.parse().ok()?;
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return None;
        }
        Some(addr)
    }
}

/// One application message addressed to a named service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub service: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    Hello(Hello),
    Message(Envelope),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Ping,
    FindNode { target: NodeId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Pong,
    Nodes(Vec<PeerInfo>),
    Error { message: String },
}

/// Wire form of a [`PeerRecord`]. The node ID is never sent; the receiver
/// derives it from the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub public_key: [u8; 32],
    pub addr: String,
}

impl PeerInfo {
    pub fn from_record(record: &PeerRecord) -> Self {
        Self {
            public_key: *record.public_key(),
            addr: record.addr().to_string(),
        }
    }

    /// Validate and convert. `None` for bad keys or unparseable addresses.
    pub fn into_record(self) -> Option<PeerRecord> {
        let addr: SocketAddr = self.addr.parse().ok()?;
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return None;
        }
        PeerRecord::new(self.public_key, addr)
    }
}

/// Error encoding a frame before anything touches the stream.
#[derive(Debug)]
pub enum FrameError {
    TooLarge { size: usize, max: usize },
    Encode(bincode::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge { size, max } => {
                write!(f, "frame too large: {} bytes (max {})", size, max)
            }
            FrameError::Encode(e) => write!(f, "failed to encode frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `value` as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let size = bincode::serialized_size(value).map_err(FrameError::Encode)? as usize;
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    let body = serialize(value).map_err(FrameError::Encode)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await.context("failed to write frame")?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the stream ends cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .context("failed to read frame header")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            bail!("stream ended inside frame header");
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("stream ended inside frame body")?;

    let value = deserialize_bounded(&body).context("failed to decode frame")?;
    Ok(Some(value))
}
