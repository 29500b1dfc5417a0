//! Coordinator/worker wire protocol
//!
//! This module defines the frames exchanged between the coordinator and
//! worker nodes. Every frame is a UTF-8 text body; structured frames are
//! JSON, while the handshake reply and the keep-alive are bare literals.
//!
//! # Protocol Version
//!
//! Current version: 1
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                     Worker Node
//!     |                              |
//!     |<------- HANDSHAKE -----------|
//!     |-- "Success" / "Error: .." -->|
//!     |                              |
//!     |-------- "1" (keep-alive) --->|
//!     |                              |
//!     |-- COMPUTE(id, task) -------->|
//!     |<------- RESULT(id) ----------|
//!     |                              |
//!     |-- ABORT(id) ---------------->|   (best effort)
//! ```
//!
//! # Message Framing
//!
//! Each frame is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: frame length][N bytes: UTF-8 text]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Workers reporting any other version are turned away at the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Exact length of a worker token
pub const TOKEN_LENGTH: usize = 2048;

/// Keep-alive frame, a no-op for both sides
pub const KEEPALIVE: &str = "1";

/// Handshake acknowledgment
pub const HANDSHAKE_SUCCESS: &str = "Success";

/// Prefix of a handshake rejection
pub const HANDSHAKE_ERROR_PREFIX: &str = "Error: ";

/// Largest frame accepted from the wire (100MB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Handshake record, the first frame a worker sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Long-lived bearer token identifying the worker
    pub token: String,

    /// Protocol version the worker speaks
    pub version: u32,

    /// Logical CPUs available on the worker
    pub cpu_count: usize,

    /// Free-form platform string (e.g. "linux-x86_64")
    #[serde(default)]
    pub platform: String,

    /// Operating system name
    #[serde(default)]
    pub os: String,

    /// Arbitrary CPU description
    #[serde(default)]
    pub cpu: Value,
}

/// Frames sent from the coordinator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinatorMessage {
    /// Run a task and report back with a [`ResultMessage`] carrying `id`
    Compute {
        id: String,
        task: String,
        params: Value,
    },

    /// Stop working on a task; the coordinator no longer wants its result
    Abort { id: String },
}

impl CoordinatorMessage {
    /// Render the frame text
    pub fn to_text(&self) -> String {
        match self {
            Self::Compute { id, task, params } => {
                json!({ "type": "compute", "id": id, "task": task, "params": params }).to_string()
            }
            Self::Abort { id } => json!({ "type": "abort", "id": id }).to_string(),
        }
    }
}

/// Result of a dispatched task, sent from a worker to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: String,
    pub result: Value,
}

/// A frame received by the coordinator after the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFrame {
    KeepAlive,
    Result(ResultMessage),
}

/// A frame received by a worker after the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorFrame {
    KeepAlive,
    Message(CoordinatorMessage),
}

/// Parse a frame sent by a worker
///
/// Fails when the frame is neither the keep-alive literal nor a JSON
/// record carrying both `id` and `result`.
pub fn parse_worker_frame(text: &str) -> Result<WorkerFrame> {
    if text.trim() == KEEPALIVE {
        return Ok(WorkerFrame::KeepAlive);
    }

    let msg: ResultMessage = serde_json::from_str(text)
        .context("Failed to parse result message")?;

    Ok(WorkerFrame::Result(msg))
}

/// Parse a frame sent by the coordinator
pub fn parse_coordinator_frame(text: &str) -> Result<CoordinatorFrame> {
    if text.trim() == KEEPALIVE {
        return Ok(CoordinatorFrame::KeepAlive);
    }

    let msg: CoordinatorMessage = serde_json::from_str(text)
        .context("Failed to parse coordinator message")?;

    Ok(CoordinatorFrame::Message(msg))
}

/// Interpret the coordinator's reply to a handshake
///
/// Returns the rejection reason when the coordinator refused the worker.
pub fn parse_handshake_reply(text: &str) -> std::result::Result<(), String> {
    let text = text.trim();
    if text == HANDSHAKE_SUCCESS {
        return Ok(());
    }

    Err(text
        .strip_prefix(HANDSHAKE_ERROR_PREFIX)
        .unwrap_or(text)
        .to_string())
}

/// Serialize a structured frame body as JSON text
pub fn to_frame_text<T: Serialize>(msg: &T) -> Result<String> {
    serde_json::to_string(msg).context("Failed to serialize message")
}

/// Encode a frame body with its length prefix
///
/// # Frame Format
///
/// ```text
/// [4 bytes: frame length (little-endian u32)][N bytes: UTF-8 text]
/// ```
pub fn encode_frame(text: &str) -> Result<Vec<u8>> {
    let body = text.as_bytes();
    if body.len() > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max 100MB)", body.len());
    }

    let len = body.len() as u32;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(body);

    Ok(framed)
}

/// Read the body of the next frame from a stream
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary. Handles partial reads.
pub async fn read_frame_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check: the length prefix cannot be trusted
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max 100MB)", len);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await
        .context("Failed to read frame body")?;

    Ok(Some(body))
}

/// Read a complete text frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    match read_frame_bytes(reader).await? {
        Some(body) => Ok(Some(String::from_utf8(body).context("Frame is not valid UTF-8")?)),
        None => Ok(None),
    }
}

/// Write a frame to a stream and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    let framed = encode_frame(text)?;

    writer.write_all(&framed).await
        .context("Failed to write frame")?;

    writer.flush().await
        .context("Failed to flush stream")?;

    Ok(())
}
