//! # Cross-process wire protocol
//!
//! Everything that crosses a process boundary is a self-contained, serde-encoded frame. A frame
//! travels as a 4-byte big-endian length prefix followed by that many bytes of JSON. The worker's
//! stdin carries [MainFrame]s (commands and notifications), its stdout carries [WorkerFrame]s
//! (lifecycle signals and results); stderr is left alone for logging.
//!
use crate::handler::WorkErrorKind;
use crate::notifications::Notification;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. A length prefix beyond this is treated as stream corruption
/// rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Identifier for a single submission. Drawn from a process-wide counter in the main process and
/// never reused within that process.
#[derive(Copy, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(u64);

static NEXT_SUBMISSION_ID: AtomicU64 = AtomicU64::new(1);

impl SubmissionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBMISSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<u64> for SubmissionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work as it travels to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSpec {
    pub id: SubmissionId,
    /// The registry key the worker resolves to a concrete function.
    pub key: String,
    pub args: serde_json::Value,
    pub streaming: bool,
}

/// Frames sent from the main process to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MainFrame {
    Run(SubmissionSpec),
    Notify(Notification),
    /// Shutdown sentinel: the command loop drains and exits cleanly.
    Shutdown,
}

/// Frames sent from a worker to the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerFrame {
    /// Init functions ran; the worker is accepting submissions.
    Started { worker_id: usize },
    /// The worker received the initial ping on its notification path.
    NotifyAck { worker_id: usize },
    Result(ResultFrame),
}

/// Result frames for a submission. Exactly one terminal frame is produced per submission;
/// `StreamValue` is the only non-terminal frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultFrame {
    Value {
        id: SubmissionId,
        payload: serde_json::Value,
    },
    StreamValue {
        id: SubmissionId,
        payload: serde_json::Value,
    },
    StreamEnd {
        id: SubmissionId,
    },
    Error {
        id: SubmissionId,
        kind: WorkErrorKind,
        message: String,
        traceback: String,
    },
    Cancelled {
        id: SubmissionId,
    },
}

impl ResultFrame {
    pub fn id(&self) -> SubmissionId {
        match self {
            Self::Value { id, .. }
            | Self::StreamValue { id, .. }
            | Self::StreamEnd { id }
            | Self::Error { id, .. }
            | Self::Cancelled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StreamValue { .. })
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    TooLarge(usize),
}

pub fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize,
{
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Blocking read of the next frame. `Ok(None)` means the peer closed the stream at a frame
/// boundary (or mid-prefix, which is indistinguishable and treated the same).
pub fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(FrameError::Io(err)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

pub async fn write_frame_async<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(FrameError::Io(err)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}
