//! Length-prefixed frame send/receive.
//!
//! Wire format: `[4-byte big-endian length][length bytes of payload]`.
//! A call either transfers a whole frame or fails; partial frames are
//! never exposed to callers. The length is validated before any
//! allocation happens.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::deadline::Deadline;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Maximum accepted frame payload size.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Errors raised by frame I/O.
#[derive(Debug, Error)]
pub enum FrameError {
    /// No complete frame within the deadline.
    #[error("frame I/O timed out after {0:?}")]
    Timeout(Duration),

    /// Announced length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds maximum of {MAX_FRAME_LEN}")]
    TooLarge { len: usize },

    /// The peer closed the stream mid-frame.
    #[error("stream closed mid-frame")]
    Truncated,

    /// Underlying I/O failure.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Send one frame: length prefix, then the payload, then flush.
pub async fn send<W>(writer: &mut W, payload: &[u8], deadline: &Deadline) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }
    let timeout = |e: crate::deadline::DeadlineExpired| FrameError::Timeout(e.budget);

    let prefix = (payload.len() as u32).to_be_bytes();
    deadline
        .bound(writer.write_all(&prefix))
        .await
        .map_err(timeout)??;
    deadline
        .bound(writer.write_all(payload))
        .await
        .map_err(timeout)??;
    deadline.bound(writer.flush()).await.map_err(timeout)??;
    Ok(())
}

/// Receive one frame, returning its payload.
pub async fn receive<R>(reader: &mut R, deadline: &Deadline) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let timeout = |e: crate::deadline::DeadlineExpired| FrameError::Timeout(e.budget);

    let mut prefix = [0u8; LEN_PREFIX];
    deadline
        .bound(read_exact_or_truncated(reader, &mut prefix))
        .await
        .map_err(timeout)??;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        deadline
            .bound(read_exact_or_truncated(reader, &mut payload))
            .await
            .map_err(timeout)??;
    }
    Ok(payload)
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
        Err(e) => Err(FrameError::Io(e)),
    }
}
