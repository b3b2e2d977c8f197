//! Bulk file transfer.
//!
//! GET announces the size in one frame and then streams raw bytes
//! with no per-chunk framing; the peer knows exactly how many bytes
//! follow. PUT is the reverse and fail-closed: incoming framed chunks
//! accumulate in memory and the destination is written in a single
//! operation only once every announced byte has arrived, so a stalled
//! or aborted upload never leaves a partial file behind.

use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use seqlab_protocol::{frame, Deadline};

use crate::error::{BrokerError, BrokerResult};

const GET_CHUNK: usize = 64 * 1024;

/// Stream the scoped file to the peer.
///
/// The stall deadline resets after every successful write, so a slow
/// but progressing peer is fine while a wedged one fails within the
/// budget.
pub async fn get_file<W>(
    writer: &mut W,
    name: &str,
    frame_timeout: Duration,
    stall: Duration,
) -> BrokerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let meta = tokio::fs::metadata(name)
        .await
        .map_err(|e| BrokerError::Fs(format!("stat '{name}': {e}")))?;
    if !meta.is_file() {
        return Err(BrokerError::Fs(format!("'{name}' is not a regular file")));
    }
    let size = meta.len();

    let deadline = Deadline::after(frame_timeout);
    frame::send(writer, size.to_string().as_bytes(), &deadline).await?;

    let mut file = tokio::fs::File::open(name)
        .await
        .map_err(|e| BrokerError::Fs(format!("opening '{name}': {e}")))?;

    let mut stall_deadline = Deadline::after(stall);
    let mut buf = vec![0u8; GET_CHUNK];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| BrokerError::Fs(format!("reading '{name}': {e}")))?;
        if n == 0 {
            break;
        }
        stall_deadline
            .bound(writer.write_all(&buf[..n]))
            .await
            .map_err(|e| BrokerError::Timeout(format!("streaming '{name}': {e}")))?
            .map_err(|e| BrokerError::Protocol(format!("peer write failed: {e}")))?;
        stall_deadline.reset(stall);
        sent += n as u64;
    }
    stall_deadline
        .bound(writer.flush())
        .await
        .map_err(|e| BrokerError::Timeout(format!("flushing '{name}': {e}")))?
        .map_err(|e| BrokerError::Protocol(format!("peer flush failed: {e}")))?;

    debug!("sent '{name}' ({sent} of {size} bytes)");
    Ok(())
}

/// Receive a file from the peer into the scoped destination.
pub async fn put_file<R, W>(
    reader: &mut R,
    writer: &mut W,
    name: &str,
    frame_timeout: Duration,
    stall: Duration,
    max_bytes: u64,
) -> BrokerResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = Deadline::after(frame_timeout);
    let size_frame = frame::receive(reader, &deadline).await?;
    let announced: u64 = std::str::from_utf8(&size_frame)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| BrokerError::Protocol("unparseable upload size".to_string()))?;
    if announced > max_bytes {
        return Err(BrokerError::Protocol(format!(
            "announced size {announced} exceeds limit {max_bytes}"
        )));
    }

    frame::send(writer, b"OK", &deadline).await?;

    let mut body = Vec::with_capacity(announced as usize);
    let mut stall_deadline = Deadline::after(stall);
    while (body.len() as u64) < announced {
        let chunk = frame::receive(reader, &stall_deadline).await?;
        if body.len() as u64 + chunk.len() as u64 > announced {
            return Err(BrokerError::Protocol(format!(
                "upload overran announced size {announced}"
            )));
        }
        if !chunk.is_empty() {
            body.extend_from_slice(&chunk);
            stall_deadline.reset(stall);
        }
    }

    tokio::fs::write(name, &body)
        .await
        .map_err(|e| BrokerError::Fs(format!("writing '{name}': {e}")))?;
    debug!("received '{name}' ({} bytes)", body.len());
    Ok(())
}
