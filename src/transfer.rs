//! Chunk transfer over a keyed [`SecureChannel`].
//!
//! Both directions are stop-and-wait. The client sends one request under the
//! current IV, the server answers under the same IV with a fresh `next_iv`
//! inside the response, and both sides then switch to `next_iv`. Uploads
//! exchange `UploadChunk`/`UploadAck`, downloads `DownloadPull`/`DownloadChunk`;
//! anything else mid-transfer is a desync and ends the session.

use std::io;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cryptography::generate_iv;
use crate::errors::SessionError;
use crate::session::SecureChannel;
use crate::wire::{DownloadChunk, DownloadPull, Message, Status, UploadAck, UploadChunk};

/// Totals for a finished transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes: u64,
    pub chunks: u64,
}

impl TransferStats {
    fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.chunks += 1;
    }
}

/// Read up to `max` bytes, stopping early only at end of input.
///
/// # Returns
/// The bytes read; an empty vector means the source is exhausted.
pub async fn read_chunk<R>(source: &mut R, max: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let read = source.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

fn unexpected(message: &Message, expected: &str) -> SessionError {
    SessionError::desync(format!("expected {expected}, got {}", message.kind()))
}

// ============================================================================
// Upload (client writing)
// ============================================================================

/// Client side of an upload: stream `source` to the server, then send the
/// terminal EOF chunk. The EOF chunk is not acknowledged.
pub async fn send_upload<S, R>(
    channel: &mut SecureChannel<S>,
    source: &mut R,
    chunk_size: usize,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut stats = TransferStats::default();
    loop {
        let payload = read_chunk(source, chunk_size).await.map_err(SessionError::LocalIo)?;
        if payload.is_empty() {
            channel
                .send(&Message::UploadChunk(UploadChunk {
                    payload: Vec::new(),
                    status: Status::Eof,
                }))
                .await?;
            debug!("Upload finished: {} bytes in {} chunks", stats.bytes, stats.chunks);
            return Ok(stats);
        }

        let length = payload.len();
        upload_round_trip(channel, payload).await?;
        stats.record(length);
    }
}

/// Send one chunk and wait for its acknowledgement.
pub async fn upload_round_trip<S>(channel: &mut SecureChannel<S>, payload: Vec<u8>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .send(&Message::UploadChunk(UploadChunk {
            payload,
            status: Status::More,
        }))
        .await?;

    let ack = match channel.recv().await? {
        Message::UploadAck(ack) => ack,
        other => return Err(unexpected(&other, "UploadAck")),
    };

    match ack.status {
        Status::Ok => channel.complete_round_trip(&ack.next_iv),
        Status::Error => Err(SessionError::Remote(ack.status_text)),
        other => Err(SessionError::desync(format!("UploadAck with status {other:?}"))),
    }
}

/// Server side of an upload: write every chunk to `destination` until the
/// client's EOF chunk arrives.
pub async fn receive_upload<S, W>(
    channel: &mut SecureChannel<S>,
    destination: &mut W,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = TransferStats::default();
    while let Some(written) = serve_upload_round(channel, destination).await? {
        stats.record(written);
    }

    destination.flush().await.map_err(SessionError::LocalIo)?;
    debug!("Received upload: {} bytes in {} chunks", stats.bytes, stats.chunks);
    Ok(stats)
}

/// Handle one upload request.
///
/// # Returns
/// `Some(bytes written)` after an acknowledged chunk, `None` at the client's EOF.
pub async fn serve_upload_round<S, W>(
    channel: &mut SecureChannel<S>,
    destination: &mut W,
) -> Result<Option<usize>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let chunk = match channel.recv().await? {
        Message::UploadChunk(chunk) => chunk,
        other => return Err(unexpected(&other, "UploadChunk")),
    };

    match chunk.status {
        Status::More => {}
        Status::Eof if chunk.payload.is_empty() => return Ok(None),
        Status::Eof => return Err(SessionError::desync("EOF chunk carried a payload")),
        other => return Err(SessionError::desync(format!("UploadChunk with status {other:?}"))),
    }

    let next_iv = generate_iv();
    // Buffered writers such as tokio's `File` only surface a failed write on
    // flush; the ack must not claim `Ok` before that.
    let written = match destination.write_all(&chunk.payload).await {
        Ok(()) => destination.flush().await,
        Err(e) => Err(e),
    };

    let ack = match &written {
        Ok(()) => UploadAck {
            next_iv: next_iv.to_vec(),
            status: Status::Ok,
            status_text: "OK".into(),
        },
        Err(e) => UploadAck {
            next_iv: next_iv.to_vec(),
            status: Status::Error,
            status_text: e.to_string(),
        },
    };

    // The client always gets an answer, even when the write failed.
    let sent = channel.send(&Message::UploadAck(ack)).await;
    if let Err(e) = written {
        if let Err(send_error) = sent {
            warn!("Could not report write failure to client: {}", send_error);
        }
        return Err(SessionError::LocalIo(e));
    }
    sent?;

    channel.complete_round_trip(&next_iv)?;
    Ok(Some(chunk.payload.len()))
}

// ============================================================================
// Download (client reading)
// ============================================================================

/// Client side of a download: pull chunks into `destination` until EOF.
pub async fn receive_download<S, W>(
    channel: &mut SecureChannel<S>,
    destination: &mut W,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = TransferStats::default();
    while let Some(payload) = pull_round_trip(channel).await? {
        if let Err(e) = destination.write_all(&payload).await {
            abort_download(channel, &e.to_string()).await;
            return Err(SessionError::LocalIo(e));
        }
        stats.record(payload.len());
    }

    destination.flush().await.map_err(SessionError::LocalIo)?;
    debug!("Download finished: {} bytes in {} chunks", stats.bytes, stats.chunks);
    Ok(stats)
}

/// Request the next chunk.
///
/// # Returns
/// `Some(payload)` for a data chunk, `None` once the server reports EOF.
pub async fn pull_round_trip<S>(channel: &mut SecureChannel<S>) -> Result<Option<Vec<u8>>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .send(&Message::DownloadPull(DownloadPull {
            status: Status::More,
            status_text: "More".into(),
        }))
        .await?;

    let chunk = match channel.recv().await? {
        Message::DownloadChunk(chunk) => chunk,
        other => return Err(unexpected(&other, "DownloadChunk")),
    };

    match chunk.status {
        Status::Ok => {
            channel.complete_round_trip(&chunk.next_iv)?;
            Ok(Some(chunk.payload))
        }
        Status::Eof if chunk.payload.is_empty() => Ok(None),
        Status::Eof => Err(SessionError::desync("EOF chunk carried a payload")),
        Status::Error => Err(SessionError::Remote(chunk.status_text)),
        other => Err(SessionError::desync(format!("DownloadChunk with status {other:?}"))),
    }
}

/// Tell the server we are giving up. Best effort: we stop either way.
async fn abort_download<S>(channel: &mut SecureChannel<S>, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pull = Message::DownloadPull(DownloadPull {
        status: Status::Error,
        status_text: text.to_string(),
    });
    if let Err(e) = channel.send(&pull).await {
        warn!("Could not report write failure to server: {}", e);
    }
}

/// Server side of a download: answer pulls with chunks of `source`.
pub async fn serve_download<S, R>(
    channel: &mut SecureChannel<S>,
    source: &mut R,
    chunk_size: usize,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut stats = TransferStats::default();
    while let Some(sent) = serve_download_round(channel, source, chunk_size).await? {
        stats.record(sent);
    }

    debug!("Served download: {} bytes in {} chunks", stats.bytes, stats.chunks);
    Ok(stats)
}

/// Handle one pull.
///
/// # Returns
/// `Some(bytes sent)` for a data chunk, `None` once EOF has been sent.
pub async fn serve_download_round<S, R>(
    channel: &mut SecureChannel<S>,
    source: &mut R,
    chunk_size: usize,
) -> Result<Option<usize>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let pull = match channel.recv().await? {
        Message::DownloadPull(pull) => pull,
        other => return Err(unexpected(&other, "DownloadPull")),
    };

    match pull.status {
        Status::More => {}
        Status::Error => return Err(SessionError::Remote(pull.status_text)),
        other => return Err(SessionError::desync(format!("DownloadPull with status {other:?}"))),
    }

    let next_iv = generate_iv();
    let payload = match read_chunk(source, chunk_size).await {
        Ok(payload) => payload,
        Err(e) => {
            let chunk = DownloadChunk {
                next_iv: next_iv.to_vec(),
                payload: Vec::new(),
                status: Status::Error,
                status_text: e.to_string(),
            };
            if let Err(send_error) = channel.send(&Message::DownloadChunk(chunk)).await {
                warn!("Could not report read failure to client: {}", send_error);
            }
            return Err(SessionError::LocalIo(e));
        }
    };

    if payload.is_empty() {
        let chunk = DownloadChunk {
            next_iv: next_iv.to_vec(),
            payload,
            status: Status::Eof,
            status_text: "EOF".into(),
        };
        channel.send(&Message::DownloadChunk(chunk)).await?;
        return Ok(None);
    }

    let length = payload.len();
    let chunk = DownloadChunk {
        next_iv: next_iv.to_vec(),
        payload,
        status: Status::Ok,
        status_text: "OK".into(),
    };
    channel.send(&Message::DownloadChunk(chunk)).await?;
    channel.complete_round_trip(&next_iv)?;
    Ok(Some(length))
}
