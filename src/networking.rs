use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::errors::TransportError;
use crate::MAX_FRAME_SIZE;

const LENGTH_PREFIX: usize = 4;
const READ_RESERVE: usize = 0x2000;

/// A byte stream carrying length-prefixed frames.
///
/// Every frame is a big-endian `u32` body length followed by the body. Reads go
/// through an internal buffer so a read that times out never loses bytes: the
/// partial frame stays buffered and the next attempt picks up where it stopped.
pub struct FramedStream<S> {
    stream: S,
    buffer: Vec<u8>,
    read_timeout: Duration,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        FramedStream {
            stream,
            buffer: Vec::new(),
            read_timeout,
        }
    }

    /// Write one frame as a single buffer and flush it.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        self.stream.write_all(&frame).await?;
        // Flush so the frame leaves immediately; the peer is blocked waiting for it.
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next complete frame.
    ///
    /// Waiting is bounded by the read timeout. The first expiry is logged and the
    /// wait restarts once; a second expiry fails with [`TransportError::TimedOut`].
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut retried = false;
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }

            match timeout(self.read_timeout, self.fill()).await {
                Ok(filled) => filled?,
                Err(_) if !retried => {
                    warn!("No data from peer for {:?}, waiting once more", self.read_timeout);
                    retried = true;
                }
                Err(_) => return Err(TransportError::TimedOut),
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(prefix) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(length));
        }

        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }

        let frame = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + length].to_vec();
        self.buffer.drain(..LENGTH_PREFIX + length);
        Ok(Some(frame))
    }

    // `read_buf` is cancel safe, which is what makes the timeout retry sound.
    async fn fill(&mut self) -> Result<(), TransportError> {
        self.buffer.reserve(READ_RESERVE);
        let read = self.stream.read_buf(&mut self.buffer).await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

/// Open a TCP connection to `addr` (`host:port`).
pub async fn connect(addr: &str) -> Result<TcpStream, TransportError> {
    debug!("Connecting to {}", addr);
    let stream = TcpStream::connect(addr).await?;
    // Every frame is a complete request or response; don't let Nagle hold it back.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Bind a listening socket with `SO_REUSEADDR` so a restarted server can take
/// the port back immediately.
pub fn bind_listener(local_addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local_addr)?;

    Ok(socket.listen(1024)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (a, b) = duplex(1024);
        let mut writer = FramedStream::new(a, TIMEOUT);
        let mut reader = FramedStream::new(b, TIMEOUT);

        writer.write_frame(b"hello").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"world").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), b"hello");
        assert_eq!(reader.read_frame().await.unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_frame_larger_than_pipe_buffer() {
        // The duplex buffer is far smaller than the frame, forcing partial reads.
        let (a, b) = duplex(64);
        let body: Vec<u8> = (0..50_000).map(|i| (i % 256) as u8).collect();
        let expected = body.clone();

        let writer = tokio::spawn(async move {
            let mut writer = FramedStream::new(a, TIMEOUT);
            writer.write_frame(&body).await.unwrap();
        });

        let mut reader = FramedStream::new(b, TIMEOUT);
        assert_eq!(reader.read_frame().await.unwrap(), expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_surfaces_as_closed() {
        let (a, b) = duplex(64);
        drop(a);

        let mut reader = FramedStream::new(b, TIMEOUT);
        assert!(matches!(reader.read_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, b) = duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();

        let mut reader = FramedStream::new(b, TIMEOUT);
        assert!(matches!(reader.read_frame().await, Err(TransportError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_frame() {
        let (a, _b) = duplex(64);
        let mut writer = FramedStream::new(a, TIMEOUT);

        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(writer.write_frame(&body).await, Err(TransportError::FrameTooLarge(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_after_one_retry() {
        let (_a, b) = duplex(64);
        let mut reader = FramedStream::new(b, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        assert!(matches!(reader.read_frame().await, Err(TransportError::TimedOut)));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_frame_survives_timeout() {
        let (mut a, b) = duplex(64);
        let mut reader = FramedStream::new(b, Duration::from_millis(100));

        // Half a frame, then silence for longer than one timeout.
        a.write_all(&5u32.to_be_bytes()).await.unwrap();
        a.write_all(b"he").await.unwrap();

        let finish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            a.write_all(b"llo").await.unwrap();
            a
        });

        assert_eq!(reader.read_frame().await.unwrap(), b"hello");
        finish.await.unwrap();
    }
}
