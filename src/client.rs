//! Client session driver.
//!
//! [`upload`] and [`download`] each run one complete session over an already
//! connected stream: handshake, negotiation, chunk transfer, close.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::SessionError;
use crate::handshake::{client_handshake, client_negotiate};
use crate::keystore::KeyPair;
use crate::networking::FramedStream;
use crate::session::{Outcome, Phase, SecureChannel, SessionState};
use crate::transfer::{receive_download, send_upload, TransferStats};
use crate::wire::Direction;
use crate::{CHUNK_SIZE, DEFAULT_READ_TIMEOUT};

/// Everything a client session needs besides the connection and the file.
#[derive(Clone)]
pub struct ClientConfig {
    /// User name presented to the server.
    pub principal: String,
    pub key_pair: Arc<KeyPair>,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

impl ClientConfig {
    pub fn new(principal: impl Into<String>, key_pair: Arc<KeyPair>) -> Self {
        ClientConfig {
            principal: principal.into(),
            key_pair,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Copy `source` to `remote_path` on the server.
pub async fn upload<S, R>(
    stream: S,
    config: &ClientConfig,
    remote_path: &str,
    source: &mut R,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let (mut channel, mut state) = open_session(stream, config, remote_path, Direction::ClientWriting).await?;
    let result = send_upload(&mut channel, source, config.chunk_size).await;
    finish(channel, close_state(&mut state, &result), result).await
}

/// Copy `remote_path` on the server into `destination`.
pub async fn download<S, W>(
    stream: S,
    config: &ClientConfig,
    remote_path: &str,
    destination: &mut W,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut channel, mut state) = open_session(stream, config, remote_path, Direction::ClientReading).await?;
    let result = receive_download(&mut channel, destination).await;
    finish(channel, close_state(&mut state, &result), result).await
}

/// Handshake and negotiate, leaving the session in `Transferring(direction)`.
async fn open_session<S>(
    stream: S,
    config: &ClientConfig,
    remote_path: &str,
    direction: Direction,
) -> Result<(SecureChannel<S>, SessionState), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = FramedStream::new(stream, config.read_timeout);
    let mut state = SessionState::for_principal(config.principal.clone(), config.key_pair.clone());

    let negotiated = async {
        client_handshake(&mut framed, &mut state).await?;
        client_negotiate(&mut framed, &mut state, remote_path, direction).await
    }
    .await;

    let keys = match negotiated {
        Ok(keys) => keys,
        Err(e) => {
            state.close(Outcome::Failed);
            if let Err(shutdown_error) = framed.shutdown().await {
                debug!("Shutdown after failed negotiation: {}", shutdown_error);
            }
            return Err(e);
        }
    };

    state.enter(Phase::Transferring(direction))?;
    info!("Transferring {} ({:?})", remote_path, direction);
    Ok((SecureChannel::new(framed, keys), state))
}

fn close_state(state: &mut SessionState, result: &Result<TransferStats, SessionError>) -> Outcome {
    let outcome = if result.is_ok() { Outcome::Ok } else { Outcome::Failed };
    state.close(outcome);
    outcome
}

async fn finish<S>(
    mut channel: SecureChannel<S>,
    outcome: Outcome,
    result: Result<TransferStats, SessionError>,
) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = channel.close().await {
        debug!("Closing connection: {}", e);
    }
    match &result {
        Ok(stats) => info!("Transfer complete: {} bytes in {} chunks", stats.bytes, stats.chunks),
        Err(e) => warn!("Transfer failed ({:?}): {}", outcome, e),
    }
    result
}
