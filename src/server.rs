//! Server side: the accept loop and the per-connection session driver.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::errors::{NegotiationError, SessionError, TransportError};
use crate::handshake::{
    server_grant_transfer, server_handshake, server_receive_transfer_request, server_refuse_transfer,
};
use crate::keystore::KeyStore;
use crate::networking::{bind_listener, FramedStream};
use crate::session::{Outcome, Phase, SecureChannel, SessionKeys, SessionState};
use crate::transfer::{receive_upload, serve_download, TransferStats};
use crate::wire::{Direction, TransferRequest};
use crate::{CHUNK_SIZE, DEFAULT_READ_TIMEOUT};

/// Immutable server settings, shared by every connection task.
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub key_store: Arc<dyn KeyStore>,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, key_store: Arc<dyn KeyStore>) -> Self {
        ServerConfig {
            bind_addr,
            key_store,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// The local end of a granted transfer, chosen once after negotiation.
enum ServerTransfer {
    /// Client writing: received chunks go into this file.
    Upload(File),
    /// Client reading: chunks are read from this file.
    Download(File),
}

impl ServerTransfer {
    async fn open(request: &TransferRequest) -> io::Result<Self> {
        match request.direction {
            Direction::ClientWriting => Ok(ServerTransfer::Upload(File::create(&request.file_path).await?)),
            Direction::ClientReading => Ok(ServerTransfer::Download(File::open(&request.file_path).await?)),
        }
    }

    fn direction(&self) -> Direction {
        match self {
            ServerTransfer::Upload(_) => Direction::ClientWriting,
            ServerTransfer::Download(_) => Direction::ClientReading,
        }
    }
}

/// Bind `config.bind_addr` and serve until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<(), TransportError> {
    let listener = bind_listener(config.bind_addr)?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, Arc::new(config), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Accept connections on `listener` until `shutdown` resolves.
///
/// Each connection runs in its own task. Sessions already running are left
/// to finish on their own.
pub async fn serve<F>(listener: TcpListener, config: Arc<ServerConfig>, shutdown: F) -> Result<(), TransportError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down after {} connections", next_id);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                };

                next_id += 1;
                let conn_id = next_id;
                info!("[conn {}] Accepted connection from {}", conn_id, peer);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[conn {}] Could not set TCP_NODELAY: {}", conn_id, e);
                }

                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &config, conn_id).await {
                        warn!("[conn {}] Session with {} failed: {}", conn_id, peer, e);
                    }
                });
            }
        }
    }
}

/// Run one complete server session over `stream`.
pub async fn serve_connection<S>(stream: S, config: &ServerConfig, conn_id: u64) -> Result<TransferStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = FramedStream::new(stream, config.read_timeout);
    let mut state = SessionState::new();

    let (keys, transfer) = match negotiate(&mut framed, &mut state, config, conn_id).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            state.close(Outcome::Failed);
            if let Err(shutdown_error) = framed.shutdown().await {
                debug!("[conn {}] Shutdown after failed negotiation: {}", conn_id, shutdown_error);
            }
            return Err(e);
        }
    };

    state.enter(Phase::Transferring(transfer.direction()))?;
    let mut channel = SecureChannel::new(framed, keys);

    let result = match transfer {
        ServerTransfer::Upload(mut file) => receive_upload(&mut channel, &mut file).await,
        ServerTransfer::Download(mut file) => serve_download(&mut channel, &mut file, config.chunk_size).await,
    };

    state.close(if result.is_ok() { Outcome::Ok } else { Outcome::Failed });
    if let Err(e) = channel.close().await {
        debug!("[conn {}] Closing connection: {}", conn_id, e);
    }

    if let Ok(stats) = &result {
        info!(
            "[conn {}] {} for '{}' complete: {} bytes in {} chunks",
            conn_id,
            if state.direction() == Some(Direction::ClientWriting) { "Upload" } else { "Download" },
            state.principal().unwrap_or_default(),
            stats.bytes,
            stats.chunks
        );
    }
    result
}

async fn negotiate<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
    config: &ServerConfig,
    conn_id: u64,
) -> Result<(SessionKeys, ServerTransfer), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    server_handshake(framed, state, config.key_store.as_ref()).await?;
    let request = server_receive_transfer_request(framed, state, config.key_store.as_ref()).await?;
    debug!(
        "[conn {}] {} requested {:?} on {}",
        conn_id, request.user_name, request.direction, request.file_path
    );

    let transfer = match ServerTransfer::open(&request).await {
        Ok(transfer) => transfer,
        Err(e) => {
            let text = format!("cannot open '{}': {}", request.file_path, e);
            server_refuse_transfer(framed, state, &text).await?;
            return Err(NegotiationError::Refused(text).into());
        }
    };

    let keys = server_grant_transfer(framed, state).await?;
    Ok((keys, transfer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, ClientConfig};
    use crate::cryptography::tests::test_keys;
    use crate::keystore::{FileKeyStore, KeyPair};
    use std::path::PathBuf;
    use tokio::io::duplex;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("test_ucp_server_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn configs() -> (ClientConfig, ServerConfig) {
        let (client_key, server_key) = test_keys();
        let store = FileKeyStore::new(Some(Arc::new(KeyPair::new(server_key.clone()))), None);
        let client = ClientConfig::new("alice", Arc::new(KeyPair::new(client_key.clone())));
        let mut server = ServerConfig::new("127.0.0.1:0".parse().unwrap(), Arc::new(store));
        server.chunk_size = 1000;
        (client, server)
    }

    #[tokio::test]
    async fn test_download_served_from_file() {
        let dir = scratch_dir("download");
        let path = dir.join("source.bin");
        let data: Vec<u8> = (0..4500u32).map(|i| (i * 7) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (client_config, server_config) = configs();
        let (client_io, server_io) = duplex(1 << 17);
        let server = tokio::spawn(async move { serve_connection(server_io, &server_config, 1).await });

        let mut sink = Vec::new();
        let stats = client::download(client_io, &client_config, path.to_str().unwrap(), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(stats.chunks, 5);
        assert_eq!(server.await.unwrap().unwrap().bytes, 4500);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_upload_written_to_file() {
        let dir = scratch_dir("upload");
        let path = dir.join("dest.bin");
        let data = vec![0x5au8; 2500];

        let (client_config, server_config) = configs();
        let (client_io, server_io) = duplex(1 << 17);
        let server = tokio::spawn(async move { serve_connection(server_io, &server_config, 2).await });

        let mut source = std::io::Cursor::new(data.clone());
        client::upload(client_io, &client_config, path.to_str().unwrap(), &mut source)
            .await
            .unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_file_refused_with_reason() {
        let dir = scratch_dir("missing");
        let path = dir.join("nope.bin");

        let (client_config, server_config) = configs();
        let (client_io, server_io) = duplex(1 << 17);
        let server = tokio::spawn(async move { serve_connection(server_io, &server_config, 3).await });

        let mut sink = Vec::new();
        let err = client::download(client_io, &client_config, path.to_str().unwrap(), &mut sink)
            .await
            .unwrap_err();

        match err {
            SessionError::Negotiation(NegotiationError::Refused(text)) => assert!(text.contains("denied")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(server.await.unwrap().is_err());
        assert!(sink.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
