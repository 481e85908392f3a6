use std::error::Error;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::keystore::{FileKeyStore, KeyPair};
use crate::server::{self, ServerConfig};

/// Run the ucp server.
///
/// # Arguments
/// * `host`, `port` - interface and port to listen on
/// * `private_key_path` - the server's own key, presented to every principal
///   that has no key of its own
/// * `key_dir` - optional directory of per-principal keys (`<key_dir>/<user>/ucp.pem`)
/// * `read_timeout` - how long to wait for a client frame before retrying once
///
/// # Returns
/// `Ok(())` after Ctrl-C, or an error if no key is available or binding fails.
pub async fn run(
    host: &str,
    port: u16,
    private_key_path: &Path,
    key_dir: Option<PathBuf>,
    read_timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let default_key = match KeyPair::load(private_key_path) {
        Ok(pair) => Some(Arc::new(pair)),
        Err(e) if key_dir.is_some() => {
            warn!(
                "No default key at {} ({}); only principals with their own key can connect",
                private_key_path.display(),
                e
            );
            None
        }
        Err(e) => return Err(format!("cannot load private key {}: {}", private_key_path.display(), e).into()),
    };

    let bind_addr = resolve(host, port)?;
    debug!("Resolved {}:{} to {}", host, port, bind_addr);

    let key_store = FileKeyStore::new(default_key, key_dir);
    let mut config = ServerConfig::new(bind_addr, Arc::new(key_store));
    config.read_timeout = read_timeout;

    println!("Server listening on {}", bind_addr);
    server::run(config).await?;
    info!("Server stopped");
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Box<dyn Error>> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("cannot resolve {}", host).into())
}
