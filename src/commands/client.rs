use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use tokio::fs::File;

use crate::client::{self, ClientConfig};
use crate::filespec::FileSpec;
use crate::keystore::KeyPair;
use crate::networking::connect;

/// Function handler for client mode:
///     - Parse both file specs
///     - Local to local is a plain copy, remote to remote is refused
///     - Otherwise load our private key, connect to the remote side and run
///       one upload or download session
pub async fn run(
    from: &str,
    to: &str,
    private_key_path: &Path,
    read_timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let from = FileSpec::parse(from)?;
    let to = FileSpec::parse(to)?;
    debug!("Copying {} to {}", from, to);

    match (from.local, to.local) {
        (true, true) => {
            let copied = tokio::fs::copy(&from.path, &to.path).await?;
            println!("Copied {} bytes", copied);
            Ok(())
        }
        (false, false) => Err("copying between two remote hosts is not supported".into()),
        (true, false) => {
            let config = client_config(&to, private_key_path, read_timeout)?;
            upload(&from, &to, &config).await
        }
        (false, true) => {
            let config = client_config(&from, private_key_path, read_timeout)?;
            download(&from, &to, &config).await
        }
    }
}

fn client_config(remote: &FileSpec, private_key_path: &Path, read_timeout: Duration) -> Result<ClientConfig, Box<dyn Error>> {
    let key_pair = KeyPair::load(private_key_path)
        .map_err(|e| format!("cannot load private key {}: {}", private_key_path.display(), e))?;

    let mut config = ClientConfig::new(remote.user.clone(), Arc::new(key_pair));
    config.read_timeout = read_timeout;
    Ok(config)
}

async fn upload(from: &FileSpec, to: &FileSpec, config: &ClientConfig) -> Result<(), Box<dyn Error>> {
    let file = File::open(&from.path).await?;
    let total_size = file.metadata().await?.len();
    debug!("File size: {} bytes", total_size);

    let addr = to.connect_string().ok_or("upload target is not remote")?;
    info!("Connecting to {}", addr);
    let stream = connect(&addr).await?;

    let bar = ProgressBar::new(total_size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")?,
    );
    let mut source = bar.wrap_async_read(file);

    let result = client::upload(stream, config, &to.path, &mut source).await;
    match result {
        Ok(stats) => {
            bar.finish_with_message("done");
            println!("Transfer Complete! {} bytes sent to {}", stats.bytes, to);
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            Err(e.into())
        }
    }
}

async fn download(from: &FileSpec, to: &FileSpec, config: &ClientConfig) -> Result<(), Box<dyn Error>> {
    let addr = from.connect_string().ok_or("download source is not remote")?;
    info!("Connecting to {}", addr);
    let stream = connect(&addr).await?;

    let file = File::create(&to.path).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {bytes} received ({binary_bytes_per_sec}) {msg}")?);
    let mut destination = spinner.wrap_async_write(file);

    match client::download(stream, config, &from.path, &mut destination).await {
        Ok(stats) => {
            spinner.finish_with_message("done");
            println!("File saved: {} ({} bytes)", to.path, stats.bytes);
            Ok(())
        }
        Err(e) => {
            spinner.abandon_with_message("failed");
            // Don't leave a truncated copy behind.
            if let Err(remove_error) = tokio::fs::remove_file(&to.path).await {
                debug!("Could not remove partial file {}: {}", to.path, remove_error);
            }
            Err(e.into())
        }
    }
}
