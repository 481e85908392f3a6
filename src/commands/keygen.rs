use std::error::Error;
use std::path::Path;
use std::time::Duration;

use indicatif::ProgressBar;
use log::debug;

use crate::cryptography::{generate_private_key, read_public_key, write_key_pair};
use crate::MIN_RSA_KEY_BITS;

/// Generate an RSA key pair and write it to the given paths.
pub async fn run(private_key_path: &Path, public_key_path: &Path, bits: usize) -> Result<(), Box<dyn Error>> {
    if bits < MIN_RSA_KEY_BITS {
        return Err(format!("key size must be at least {} bits", MIN_RSA_KEY_BITS).into());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Generating {}-bit RSA key", bits));

    // CPU bound.
    let private_key = tokio::task::spawn_blocking(move || generate_private_key(bits)).await??;
    spinner.finish_with_message("Key generated");

    write_key_pair(&private_key, private_key_path, public_key_path)?;

    if read_public_key(public_key_path)? != private_key.to_public_key() {
        return Err(format!("public key at {} does not match", public_key_path.display()).into());
    }
    debug!("Verified {}", public_key_path.display());

    println!("Key generation successful");
    println!("Public key -> {}", public_key_path.display());
    println!("Private key -> {}", private_key_path.display());
    Ok(())
}
