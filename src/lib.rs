pub mod errors;
pub mod cryptography;
pub mod networking;
pub mod wire;
pub mod keystore;
pub mod session;
pub mod handshake;
pub mod transfer;
pub mod client;
pub mod server;
pub mod filespec;
pub mod commands;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const CHUNK_SIZE: usize = 0x10000;

/// Upper bound for a single frame on the wire: one full chunk plus message overhead.
pub const MAX_FRAME_SIZE: usize = CHUNK_SIZE + 0x2800;

pub const DEFAULT_PORT: u16 = 9191;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub const RSA_KEY_BITS: usize = 4096;
pub const MIN_RSA_KEY_BITS: usize = 1024;
