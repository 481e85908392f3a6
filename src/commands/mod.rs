//! # Commands Module
//!
//! Handlers behind the `ucp` binary. These are the only places that print to
//! stdout or draw progress bars; everything below them logs.
//!
//! ## `client`
//! Copies `--from` to `--to`:
//! - local to remote uploads over a ucp session
//! - remote to local downloads over a ucp session
//! - local to local is a plain file copy
//!
//! ## `server`
//! Listens for ucp sessions and serves files to authenticated principals.
//!
//! ## `keygen`
//! Writes a fresh RSA key pair and exits.

pub mod client;
pub mod server;
pub mod keygen;
