//! Error types for a ucp session.
//!
//! Every failure a session can hit ends up as a [`SessionError`]. The
//! sub-enums follow the phase the session was in when it failed, so a
//! caller can tell a refused handshake from a broken transfer without
//! matching on message text.

use std::io;

use thiserror::Error;

/// Failures of the low-level cipher primitives and key encodings.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("asymmetric encryption failed: {0}")]
    Encrypt(String),

    #[error("asymmetric decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid cipher parameters: {0}")]
    InvalidLength(String),
}

/// Key lookup and key file failures.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no key pair found for principal '{0}'")]
    KeyNotFound(String),

    #[error("invalid principal name '{0}'")]
    InvalidPrincipal(String),

    #[error("key file error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures of the underlying byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("timed out waiting for peer")]
    TimedOut,

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures before a session has exchanged public keys.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),

    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("malformed handshake message: {0}")]
    Malformed(String),

    #[error("invalid peer public key: {0}")]
    InvalidPublicKey(String),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

/// Failures while agreeing on a transfer and its session key.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("transfer refused: {0}")]
    Refused(String),

    #[error("malformed transfer message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A `[user@host[:port]:]path` argument that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileSpecError {
    #[error("empty file spec")]
    Empty,

    #[error("'{0}' is not of the form user@host")]
    MissingUser(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("too many ':' separated parts in '{0}'")]
    TooManyParts(String),

    #[error("no local user name; set $USER")]
    UnknownLocalUser,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Decrypted bytes did not decode, or a message arrived that is not valid
    /// for the current state. Never retried.
    #[error("protocol desynchronized: {0}")]
    ProtocolDesync(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[source] io::Error),

    /// The peer ended the transfer with an `Error` status.
    #[error("{0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn desync(reason: impl Into<String>) -> Self {
        SessionError::ProtocolDesync(reason.into())
    }
}
