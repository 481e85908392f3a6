//! Messages exchanged between client and server.
//!
//! Every message is a variant of [`Message`] and is encoded with the same
//! bincode configuration, so the variant tag doubles as a type check: a peer
//! that receives a message meant for another phase or direction sees the wrong
//! variant and fails closed.

use std::fmt;
use std::str::FromStr;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::MAX_FRAME_SIZE;

/// Outcome codes carried by responses (and by client pulls).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    MethodNotAllowed,
    Eof,
    More,
}

/// Transfer direction, as seen from the client.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientReading,
    ClientWriting,
}

/// Authentication methods known to the protocol.
///
/// `Password` is recognized on the wire but never granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey,
    Password,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey => "PUBLIC_KEY",
            AuthMethod::Password => "PASSWORD",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUBLIC_KEY" => Ok(AuthMethod::PublicKey),
            "PASSWORD" => Ok(AuthMethod::Password),
            other => Err(format!("unknown authentication method '{other}'")),
        }
    }
}

/// First message of a session, sent in the clear.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub user_name: String,
    pub requested_method: String,
    /// PKCS#1 DER encoded RSA public key of the client.
    pub public_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub user_name: String,
    pub allowed_method: String,
    pub status: Status,
    pub status_text: String,
    /// PKCS#1 DER encoded RSA public key of the server; empty unless `status` is `Ok`.
    pub public_key: Vec<u8>,
}

/// Sealed with the server's public key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub user_name: String,
    pub file_path: String,
    pub direction: Direction,
}

/// Sealed with the client's public key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub status: Status,
    pub status_text: String,
    pub session_key: Vec<u8>,
    pub initial_iv: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub payload: Vec<u8>,
    pub status: Status,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    pub next_iv: Vec<u8>,
    pub status: Status,
    pub status_text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadPull {
    pub status: Status,
    pub status_text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub next_iv: Vec<u8>,
    pub payload: Vec<u8>,
    pub status: Status,
    pub status_text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    UploadChunk(UploadChunk),
    UploadAck(UploadAck),
    DownloadPull(DownloadPull),
    DownloadChunk(DownloadChunk),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        codec().serialize(self)
    }

    /// Decode a message, rejecting unknown variants and trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
        codec().deserialize(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::AuthRequest(_) => "AuthRequest",
            Message::AuthResponse(_) => "AuthResponse",
            Message::TransferRequest(_) => "TransferRequest",
            Message::TransferResponse(_) => "TransferResponse",
            Message::UploadChunk(_) => "UploadChunk",
            Message::UploadAck(_) => "UploadAck",
            Message::DownloadPull(_) => "DownloadPull",
            Message::DownloadChunk(_) => "DownloadChunk",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_names() {
        assert_eq!("PUBLIC_KEY".parse::<AuthMethod>(), Ok(AuthMethod::PublicKey));
        assert_eq!("PASSWORD".parse::<AuthMethod>(), Ok(AuthMethod::Password));
        assert!("public_key".parse::<AuthMethod>().is_err());
        assert!("KERBEROS".parse::<AuthMethod>().is_err());
        assert_eq!(AuthMethod::PublicKey.to_string(), "PUBLIC_KEY");
    }

    #[test]
    fn test_message_keeps_its_variant() {
        let message = Message::DownloadPull(DownloadPull {
            status: Status::More,
            status_text: "More".into(),
        });

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), "DownloadPull");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let message = Message::UploadChunk(UploadChunk {
            payload: vec![1, 2, 3],
            status: Status::More,
        });
        let mut encoded = message.encode().unwrap();
        encoded.push(0);

        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_variant() {
        let garbage = [0xffu8, 0xff, 0xff, 0x7f, 0, 0, 0, 0];
        assert!(Message::decode(&garbage).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_message() {
        let message = Message::UploadAck(UploadAck {
            next_iv: vec![9; 16],
            status: Status::Ok,
            status_text: "OK".into(),
        });
        let encoded = message.encode().unwrap();

        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&[]).is_err());
    }
}
