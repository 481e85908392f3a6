//! Per-connection session state and the IV-ratcheted secure channel.
//!
//! A session moves through the phases
//! `Idle → SecureChannelEstablished → SessionKeyed → Transferring → Closed`
//! strictly in order. Once keyed, all traffic goes through a
//! [`SecureChannel`], which owns the session key and the current IV.

use std::sync::Arc;

use log::debug;
use rsa::RsaPublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cryptography::{decrypt_cfb, encrypt_cfb};
use crate::errors::{NegotiationError, SessionError};
use crate::keystore::KeyPair;
use crate::networking::FramedStream;
use crate::wire::{Direction, Message};
use crate::{IV_SIZE, KEY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SecureChannelEstablished,
    SessionKeyed,
    Transferring(Direction),
    Closed(Outcome),
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::SecureChannelEstablished => 1,
            Phase::SessionKeyed => 2,
            Phase::Transferring(_) => 3,
            Phase::Closed(_) => 4,
        }
    }
}

/// Bookkeeping for one connection. Owned by the task handling it.
pub struct SessionState {
    principal: Option<String>,
    local_key: Option<Arc<KeyPair>>,
    peer_public_key: Option<RsaPublicKey>,
    direction: Option<Direction>,
    file_path: Option<String>,
    phase: Phase,
}

impl SessionState {
    /// State for the responding side; principal and key are learned during the handshake.
    pub fn new() -> Self {
        SessionState {
            principal: None,
            local_key: None,
            peer_public_key: None,
            direction: None,
            file_path: None,
            phase: Phase::Idle,
        }
    }

    /// State for the initiating side, which knows who it is up front.
    pub fn for_principal(principal: impl Into<String>, local_key: Arc<KeyPair>) -> Self {
        SessionState {
            principal: Some(principal.into()),
            local_key: Some(local_key),
            ..SessionState::new()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase. Only single forward steps are allowed, except
    /// that any open session may close.
    pub fn enter(&mut self, next: Phase) -> Result<(), SessionError> {
        let allowed = match (self.phase, next) {
            (Phase::Closed(_), _) => false,
            (_, Phase::Closed(_)) => true,
            (current, next) => next.rank() == current.rank() + 1,
        };

        if !allowed {
            return Err(SessionError::desync(format!(
                "invalid session transition {:?} -> {:?}",
                self.phase, next
            )));
        }

        debug!("Session phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Close the session unless it already is.
    pub fn close(&mut self, outcome: Outcome) {
        if !matches!(self.phase, Phase::Closed(_)) {
            self.phase = Phase::Closed(outcome);
        }
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Bind the principal claimed at handshake start. It cannot change afterwards.
    pub fn bind_principal(&mut self, principal: &str) -> Result<(), SessionError> {
        match &self.principal {
            Some(existing) if existing != principal => Err(SessionError::desync(format!(
                "principal already bound to '{existing}'"
            ))),
            Some(_) => Ok(()),
            None => {
                self.principal = Some(principal.to_string());
                Ok(())
            }
        }
    }

    pub fn local_key(&self) -> Result<&Arc<KeyPair>, SessionError> {
        self.local_key
            .as_ref()
            .ok_or_else(|| SessionError::desync("no local key pair resolved"))
    }

    pub fn set_local_key(&mut self, key: Arc<KeyPair>) {
        self.local_key = Some(key);
    }

    pub fn peer_public_key(&self) -> Result<&RsaPublicKey, SessionError> {
        self.peer_public_key
            .as_ref()
            .ok_or_else(|| SessionError::desync("peer public key not yet known"))
    }

    pub fn set_peer_public_key(&mut self, key: RsaPublicKey) {
        self.peer_public_key = Some(key);
    }

    pub fn set_transfer(&mut self, file_path: &str, direction: Direction) {
        self.file_path = Some(file_path.to_string());
        self.direction = Some(direction);
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}

/// Session key and current IV. Both are wiped when the session ends.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    key: [u8; KEY_SIZE],
    current_iv: [u8; IV_SIZE],
}

impl SessionKeys {
    pub fn new(key: [u8; KEY_SIZE], initial_iv: [u8; IV_SIZE]) -> Self {
        SessionKeys {
            key,
            current_iv: initial_iv,
        }
    }

    /// Build keys from the negotiated byte strings, checking their lengths.
    pub fn from_slices(key: &[u8], initial_iv: &[u8]) -> Result<Self, NegotiationError> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| {
            NegotiationError::Malformed(format!("session key is {} bytes, expected {}", key.len(), KEY_SIZE))
        })?;
        let initial_iv: [u8; IV_SIZE] = initial_iv.try_into().map_err(|_| {
            NegotiationError::Malformed(format!("IV is {} bytes, expected {}", initial_iv.len(), IV_SIZE))
        })?;
        Ok(SessionKeys::new(key, initial_iv))
    }

    pub fn current_iv(&self) -> [u8; IV_SIZE] {
        self.current_iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        encrypt_cfb(&self.key, &self.current_iv, plaintext)
            .map_err(|e| SessionError::desync(e.to_string()))
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        decrypt_cfb(&self.key, &self.current_iv, ciphertext)
            .map_err(|e| SessionError::desync(e.to_string()))
    }

    /// Replace the current IV with the one carried in the last response.
    ///
    /// This is the only place the IV ever changes. A malformed IV, or one equal
    /// to the IV just used, would mean encrypting twice under the same IV and is
    /// treated as desynchronization.
    pub fn advance(&mut self, next_iv: &[u8]) -> Result<(), SessionError> {
        let next: [u8; IV_SIZE] = next_iv.try_into().map_err(|_| {
            SessionError::desync(format!("next IV is {} bytes, expected {}", next_iv.len(), IV_SIZE))
        })?;
        if next == self.current_iv {
            return Err(SessionError::desync("peer repeated the current IV"));
        }
        self.current_iv = next;
        Ok(())
    }
}

/// Symmetrically encrypted, stop-and-wait message channel.
///
/// `send` and `recv` both use the current IV; it only moves when the caller
/// reports a finished round trip through [`SecureChannel::complete_round_trip`].
pub struct SecureChannel<S> {
    framed: FramedStream<S>,
    keys: SessionKeys,
    round_trips: u64,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(framed: FramedStream<S>, keys: SessionKeys) -> Self {
        SecureChannel {
            framed,
            keys,
            round_trips: 0,
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let plaintext = message
            .encode()
            .map_err(|e| SessionError::desync(format!("cannot encode {}: {}", message.kind(), e)))?;
        let ciphertext = self.keys.encrypt(&plaintext)?;
        self.framed.write_frame(&ciphertext).await?;
        Ok(())
    }

    /// Receive and decrypt the next message. Bytes that don't decode after
    /// decryption mean the peers no longer share an IV; that is never retried.
    pub async fn recv(&mut self) -> Result<Message, SessionError> {
        let frame = self.framed.read_frame().await?;
        let plaintext = self.keys.decrypt(&frame)?;
        Message::decode(&plaintext).map_err(|e| {
            SessionError::desync(format!(
                "message after round trip {} does not decode: {}",
                self.round_trips, e
            ))
        })
    }

    pub fn complete_round_trip(&mut self, next_iv: &[u8]) -> Result<(), SessionError> {
        self.keys.advance(next_iv)?;
        self.round_trips += 1;
        Ok(())
    }

    pub fn current_iv(&self) -> [u8; IV_SIZE] {
        self.keys.current_iv()
    }

    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    /// Shut down the write side of the transport.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.framed.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        // Keys are wiped when `self.keys` drops here.
        let SecureChannel { framed, .. } = self;
        framed.into_inner()
    }
}
