//! Public key exchange and transfer negotiation.
//!
//! The handshake runs over the raw framed transport. `AuthRequest` and
//! `AuthResponse` travel in the clear; the `TransferRequest`/`TransferResponse`
//! pair that follows is sealed with the peer's RSA public key and ends with
//! both sides holding the same session key and initial IV.

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cryptography::{
    decode_public_key, encode_public_key, generate_iv, generate_session_key, open_asymmetric,
    seal_asymmetric,
};
use crate::errors::{HandshakeError, NegotiationError, SessionError};
use crate::keystore::KeyStore;
use crate::networking::FramedStream;
use crate::session::{Phase, SessionKeys, SessionState};
use crate::wire::{
    AuthMethod, AuthRequest, AuthResponse, Direction, Message, Status, TransferRequest,
    TransferResponse,
};

// ============================================================================
// Client side
// ============================================================================

/// Send our public key, learn the server's.
pub async fn client_handshake<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_name = state
        .principal()
        .ok_or_else(|| SessionError::desync("client session has no principal"))?
        .to_string();
    let public_key = encode_public_key(state.local_key()?.public_key())
        .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;

    let request = Message::AuthRequest(AuthRequest {
        user_name,
        requested_method: AuthMethod::PublicKey.to_string(),
        public_key,
    });
    let encoded = request
        .encode()
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    framed.write_frame(&encoded).await?;
    debug!("Sent authentication request");

    let frame = framed.read_frame().await?;
    let response = match Message::decode(&frame) {
        Ok(Message::AuthResponse(response)) => response,
        Ok(other) => {
            return Err(HandshakeError::Malformed(format!("expected AuthResponse, got {}", other.kind())).into())
        }
        Err(e) => return Err(HandshakeError::Malformed(e.to_string()).into()),
    };

    if response.status != Status::Ok {
        return Err(HandshakeError::Rejected(response.status_text).into());
    }

    // Password is declared by the protocol but never implemented.
    match response.allowed_method.parse::<AuthMethod>() {
        Ok(AuthMethod::PublicKey) => {}
        _ => return Err(HandshakeError::UnsupportedMethod(response.allowed_method).into()),
    }

    let server_key = decode_public_key(&response.public_key)
        .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;
    state.set_peer_public_key(server_key);
    state.enter(Phase::SecureChannelEstablished)?;

    info!("Exchanged public keys with server");
    Ok(())
}

/// Ask for a transfer and receive the session key.
pub async fn client_negotiate<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
    file_path: &str,
    direction: Direction,
) -> Result<SessionKeys, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Message::TransferRequest(TransferRequest {
        user_name: state.principal().unwrap_or_default().to_string(),
        file_path: file_path.to_string(),
        direction,
    });
    let encoded = request
        .encode()
        .map_err(|e| NegotiationError::Malformed(e.to_string()))?;
    let sealed = seal_asymmetric(state.peer_public_key()?, &encoded).map_err(NegotiationError::from)?;
    framed.write_frame(&sealed).await?;
    debug!("Sent transfer request for {} ({:?})", file_path, direction);

    let frame = framed.read_frame().await?;
    let opened = open_asymmetric(state.local_key()?.private_key(), &frame).map_err(NegotiationError::from)?;
    let response = match Message::decode(&opened) {
        Ok(Message::TransferResponse(response)) => response,
        Ok(other) => {
            return Err(NegotiationError::Malformed(format!("expected TransferResponse, got {}", other.kind())).into())
        }
        Err(e) => return Err(NegotiationError::Malformed(e.to_string()).into()),
    };

    if response.status != Status::Ok {
        return Err(NegotiationError::Refused(response.status_text).into());
    }

    let keys = SessionKeys::from_slices(&response.session_key, &response.initial_iv)?;
    state.set_transfer(file_path, direction);
    state.enter(Phase::SessionKeyed)?;

    info!("Session key established");
    Ok(keys)
}

// ============================================================================
// Server side
// ============================================================================

/// Receive the client's public key and answer with ours.
///
/// Anything but the public key method is answered with `MethodNotAllowed`.
pub async fn server_handshake<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
    key_store: &dyn KeyStore,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed.read_frame().await?;
    let request = match Message::decode(&frame) {
        Ok(Message::AuthRequest(request)) => request,
        Ok(other) => {
            return Err(HandshakeError::Malformed(format!("expected AuthRequest, got {}", other.kind())).into())
        }
        Err(e) => return Err(HandshakeError::Malformed(e.to_string()).into()),
    };

    state.bind_principal(&request.user_name)?;
    info!("Authentication request from '{}'", request.user_name);

    match request.requested_method.parse::<AuthMethod>() {
        Ok(AuthMethod::PublicKey) => {}
        _ => {
            let text = format!("authentication method '{}' is not allowed", request.requested_method);
            refuse_auth(framed, &request, Status::MethodNotAllowed, &text).await;
            return Err(HandshakeError::UnsupportedMethod(request.requested_method).into());
        }
    }

    let client_key = match decode_public_key(&request.public_key) {
        Ok(key) => key,
        Err(e) => {
            refuse_auth(framed, &request, Status::Error, "invalid public key").await;
            return Err(HandshakeError::InvalidPublicKey(e.to_string()).into());
        }
    };

    let key_pair = match key_store.local_key_pair(&request.user_name) {
        Ok(pair) => pair,
        Err(e) => {
            refuse_auth(framed, &request, Status::Error, &e.to_string()).await;
            return Err(HandshakeError::KeyStore(e).into());
        }
    };

    let public_key = encode_public_key(key_pair.public_key())
        .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;
    let response = Message::AuthResponse(AuthResponse {
        user_name: request.user_name.clone(),
        allowed_method: AuthMethod::PublicKey.to_string(),
        status: Status::Ok,
        status_text: "OK".into(),
        public_key,
    });
    let encoded = response
        .encode()
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    framed.write_frame(&encoded).await?;

    state.set_local_key(key_pair);
    state.set_peer_public_key(client_key);
    state.enter(Phase::SecureChannelEstablished)?;

    debug!("Sent our public key to '{}'", request.user_name);
    Ok(())
}

/// Best-effort refusal; the session is over either way.
async fn refuse_auth<S>(framed: &mut FramedStream<S>, request: &AuthRequest, status: Status, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Refusing '{}': {}", request.user_name, text);
    let response = Message::AuthResponse(AuthResponse {
        user_name: request.user_name.clone(),
        allowed_method: AuthMethod::PublicKey.to_string(),
        status,
        status_text: text.to_string(),
        public_key: Vec::new(),
    });

    let sent = match response.encode() {
        Ok(encoded) => framed.write_frame(&encoded).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = sent {
        warn!("Could not deliver refusal to '{}': {}", request.user_name, e);
    }
}

/// Receive and validate the sealed transfer request.
///
/// The request must come from the principal that authenticated and the key
/// store must authorize the path; otherwise the client is told why and the
/// negotiation fails.
pub async fn server_receive_transfer_request<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
    key_store: &dyn KeyStore,
) -> Result<TransferRequest, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed.read_frame().await?;
    let opened = open_asymmetric(state.local_key()?.private_key(), &frame).map_err(NegotiationError::from)?;
    let request = match Message::decode(&opened) {
        Ok(Message::TransferRequest(request)) => request,
        Ok(other) => {
            return Err(NegotiationError::Malformed(format!("expected TransferRequest, got {}", other.kind())).into())
        }
        Err(e) => return Err(NegotiationError::Malformed(e.to_string()).into()),
    };

    let principal = state.principal().unwrap_or_default().to_string();
    if request.user_name != principal {
        let text = format!("transfer requested for '{}' but authenticated as '{}'", request.user_name, principal);
        server_refuse_transfer(framed, state, &text).await?;
        return Err(NegotiationError::Refused(text).into());
    }

    if !key_store.authorize_path(&principal, &request.file_path, request.direction) {
        let text = format!("access to '{}' denied", request.file_path);
        server_refuse_transfer(framed, state, &text).await?;
        return Err(NegotiationError::Refused(text).into());
    }

    info!("'{}' requests {:?} of {}", principal, request.direction, request.file_path);
    state.set_transfer(&request.file_path, request.direction);
    Ok(request)
}

/// Tell the client the transfer cannot go ahead.
pub async fn server_refuse_transfer<S>(
    framed: &mut FramedStream<S>,
    state: &SessionState,
    text: &str,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Refusing transfer: {}", text);
    send_transfer_response(
        framed,
        state,
        TransferResponse {
            status: Status::Error,
            status_text: text.to_string(),
            session_key: Vec::new(),
            initial_iv: Vec::new(),
        },
    )
    .await
}

/// Generate the session key and initial IV and hand them to the client.
pub async fn server_grant_transfer<S>(
    framed: &mut FramedStream<S>,
    state: &mut SessionState,
) -> Result<SessionKeys, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_session_key();
    let iv = generate_iv();

    send_transfer_response(
        framed,
        state,
        TransferResponse {
            status: Status::Ok,
            status_text: "OK".into(),
            session_key: key.to_vec(),
            initial_iv: iv.to_vec(),
        },
    )
    .await?;

    state.enter(Phase::SessionKeyed)?;
    debug!("Sent session key to client");
    Ok(SessionKeys::new(key, iv))
}

async fn send_transfer_response<S>(
    framed: &mut FramedStream<S>,
    state: &SessionState,
    response: TransferResponse,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = Message::TransferResponse(response)
        .encode()
        .map_err(|e| NegotiationError::Malformed(e.to_string()))?;
    let sealed = seal_asymmetric(state.peer_public_key()?, &encoded).map_err(NegotiationError::from)?;
    framed.write_frame(&sealed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::tests::test_keys;
    use crate::keystore::{FileKeyStore, KeyPair};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Authorizes everything, serves one key.
    struct OpenKeyStore(Arc<KeyPair>);

    impl KeyStore for OpenKeyStore {
        fn local_key_pair(&self, _principal: &str) -> Result<Arc<KeyPair>, crate::errors::KeyStoreError> {
            Ok(self.0.clone())
        }

        fn authorize_path(&self, _principal: &str, _path: &str, _direction: Direction) -> bool {
            true
        }
    }

    fn framed_pair() -> (FramedStream<DuplexStream>, FramedStream<DuplexStream>) {
        let (a, b) = duplex(1 << 16);
        (FramedStream::new(a, TIMEOUT), FramedStream::new(b, TIMEOUT))
    }

    fn client_state() -> SessionState {
        let (client, _) = test_keys();
        SessionState::for_principal("alice", Arc::new(KeyPair::new(client.clone())))
    }

    fn server_store() -> OpenKeyStore {
        let (_, server) = test_keys();
        OpenKeyStore(Arc::new(KeyPair::new(server.clone())))
    }

    #[tokio::test]
    async fn test_handshake_and_negotiation_agree_on_keys() {
        let (mut client_io, mut server_io) = framed_pair();
        let store = server_store();

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await.unwrap();
            let request = server_receive_transfer_request(&mut server_io, &mut state, &store).await.unwrap();
            let keys = server_grant_transfer(&mut server_io, &mut state).await.unwrap();
            (request, keys.current_iv(), state.phase(), state.principal().map(String::from))
        });

        let mut state = client_state();
        client_handshake(&mut client_io, &mut state).await.unwrap();
        assert_eq!(state.phase(), Phase::SecureChannelEstablished);

        let keys = client_negotiate(&mut client_io, &mut state, "/tmp/file.bin", Direction::ClientWriting)
            .await
            .unwrap();
        assert_eq!(state.phase(), Phase::SessionKeyed);
        assert_eq!(state.direction(), Some(Direction::ClientWriting));

        let (request, server_iv, server_phase, principal) = server.await.unwrap();
        assert_eq!(request.file_path, "/tmp/file.bin");
        assert_eq!(request.direction, Direction::ClientWriting);
        assert_eq!(server_iv, keys.current_iv());
        assert_eq!(server_phase, Phase::SessionKeyed);
        assert_eq!(principal.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_password_method_not_allowed() {
        let (mut client_io, mut server_io) = framed_pair();
        let store = server_store();

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await
        });

        let (client, _) = test_keys();
        let request = Message::AuthRequest(AuthRequest {
            user_name: "alice".into(),
            requested_method: AuthMethod::Password.to_string(),
            public_key: encode_public_key(&client.to_public_key()).unwrap(),
        });
        client_io.write_frame(&request.encode().unwrap()).await.unwrap();

        let reply = Message::decode(&client_io.read_frame().await.unwrap()).unwrap();
        match reply {
            Message::AuthResponse(response) => {
                assert_eq!(response.status, Status::MethodNotAllowed);
                assert!(response.public_key.is_empty());
            }
            other => panic!("unexpected {}", other.kind()),
        }

        assert!(matches!(
            server.await.unwrap(),
            Err(SessionError::Handshake(HandshakeError::UnsupportedMethod(_)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_method_not_allowed() {
        let (mut client_io, mut server_io) = framed_pair();
        let store = server_store();

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await
        });

        let request = Message::AuthRequest(AuthRequest {
            user_name: "alice".into(),
            requested_method: "KERBEROS".into(),
            public_key: Vec::new(),
        });
        client_io.write_frame(&request.encode().unwrap()).await.unwrap();

        let reply = Message::decode(&client_io.read_frame().await.unwrap()).unwrap();
        assert!(matches!(reply, Message::AuthResponse(r) if r.status == Status::MethodNotAllowed));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_rejects_password_grant() {
        let (mut client_io, mut server_io) = framed_pair();

        let server = tokio::spawn(async move {
            let _ = server_io.read_frame().await.unwrap();
            let (_, server) = test_keys();
            let response = Message::AuthResponse(AuthResponse {
                user_name: "alice".into(),
                allowed_method: AuthMethod::Password.to_string(),
                status: Status::Ok,
                status_text: "OK".into(),
                public_key: encode_public_key(&server.to_public_key()).unwrap(),
            });
            server_io.write_frame(&response.encode().unwrap()).await.unwrap();
        });

        let mut state = client_state();
        let result = client_handshake(&mut client_io, &mut state).await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::UnsupportedMethod(m))) if m == "PASSWORD"
        ));
        assert_eq!(state.phase(), Phase::Idle);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_surfaces_rejection_text() {
        let (mut client_io, mut server_io) = framed_pair();

        let server = tokio::spawn(async move {
            let _ = server_io.read_frame().await.unwrap();
            let response = Message::AuthResponse(AuthResponse {
                user_name: "alice".into(),
                allowed_method: AuthMethod::PublicKey.to_string(),
                status: Status::Error,
                status_text: "no key pair found for principal 'alice'".into(),
                public_key: Vec::new(),
            });
            server_io.write_frame(&response.encode().unwrap()).await.unwrap();
        });

        let mut state = client_state();
        match client_handshake(&mut client_io, &mut state).await {
            Err(SessionError::Handshake(HandshakeError::Rejected(text))) => {
                assert_eq!(text, "no key pair found for principal 'alice'");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_auth_response_is_framing_error() {
        let (mut client_io, mut server_io) = framed_pair();

        let server = tokio::spawn(async move {
            let _ = server_io.read_frame().await.unwrap();
            server_io.write_frame(b"not a message").await.unwrap();
        });

        let mut state = client_state();
        assert!(matches!(
            client_handshake(&mut client_io, &mut state).await,
            Err(SessionError::Handshake(HandshakeError::Malformed(_)))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_server_key_refused() {
        let (mut client_io, mut server_io) = framed_pair();
        let store = FileKeyStore::new(None, None);

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await
        });

        let mut state = client_state();
        assert!(matches!(
            client_handshake(&mut client_io, &mut state).await,
            Err(SessionError::Handshake(HandshakeError::Rejected(_)))
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(SessionError::Handshake(HandshakeError::KeyStore(_)))
        ));
    }

    #[tokio::test]
    async fn test_denied_path_refused_with_text() {
        struct DenyAll(Arc<KeyPair>);
        impl KeyStore for DenyAll {
            fn local_key_pair(&self, _principal: &str) -> Result<Arc<KeyPair>, crate::errors::KeyStoreError> {
                Ok(self.0.clone())
            }
            fn authorize_path(&self, _principal: &str, _path: &str, _direction: Direction) -> bool {
                false
            }
        }

        let (mut client_io, mut server_io) = framed_pair();
        let (_, server_key) = test_keys();
        let store = DenyAll(Arc::new(KeyPair::new(server_key.clone())));

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await.unwrap();
            server_receive_transfer_request(&mut server_io, &mut state, &store).await
        });

        let mut state = client_state();
        client_handshake(&mut client_io, &mut state).await.unwrap();
        let result = client_negotiate(&mut client_io, &mut state, "/etc/shadow", Direction::ClientReading).await;

        match result {
            Err(SessionError::Negotiation(NegotiationError::Refused(text))) => {
                assert_eq!(text, "access to '/etc/shadow' denied");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(state.phase(), Phase::SecureChannelEstablished);
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_garbage_transfer_response_is_negotiation_error() {
        let (mut client_io, mut server_io) = framed_pair();
        let store = server_store();

        let server = tokio::spawn(async move {
            let mut state = SessionState::new();
            server_handshake(&mut server_io, &mut state, &store).await.unwrap();
            let _ = server_io.read_frame().await.unwrap();
            // Not sealed with the client key at all.
            server_io.write_frame(&[0u8; 128]).await.unwrap();
        });

        let mut state = client_state();
        client_handshake(&mut client_io, &mut state).await.unwrap();
        assert!(matches!(
            client_negotiate(&mut client_io, &mut state, "file", Direction::ClientReading).await,
            Err(SessionError::Negotiation(_))
        ));
        server.await.unwrap();
    }
}
