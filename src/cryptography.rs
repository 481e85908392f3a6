use std::fs;
use std::path::Path;

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::Rng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::errors::CryptoError;
use crate::{IV_SIZE, KEY_SIZE, MIN_RSA_KEY_BITS};

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

/// OAEP with SHA-256: two digests plus two marker bytes per block.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Generate a fresh random 256-bit session key.
pub fn generate_session_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill(&mut key);
    key
}

/// Generate a fresh random 128-bit initialization vector.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill(&mut iv);
    iv
}

/// Encrypt `plaintext` for the holder of `public_key`.
///
/// RSA-OAEP can only seal a little less than one modulus worth of data, so the
/// plaintext is cut into block-sized pieces and each piece is sealed on its own.
/// The output is the concatenation of the sealed blocks, each exactly
/// `public_key.size()` bytes long.
pub fn seal_asymmetric(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block = public_key.size();
    let capacity = block
        .checked_sub(OAEP_OVERHEAD)
        .filter(|c| *c > 0)
        .ok_or_else(|| CryptoError::InvalidKey("modulus too small for OAEP".into()))?;

    let mut rng = OsRng;
    let mut sealed = Vec::with_capacity(plaintext.len().div_ceil(capacity).max(1) * block);

    // An empty plaintext still produces one block so the peer has something to open.
    let pieces: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(capacity).collect()
    };

    for piece in pieces {
        let encrypted = public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), piece)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        sealed.extend_from_slice(&encrypted);
    }

    Ok(sealed)
}

/// Reverse of [`seal_asymmetric`].
pub fn open_asymmetric(private_key: &RsaPrivateKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block = private_key.size();
    if sealed.is_empty() || sealed.len() % block != 0 {
        return Err(CryptoError::Decrypt(format!(
            "sealed payload of {} bytes is not a multiple of the {} byte block",
            sealed.len(),
            block
        )));
    }

    let mut plaintext = Vec::with_capacity(sealed.len());
    for piece in sealed.chunks(block) {
        let decrypted = private_key
            .decrypt(Oaep::new::<Sha256>(), piece)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        plaintext.extend_from_slice(&decrypted);
    }

    Ok(plaintext)
}

/// AES-256-CFB encryption. Output length equals input length.
pub fn encrypt_cfb(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CfbEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidLength(e.to_string()))?;
    let mut buffer = plaintext.to_vec();
    cipher.encrypt(&mut buffer);
    Ok(buffer)
}

/// AES-256-CFB decryption.
///
/// CFB carries no authentication tag: decrypting under the wrong key or IV
/// succeeds and yields garbage. Callers detect that by failing to decode.
pub fn decrypt_cfb(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CfbDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidLength(e.to_string()))?;
    let mut buffer = ciphertext.to_vec();
    cipher.decrypt(&mut buffer);
    Ok(buffer)
}

pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    let mut rng = OsRng;
    RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encode a public key the way it travels in an `AuthRequest`/`AuthResponse` (PKCS#1 DER).
pub fn encode_public_key(public_key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    public_key
        .to_pkcs1_der()
        .map(|der| der.as_bytes().to_vec())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Decode and validate a public key received from a peer.
pub fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_pkcs1_der(der).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bits = key.size() * 8;
    if bits < MIN_RSA_KEY_BITS {
        return Err(CryptoError::InvalidKey(format!(
            "{bits} bit key is below the {MIN_RSA_KEY_BITS} bit minimum"
        )));
    }
    Ok(key)
}

pub fn read_private_key(path: &Path) -> Result<RsaPrivateKey, std::io::Error> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

pub fn read_public_key(path: &Path) -> Result<RsaPublicKey, std::io::Error> {
    let pem = fs::read_to_string(path)?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Write a private key (PKCS#1 PEM, owner-only on Unix) and its public half
/// (PKCS#1 PEM), creating parent directories as needed.
pub fn write_key_pair(
    private_key: &RsaPrivateKey,
    private_key_path: &Path,
    public_key_path: &Path,
) -> Result<(), std::io::Error> {
    let invalid = |e: rsa::pkcs1::Error| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string());

    let private_pem = private_key.to_pkcs1_pem(LineEnding::LF).map_err(invalid)?;
    let public_pem = private_key
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(invalid)?;

    for path in [private_key_path, public_key_path] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }

    fs::write(private_key_path, private_pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(private_key_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::write(public_key_path, public_pem.as_bytes())?;

    Ok(())
}
