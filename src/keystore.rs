use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::cryptography::read_private_key;
use crate::errors::KeyStoreError;
use crate::wire::Direction;

/// File name of a principal's private key inside its key directory.
pub const PRIVATE_KEY_FILE: &str = "ucp.pem";

/// A local RSA key pair. The public half is derived once at construction.
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let public_key = private_key.to_public_key();
        KeyPair { private_key, public_key }
    }

    /// Load a PKCS#1 PEM private key from disk.
    pub fn load(path: &Path) -> Result<Self, KeyStoreError> {
        debug!("Loading private key from {}", path.display());
        Ok(KeyPair::new(read_private_key(path)?))
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// Server-side source of key pairs and path authorization.
///
/// Shared read-only by every connection task.
pub trait KeyStore: Send + Sync {
    /// Resolve the key pair the server presents to `principal`.
    fn local_key_pair(&self, principal: &str) -> Result<Arc<KeyPair>, KeyStoreError>;

    /// Whether `principal` may perform a transfer in `direction` on `path`.
    fn authorize_path(&self, principal: &str, path: &str, direction: Direction) -> bool;
}

/// Key store backed by PEM files.
///
/// With a key directory configured, `<key_dir>/<principal>/ucp.pem` is served
/// to that principal when it exists; everyone else gets the default key.
pub struct FileKeyStore {
    default_key: Option<Arc<KeyPair>>,
    key_dir: Option<PathBuf>,
}

impl FileKeyStore {
    pub fn new(default_key: Option<Arc<KeyPair>>, key_dir: Option<PathBuf>) -> Self {
        FileKeyStore { default_key, key_dir }
    }

    fn principal_key_path(&self, principal: &str) -> Result<Option<PathBuf>, KeyStoreError> {
        let Some(key_dir) = &self.key_dir else {
            return Ok(None);
        };

        if principal.is_empty()
            || principal == "."
            || principal == ".."
            || principal.contains(['/', '\\'])
        {
            return Err(KeyStoreError::InvalidPrincipal(principal.to_string()));
        }

        Ok(Some(key_dir.join(principal).join(PRIVATE_KEY_FILE)))
    }
}

impl KeyStore for FileKeyStore {
    fn local_key_pair(&self, principal: &str) -> Result<Arc<KeyPair>, KeyStoreError> {
        if let Some(path) = self.principal_key_path(principal)? {
            match KeyPair::load(&path) {
                Ok(pair) => return Ok(Arc::new(pair)),
                Err(KeyStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("No key for principal '{}' at {}", principal, path.display());
                }
                Err(e) => return Err(e),
            }
        }

        self.default_key
            .clone()
            .ok_or_else(|| KeyStoreError::KeyNotFound(principal.to_string()))
    }

    /// Reads need an existing regular file; writes need an existing parent directory.
    fn authorize_path(&self, _principal: &str, path: &str, direction: Direction) -> bool {
        let path = Path::new(path);
        match direction {
            Direction::ClientReading => fs::metadata(path).map(|m| m.is_file()).unwrap_or(false),
            Direction::ClientWriting => {
                if path.file_name().is_none() {
                    return false;
                }
                match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
                    _ => true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::tests::test_keys;
    use crate::cryptography::write_key_pair;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("test_ucp_keystore_{}_{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_default_key_served_without_key_dir() {
        let (_, server) = test_keys();
        let store = FileKeyStore::new(Some(Arc::new(KeyPair::new(server.clone()))), None);

        let pair = store.local_key_pair("anyone").unwrap();
        assert_eq!(pair.public_key(), &server.to_public_key());
    }

    #[test]
    fn test_missing_key_is_key_not_found() {
        let store = FileKeyStore::new(None, None);
        assert!(matches!(
            store.local_key_pair("alice"),
            Err(KeyStoreError::KeyNotFound(name)) if name == "alice"
        ));
    }

    #[test]
    fn test_principal_key_preferred_over_default() {
        let (client, server) = test_keys();
        let dir = scratch_dir("principal");
        write_key_pair(client, &dir.join("alice").join(PRIVATE_KEY_FILE), &dir.join("alice").join("key.pub")).unwrap();

        let store = FileKeyStore::new(Some(Arc::new(KeyPair::new(server.clone()))), Some(dir.clone()));

        assert_eq!(store.local_key_pair("alice").unwrap().public_key(), &client.to_public_key());
        assert_eq!(store.local_key_pair("bob").unwrap().public_key(), &server.to_public_key());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_principal_with_separator_rejected() {
        let dir = scratch_dir("traversal");
        let store = FileKeyStore::new(None, Some(dir.clone()));

        assert!(matches!(store.local_key_pair("../etc"), Err(KeyStoreError::InvalidPrincipal(_))));
        assert!(matches!(store.local_key_pair(".."), Err(KeyStoreError::InvalidPrincipal(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_authorize_path_policy() {
        let dir = scratch_dir("authorize");
        let file = dir.join("present.txt");
        fs::write(&file, b"data").unwrap();
        let store = FileKeyStore::new(None, None);

        let file = file.to_str().unwrap();
        let dir_str = dir.to_str().unwrap();
        let missing = dir.join("missing.txt");
        let orphan = dir.join("no/such/dir/out.txt");

        assert!(store.authorize_path("alice", file, Direction::ClientReading));
        assert!(!store.authorize_path("alice", missing.to_str().unwrap(), Direction::ClientReading));
        assert!(!store.authorize_path("alice", dir_str, Direction::ClientReading));

        assert!(store.authorize_path("alice", missing.to_str().unwrap(), Direction::ClientWriting));
        assert!(!store.authorize_path("alice", orphan.to_str().unwrap(), Direction::ClientWriting));

        let _ = fs::remove_dir_all(&dir);
    }
}
