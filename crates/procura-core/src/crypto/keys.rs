//! Key storage for principal signing keys.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::sign::{SECRET_KEY_SIZE, Signer, SignerError};

/// Errors that can occur during key management operations.
#[derive(Debug, Error)]
pub enum KeyManagerError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No key stored for the principal.
    #[error("key not found for principal: {principal_id}")]
    KeyNotFound {
        /// The principal whose key was not found.
        principal_id: Uuid,
    },

    /// A key already exists for the principal.
    #[error("key already exists for principal: {principal_id}")]
    KeyAlreadyExists {
        /// The principal that already has a key.
        principal_id: Uuid,
    },

    /// Stored bytes were not a valid P-256 secret key.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(#[from] SignerError),

    /// Key file or directory permissions allow group/other access.
    #[error("insecure permissions on key path: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },
}

/// A stored keypair bound to a principal.
#[derive(Clone)]
pub struct StoredKeypair {
    /// The principal this keypair belongs to.
    pub principal_id: Uuid,

    signer: Signer,
}

impl StoredKeypair {
    fn new(principal_id: Uuid, signer: Signer) -> Self {
        Self {
            principal_id,
            signer,
        }
    }

    /// Returns the signer for this keypair.
    #[must_use]
    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Returns the compressed SEC1 public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signer.public_key_bytes()
    }
}

/// Manager for storing and retrieving principal signing keys.
///
/// Keys can be stored in memory (tests) or on disk with 0600 permissions.
pub struct KeyManager {
    storage: KeyStorage,
}

enum KeyStorage {
    Memory(RwLock<HashMap<Uuid, StoredKeypair>>),
    File { keys_dir: PathBuf },
}

impl KeyManager {
    /// Creates an in-memory key manager.
    ///
    /// Keys are not persisted and are lost when the manager is dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: KeyStorage::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a file-based key manager rooted at `keys_dir`.
    ///
    /// The directory is created with 0700 if missing; existing directories
    /// with group/other access are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or has insecure
    /// permissions.
    pub fn new(keys_dir: impl AsRef<Path>) -> Result<Self, KeyManagerError> {
        let keys_dir = keys_dir.as_ref().to_path_buf();

        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            fs::set_permissions(&keys_dir, fs::Permissions::from_mode(0o700))?;
        }

        let metadata = fs::metadata(&keys_dir)?;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(KeyManagerError::InsecurePermissions {
                path: keys_dir.display().to_string(),
            });
        }

        Ok(Self {
            storage: KeyStorage::File { keys_dir },
        })
    }

    /// Generates and stores a new keypair for a principal.
    ///
    /// # Errors
    ///
    /// Returns `KeyAlreadyExists` if the principal already has a key, or a
    /// storage error.
    pub fn generate_keypair(&self, principal_id: Uuid) -> Result<Signer, KeyManagerError> {
        if self.get_keypair(principal_id).is_ok() {
            return Err(KeyManagerError::KeyAlreadyExists { principal_id });
        }

        let signer = Signer::generate();
        self.store_keypair(principal_id, &signer)?;
        Ok(signer)
    }

    /// Stores an existing keypair for a principal.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be stored.
    pub fn store_keypair(&self, principal_id: Uuid, signer: &Signer) -> Result<(), KeyManagerError> {
        match &self.storage {
            KeyStorage::Memory(map) => {
                let mut map = map.write().unwrap();
                map.insert(principal_id, StoredKeypair::new(principal_id, signer.clone()));
            },
            KeyStorage::File { keys_dir } => {
                let key_path = keys_dir.join(format!("{principal_id}.key"));
                let secret = Zeroizing::new(signer.secret_bytes());

                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&key_path)?;
                file.write_all(&*secret)?;
                file.sync_all()?;

                let metadata = fs::metadata(&key_path)?;
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    let _ = fs::remove_file(&key_path);
                    return Err(KeyManagerError::InsecurePermissions {
                        path: key_path.display().to_string(),
                    });
                }
            },
        }
        Ok(())
    }

    /// Retrieves the keypair for a principal.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if absent, `InsecurePermissions` if the key
    /// file is group/other readable, or an I/O error.
    pub fn get_keypair(&self, principal_id: Uuid) -> Result<StoredKeypair, KeyManagerError> {
        match &self.storage {
            KeyStorage::Memory(map) => {
                let map = map.read().unwrap();
                map.get(&principal_id)
                    .cloned()
                    .ok_or(KeyManagerError::KeyNotFound { principal_id })
            },
            KeyStorage::File { keys_dir } => {
                let key_path = keys_dir.join(format!("{principal_id}.key"));
                if !key_path.exists() {
                    return Err(KeyManagerError::KeyNotFound { principal_id });
                }

                let metadata = fs::metadata(&key_path)?;
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(KeyManagerError::InsecurePermissions {
                        path: key_path.display().to_string(),
                    });
                }

                let mut file = File::open(&key_path)?;
                let mut secret = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
                file.read_exact(&mut *secret)?;

                let signer = Signer::from_secret_bytes(&secret)?;
                Ok(StoredKeypair::new(principal_id, signer))
            },
        }
    }

    /// Deletes the keypair for a principal.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if absent or an I/O error on removal.
    pub fn delete_keypair(&self, principal_id: Uuid) -> Result<(), KeyManagerError> {
        match &self.storage {
            KeyStorage::Memory(map) => {
                let mut map = map.write().unwrap();
                if map.remove(&principal_id).is_none() {
                    return Err(KeyManagerError::KeyNotFound { principal_id });
                }
            },
            KeyStorage::File { keys_dir } => {
                let key_path = keys_dir.join(format!("{principal_id}.key"));
                if !key_path.exists() {
                    return Err(KeyManagerError::KeyNotFound { principal_id });
                }
                fs::remove_file(&key_path)?;
            },
        }
        Ok(())
    }
}
