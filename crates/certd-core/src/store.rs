//! Certificate Store
//!
//! Durable home of the client key pair and the current certificate. The host
//! app and the tunnel process each open the same namespace, so writes must be
//! atomic from the reader's point of view; last writer wins.

use crate::certificate::{Certificate, CertificateWithFeatures, ConnectionFeatures};
use crate::keys::{KeyPair, PrivateKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Storage seen by the lifecycle manager
pub trait CertificateStore: Send + Sync + 'static {
    /// Current certificate, if any
    fn stored_certificate(&self) -> Option<Certificate>;

    /// Features the current certificate was issued for
    fn stored_features(&self) -> Option<ConnectionFeatures>;

    /// Client key pair, if generated
    fn stored_keys(&self) -> Option<KeyPair>;

    /// Replace the stored certificate
    fn store_certificate(&self, certificate: CertificateWithFeatures) -> Result<(), StoreError>;

    /// Replace the stored key pair
    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError>;

    fn delete_certificate(&self) -> Result<(), StoreError>;

    /// Drop the key pair; the certificate authenticates it, so it goes too
    fn delete_keys(&self) -> Result<(), StoreError>;
}

impl<T: CertificateStore> CertificateStore for Arc<T> {
    fn stored_certificate(&self) -> Option<Certificate> {
        (**self).stored_certificate()
    }

    fn stored_features(&self) -> Option<ConnectionFeatures> {
        (**self).stored_features()
    }

    fn stored_keys(&self) -> Option<KeyPair> {
        (**self).stored_keys()
    }

    fn store_certificate(&self, certificate: CertificateWithFeatures) -> Result<(), StoreError> {
        (**self).store_certificate(certificate)
    }

    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
        (**self).store_keys(keys)
    }

    fn delete_certificate(&self) -> Result<(), StoreError> {
        (**self).delete_certificate()
    }

    fn delete_keys(&self) -> Result<(), StoreError> {
        (**self).delete_keys()
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// In-process store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Option<KeyPair>>,
    certificate: Mutex<Option<CertificateWithFeatures>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a key pair
    pub fn with_keys(keys: KeyPair) -> Self {
        Self {
            keys: Mutex::new(Some(keys)),
            certificate: Mutex::new(None),
        }
    }
}

impl CertificateStore for MemoryStore {
    fn stored_certificate(&self) -> Option<Certificate> {
        lock(&self.certificate).as_ref().map(|c| c.certificate.clone())
    }

    fn stored_features(&self) -> Option<ConnectionFeatures> {
        lock(&self.certificate).as_ref().and_then(|c| c.features.clone())
    }

    fn stored_keys(&self) -> Option<KeyPair> {
        lock(&self.keys).clone()
    }

    fn store_certificate(&self, certificate: CertificateWithFeatures) -> Result<(), StoreError> {
        *lock(&self.certificate) = Some(certificate);
        Ok(())
    }

    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
        *lock(&self.keys) = Some(keys.clone());
        Ok(())
    }

    fn delete_certificate(&self) -> Result<(), StoreError> {
        *lock(&self.certificate) = None;
        Ok(())
    }

    fn delete_keys(&self) -> Result<(), StoreError> {
        *lock(&self.keys) = None;
        self.delete_certificate()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const KEYS_FILE: &str = "keys.json";
const CERTIFICATE_FILE: &str = "certificate.json";

/// On-disk form of the key pair
#[derive(Serialize, Deserialize)]
struct KeysRecord {
    private_key: String,
    public_key: String,
}

/// File-backed store shared by cooperating processes
///
/// Each record is a JSON file in the namespace directory. Writes go to a
/// sibling temp file which is then renamed over the record, so a reader in
/// the other process sees either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the namespace directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        info!("Certificate store at {}", dir.display());
        Ok(Self { dir })
    }

    /// Namespace directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_record<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Can't read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable record {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_record<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StoreError> {
        let path = self.path(name);
        let tmp = self.path(&format!(
            ".{}.{}.{:016x}.tmp",
            name,
            std::process::id(),
            rand::random::<u64>()
        ));
        let bytes = serde_json::to_vec_pretty(record)?;

        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = private_file(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Io { path, source });
        }
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn remove_record(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[cfg(unix)]
fn private_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

impl CertificateStore for FileStore {
    fn stored_certificate(&self) -> Option<Certificate> {
        self.read_record::<CertificateWithFeatures>(CERTIFICATE_FILE)
            .map(|c| c.certificate)
    }

    fn stored_features(&self) -> Option<ConnectionFeatures> {
        self.read_record::<CertificateWithFeatures>(CERTIFICATE_FILE)
            .and_then(|c| c.features)
    }

    fn stored_keys(&self) -> Option<KeyPair> {
        let record: KeysRecord = self.read_record(KEYS_FILE)?;
        let private = match PrivateKey::from_base64(&record.private_key) {
            Ok(private) => private,
            Err(e) => {
                warn!("Stored private key is unusable: {}", e);
                return None;
            }
        };
        let keys = KeyPair::from_private(private);
        if keys.public.to_base64() != record.public_key {
            warn!("Stored public key does not match private key");
            return None;
        }
        Some(keys)
    }

    fn store_certificate(&self, certificate: CertificateWithFeatures) -> Result<(), StoreError> {
        self.write_record(CERTIFICATE_FILE, &certificate)?;
        debug!(
            "Certificate saved, valid until {}",
            certificate.certificate.valid_until
        );
        Ok(())
    }

    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
        info!("Storing client keys ({:?})", keys.public);
        self.write_record(
            KEYS_FILE,
            &KeysRecord {
                private_key: keys.private.to_base64(),
                public_key: keys.public.to_base64(),
            },
        )
    }

    fn delete_certificate(&self) -> Result<(), StoreError> {
        info!("Deleting stored certificate");
        self.remove_record(CERTIFICATE_FILE)
    }

    fn delete_keys(&self) -> Result<(), StoreError> {
        info!("Deleting stored client keys");
        self.remove_record(KEYS_FILE)?;
        self.delete_certificate()
    }
}
