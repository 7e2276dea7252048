//! Persistent username → biometric reference store.
//!
//! The whole store lives in one JSON blob that is rewritten on every
//! mutation: serialize to a `.tmp_` file in the target directory, fsync,
//! rename over the target, fsync the directory. Readers therefore see
//! either the previous blob or the new one, never a torn write.
//!
//! Every read and write in this process goes through one mutex owned by the
//! [`EmbeddingStore`] instance. Separate processes writing the same path are
//! only protected by rename atomicity.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Embedding;

const STORE_FORMAT_VERSION: u32 = 1;
/// Blobs shorter than this cannot hold a valid document and read as empty.
const MIN_BLOB_LEN: u64 = 8;
const TEMP_PREFIX: &str = ".tmp_";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write embedding store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode embedding store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("embedding store {path} unreadable after {attempts} attempt(s): {message}")]
    Unavailable {
        path: PathBuf,
        attempts: usize,
        message: String,
    },
}

/// Reference data for one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Unit-norm shots, most recent last.
    pub shots: Vec<Embedding>,
    /// Unit-norm mean of `shots`; rewritten together with them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Embedding>,
}

impl IdentityRecord {
    pub fn is_empty(&self) -> bool {
        self.shots.is_empty() && self.centroid.is_none()
    }

    /// Dimensionality of the stored vectors, if any are stored.
    pub fn dim(&self) -> Option<usize> {
        self.centroid
            .as_ref()
            .or_else(|| self.shots.first())
            .map(Embedding::dim)
    }
}

/// In-memory copy of the whole store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub identities: BTreeMap<String, IdentityRecord>,
}

impl StoreSnapshot {
    pub fn get(&self, username: &str) -> Option<&IdentityRecord> {
        self.identities.get(username)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[derive(Serialize)]
struct BlobRef<'a> {
    version: u32,
    identities: &'a BTreeMap<String, IdentityRecord>,
}

#[derive(Deserialize)]
struct Blob {
    version: u32,
    #[serde(default)]
    identities: BTreeMap<String, IdentityRecord>,
}

/// What `load` does once every read attempt has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFailurePolicy {
    /// Log a warning and behave as if the store were empty. Unreadable
    /// storage then looks like "unknown identity" to verification.
    #[default]
    TreatAsEmpty,
    /// Return [`StoreError::Unavailable`].
    Surface,
}

impl FromStr for ReadFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(ReadFailurePolicy::TreatAsEmpty),
            "error" => Ok(ReadFailurePolicy::Surface),
            other => Err(format!("unknown store read-failure policy '{other}' (expected 'empty' or 'error')")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Extra read attempts after the first failure.
    pub retries: usize,
    pub retry_delay: Duration,
    pub read_failure: ReadFailurePolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_delay: Duration::from_millis(150),
            read_failure: ReadFailurePolicy::TreatAsEmpty,
        }
    }
}

/// File-backed store shared by enrollment and verification.
pub struct EmbeddingStore {
    path: PathBuf,
    options: StoreOptions,
    lock: Mutex<()>,
}

impl EmbeddingStore {
    /// Does not touch the filesystem; the blob is created on first save.
    pub fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            path: path.into(),
            options,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole store.
    ///
    /// Missing or near-empty files read as an empty store. A failing read is
    /// retried `options.retries` times; after that the configured
    /// [`ReadFailurePolicy`] decides between an empty store and an error.
    pub fn load(&self) -> Result<StoreSnapshot, StoreError> {
        self.read_retrying(self.options.read_failure, || {
            let _guard = self.guard();
            self.read_blob()
        })
    }

    /// Replace the persisted store with `snapshot`.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let _guard = self.guard();
        self.write_blob(snapshot)
    }

    /// Load, mutate and save under a single hold of the store mutex.
    ///
    /// Nothing is written when `mutate` returns `Err`. An unreadable blob is
    /// always [`StoreError::Unavailable`] here, whatever the read-failure
    /// policy, so a write never replaces identities it could not read.
    pub fn update<T, E>(
        &self,
        mutate: impl FnOnce(&mut StoreSnapshot) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.guard();
        let mut snapshot = self.read_retrying(ReadFailurePolicy::Surface, || self.read_blob())?;
        let value = mutate(&mut snapshot)?;
        self.write_blob(&snapshot)?;
        Ok(value)
    }

    /// Delete an identity. Returns whether it existed.
    pub fn remove(&self, username: &str) -> Result<bool, StoreError> {
        self.update(|snapshot| Ok(snapshot.identities.remove(username).is_some()))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The mutex guards no data, so a panic elsewhere cannot leave it inconsistent.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_retrying(
        &self,
        policy: ReadFailurePolicy,
        mut attempt: impl FnMut() -> Result<StoreSnapshot, String>,
    ) -> Result<StoreSnapshot, StoreError> {
        let attempts = self.options.retries + 1;
        let mut last_error = String::new();

        for n in 1..=attempts {
            match attempt() {
                Ok(snapshot) => return Ok(snapshot),
                Err(message) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        attempt = n,
                        error = %message,
                        "embedding store read failed"
                    );
                    last_error = message;
                    if n < attempts {
                        std::thread::sleep(self.options.retry_delay);
                    }
                }
            }
        }

        match policy {
            ReadFailurePolicy::TreatAsEmpty => {
                tracing::warn!(
                    path = %self.path.display(),
                    attempts,
                    error = %last_error,
                    "embedding store unreadable; continuing with an empty store"
                );
                Ok(StoreSnapshot::default())
            }
            ReadFailurePolicy::Surface => Err(StoreError::Unavailable {
                path: self.path.clone(),
                attempts,
                message: last_error,
            }),
        }
    }

    /// Caller holds the store mutex.
    fn read_blob(&self) -> Result<StoreSnapshot, String> {
        match fs::metadata(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoreSnapshot::default())
            }
            Err(err) => return Err(err.to_string()),
            Ok(meta) if meta.len() < MIN_BLOB_LEN => return Ok(StoreSnapshot::default()),
            Ok(_) => {}
        }

        let data = fs::read(&self.path).map_err(|err| err.to_string())?;
        let blob: Blob = serde_json::from_slice(&data).map_err(|err| err.to_string())?;
        if blob.version != STORE_FORMAT_VERSION {
            return Err(format!(
                "unsupported store format version {} (expected {STORE_FORMAT_VERSION})",
                blob.version
            ));
        }

        Ok(StoreSnapshot {
            identities: blob.identities,
        })
    }

    /// Caller holds the store mutex.
    fn write_blob(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let write_err = |source: io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;

        let encoded = serde_json::to_vec(&BlobRef {
            version: STORE_FORMAT_VERSION,
            identities: &snapshot.identities,
        })?;

        // Dropping `tmp` on any early return removes the temp file.
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(write_err)?;
        tmp.write_all(&encoded).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|err| write_err(err.error))?;
        sync_dir(dir).map_err(write_err)?;

        tracing::debug!(
            path = %self.path.display(),
            identities = snapshot.len(),
            bytes = encoded.len(),
            "embedding store saved"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
