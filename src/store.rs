//! History of request nonces this node has issued.
//!
//! Contact-request clients record each nonce before sending; the
//! contact-response server accepts only responses naming one of them.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

/// Errors reading or writing nonce history.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted set of issued request nonces.
///
/// Each call is atomic from the caller's point of view.
pub trait NonceHistory: Send + Sync {
    /// Remember a nonce sent in an outgoing contact request.
    fn record_request_nonce(&self, nonce: &str) -> Result<(), StoreError>;

    /// Every nonce recorded so far.
    fn fetch_all_request_nonces(&self) -> Result<HashSet<String>, StoreError>;
}

/// Process-lifetime history.
#[derive(Debug, Default)]
pub struct MemoryNonceHistory {
    nonces: Mutex<HashSet<String>>,
}

impl MemoryNonceHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceHistory for MemoryNonceHistory {
    fn record_request_nonce(&self, nonce: &str) -> Result<(), StoreError> {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(nonce.to_string());
        Ok(())
    }

    fn fetch_all_request_nonces(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// History kept as a JSON array on disk, surviving restarts.
#[derive(Debug)]
pub struct JsonNonceHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonNonceHistory {
    /// History stored at `path`. The file is created on first record.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashSet<String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl NonceHistory for JsonNonceHistory {
    fn record_request_nonce(&self, nonce: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nonces = self.load()?;
        if !nonces.insert(nonce.to_string()) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut sorted: Vec<_> = nonces.into_iter().collect();
        sorted.sort();

        // Write-then-rename so readers never see a half-written file.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&sorted)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn fetch_all_request_nonces(&self) -> Result<HashSet<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
    }
}
