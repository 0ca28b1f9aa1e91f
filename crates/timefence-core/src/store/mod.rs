//! Durable storage for the encrypted state blob.
//!
//! A single file at a stable path holds the whole blob. Writes go through
//! a temporary sibling and a rename, so a crash mid-write leaves either
//! the old intact blob or the new intact blob, never a torn one. On
//! success the file is tightened to owner-only permissions; the original
//! host's hidden-attribute hint has no Unix equivalent and is silently
//! ignored.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Permissions applied to the state file after every save.
const STATE_FILE_MODE: u32 = 0o600;

/// Errors raised by state blob storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob exists at the configured path.
    #[error("no state file found")]
    NotFound,

    /// Filesystem failure reading or writing the blob.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whole-blob read and atomic replace at a stable location.
///
/// The store keeps no in-memory copy between calls. Implementations are
/// replaceable so tests can inject failures.
pub trait StateStore: Send + Sync {
    /// Reads the entire blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no blob exists, or
    /// [`StoreError::Io`] for any other filesystem failure.
    fn load(&self) -> Result<Vec<u8>, StoreError>;

    /// Atomically replaces the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the blob cannot be written.
    fn save(&self, blob: &[u8]) -> Result<(), StoreError>;
}

/// Filesystem-backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store for the given path. Nothing is touched on disk
    /// until the first `save`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Vec<u8>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn save(&self, blob: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        fs::write(&temp_path, blob)?;
        // Tighten before the rename so the final path never carries a
        // wider mode.
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(STATE_FILE_MODE))?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
