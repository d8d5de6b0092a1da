//! Durable vector store shared between processes.
//!
//! Every mutation takes an exclusive file lock, reloads the index from
//! disk, applies the change and saves atomically, so concurrent workers
//! never lose each other's writes. Searches skip the lock and read the
//! last committed save.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;

use crate::lock::FileLock;

use super::index::{IndexError, SearchHit, VectorIndex};
use super::storage::{IndexFile, IndexFileError};

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("vector store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?} waiting for the index lock")]
    LockTimeout(Duration),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    File(#[from] IndexFileError),
}

impl VectorStoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            VectorStoreError::Io(_) | VectorStoreError::LockTimeout(_) => true,
            VectorStoreError::File(e) => e.is_retryable(),
            VectorStoreError::Index(_) => false,
        }
    }
}

/// Lock-guarded persistent vector index.
pub struct VectorStore {
    file: IndexFile,
    lock_path: PathBuf,
    model_id: [u8; 32],
    lock_timeout: Duration,
}

impl VectorStore {
    /// Open a store at `path`. The file itself is created lazily on the
    /// first add; only the parent directory is prepared here.
    pub fn open(
        path: PathBuf,
        model_id: [u8; 32],
        lock_timeout: Duration,
    ) -> Result<Self, VectorStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("lock");

        Ok(Self {
            file: IndexFile::new(path),
            lock_path,
            model_id,
            lock_timeout,
        })
    }

    /// Add or overwrite a vector under the exclusive lock.
    pub fn add(&self, id: u64, vector: Vec<f32>) -> Result<(), VectorStoreError> {
        let _lock = self.acquire_lock()?;

        let mut index = self.load_or_fresh()?;
        index.insert(id, vector)?;
        self.file.save(&index, &self.model_id)?;

        Ok(())
    }

    /// Remove a vector. Returns whether an entry was actually removed;
    /// removing an absent id is not an error.
    pub fn remove(&self, id: u64) -> Result<bool, VectorStoreError> {
        if !self.file.exists() {
            return Ok(false);
        }

        let _lock = self.acquire_lock()?;

        let mut index = self.load_or_fresh()?;
        let removed = index.remove(id).is_some();
        if removed {
            self.file.save(&index, &self.model_id)?;
        }

        Ok(removed)
    }

    /// Similarity search against the last committed save. Lock-free; a
    /// missing index file means no results.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        if !self.file.exists() {
            return Ok(vec![]);
        }

        let index = self.file.load(&self.model_id)?;
        Ok(index.search(query, threshold, top_k)?)
    }

    pub fn contains(&self, id: u64) -> Result<bool, VectorStoreError> {
        if !self.file.exists() {
            return Ok(false);
        }
        Ok(self.file.load(&self.model_id)?.contains(id))
    }

    pub fn count(&self) -> Result<usize, VectorStoreError> {
        if !self.file.exists() {
            return Ok(0);
        }
        Ok(self.file.load(&self.model_id)?.len())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn acquire_lock(&self) -> Result<FileLock, VectorStoreError> {
        FileLock::acquire_timeout(&self.lock_path, self.lock_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                VectorStoreError::LockTimeout(self.lock_timeout)
            } else {
                VectorStoreError::Io(e)
            }
        })
    }

    /// Load the current index; a missing file, or one written by another
    /// model or format version, starts fresh. Corruption propagates.
    fn load_or_fresh(&self) -> Result<VectorIndex, VectorStoreError> {
        if !self.file.exists() {
            return Ok(VectorIndex::new());
        }

        match self.file.load(&self.model_id) {
            Ok(index) => Ok(index),
            Err(IndexFileError::ModelMismatch) => {
                warn!(
                    "index file {:?} was built with a different model, starting fresh",
                    self.file.path()
                );
                Ok(VectorIndex::new())
            }
            Err(IndexFileError::VersionMismatch { expected, found }) => {
                warn!(
                    "index file {:?} has version {} (expected {}), starting fresh",
                    self.file.path(),
                    found,
                    expected
                );
                Ok(VectorIndex::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
