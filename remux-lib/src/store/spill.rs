//! Temp-directory backed blob store
//!
//! Every payload lands in its own `<uuid>.bin` file inside a private temporary
//! directory. Closing the store removes the directory and everything in it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tempfile::TempDir;

use super::{BlobHandle, BlobStore};
use crate::error::StoreError;

const SPILL_PREFIX: &str = "remux-spill-";

pub struct SpillBlobStore {
    dir: PathBuf,
    temp_dir: Mutex<Option<TempDir>>,
    stored_bytes: AtomicU64,
    closed: AtomicBool,
}

impl SpillBlobStore {
    /// Create a store under the system temp directory
    pub fn new() -> Result<Self, StoreError> {
        Self::from_temp_dir(tempfile::Builder::new().prefix(SPILL_PREFIX).tempdir()?)
    }

    /// Create a store under `parent`
    pub fn new_in(parent: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(parent)?;
        Self::from_temp_dir(
            tempfile::Builder::new()
                .prefix(SPILL_PREFIX)
                .tempdir_in(parent)?,
        )
    }

    fn from_temp_dir(temp_dir: TempDir) -> Result<Self, StoreError> {
        let dir = temp_dir.path().to_path_buf();
        tracing::debug!("Spill store created at {}", dir.display());
        Ok(Self {
            dir,
            temp_dir: Mutex::new(Some(temp_dir)),
            stored_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the spill files
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, handle: &BlobHandle) -> PathBuf {
        self.dir.join(format!("{}.bin", handle))
    }
}

#[async_trait]
impl BlobStore for SpillBlobStore {
    async fn save(&self, payload: Bytes) -> Result<BlobHandle, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let handle = BlobHandle::new();
        tokio::fs::write(self.blob_path(&handle), &payload).await?;
        self.stored_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Bytes, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        match tokio::fs::read(self.blob_path(handle)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.is_closed() {
                    Err(StoreError::Closed)
                } else {
                    Err(StoreError::NotFound(handle.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(temp_dir) = self.temp_dir.lock().take() {
            if let Err(e) = temp_dir.close() {
                tracing::warn!("Failed to remove spill directory {}: {}", self.dir.display(), e);
            }
        }
        self.stored_bytes.store(0, Ordering::Relaxed);
        tracing::debug!("Spill store closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for SpillBlobStore {
    fn drop(&mut self) {
        self.close();
    }
}
