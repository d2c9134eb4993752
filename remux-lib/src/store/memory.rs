//! In-memory blob store

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{BlobHandle, BlobStore};
use crate::error::StoreError;

/// Blob store that keeps payloads in process memory
pub struct MemoryBlobStore {
    /// Stored payloads (handle -> bytes)
    entries: DashMap<BlobHandle, Bytes>,
    /// Current memory usage in bytes
    memory_bytes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            memory_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, payload: Bytes) -> Result<BlobHandle, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let handle = BlobHandle::new();
        self.memory_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.entries.insert(handle, payload);
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Bytes, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.entries
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entries.clear();
        self.memory_bytes.store(0, Ordering::Relaxed);
        tracing::debug!("Memory blob store closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stored_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }
}
