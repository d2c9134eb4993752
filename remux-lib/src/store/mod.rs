//! Spillover blob store
//!
//! Chunk payloads are written here during assembly so that the session only
//! holds metadata and opaque handles; they are read back once, in bulk, when
//! the output artifact is concatenated.

pub mod memory;
pub mod spill;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{StoreConfig, StoreKind};
use crate::error::StoreError;

pub use memory::MemoryBlobStore;
pub use spill::SpillBlobStore;

/// Opaque reference to a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle(Uuid);

impl BlobHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist a payload and return its handle
    async fn save(&self, payload: Bytes) -> Result<BlobHandle, StoreError>;

    /// Read back a payload
    async fn get(&self, handle: &BlobHandle) -> Result<Bytes, StoreError>;

    /// Read back many payloads concurrently. Results follow the order of `handles`.
    async fn get_all(&self, handles: &[BlobHandle]) -> Result<Vec<Bytes>, StoreError> {
        futures_util::future::try_join_all(handles.iter().map(|h| self.get(h))).await
    }

    /// Invalidate every handle and reclaim storage. Safe to call more than once.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Total bytes currently held
    fn stored_bytes(&self) -> u64;
}

/// Create the store selected by `config`
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        StoreKind::Spill => {
            let store = match &config.spill_dir {
                Some(dir) => SpillBlobStore::new_in(dir)?,
                None => SpillBlobStore::new()?,
            };
            Ok(Arc::new(store))
        }
    }
}

/// Scoped ownership of a session's blob store.
///
/// Dropping the guard closes the store. A successful conversion hands the
/// store off with [`StoreGuard::release`] instead, which closes it after an
/// explicit grace period.
pub struct StoreGuard {
    store: Arc<dyn BlobStore>,
    armed: bool,
}

impl StoreGuard {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store, armed: true }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Close the store right away
    pub fn close_now(mut self) {
        self.armed = false;
        self.store.close();
    }

    /// Close the store once `grace` has elapsed.
    ///
    /// Without a tokio runtime, or with a zero grace, the store is closed immediately.
    pub fn release(mut self, grace: Duration) {
        self.armed = false;
        let store = Arc::clone(&self.store);
        if grace.is_zero() {
            store.close();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Blob store release scheduled in {:?}", grace);
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    store.close();
                });
            }
            Err(_) => store.close(),
        }
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if self.armed {
            self.store.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_drop_closes_store() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        {
            let guard = StoreGuard::new(Arc::clone(&store));
            guard.store().save(Bytes::from("x")).await.unwrap();
        }
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_guard_release_with_grace() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let handle = store.save(Bytes::from("payload")).await.unwrap();

        StoreGuard::new(Arc::clone(&store)).release(Duration::from_millis(50));
        // Still readable during the grace period
        assert_eq!(store.get(&handle).await.unwrap(), Bytes::from("payload"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_guard_release_without_grace() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        StoreGuard::new(Arc::clone(&store)).release(Duration::ZERO);
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_get_all_preserves_order() {
        let store = MemoryBlobStore::new();
        let mut handles = Vec::new();
        for i in 0..16u8 {
            handles.push(store.save(Bytes::from(vec![i; 4])).await.unwrap());
        }
        handles.reverse();
        let all = store.get_all(&handles).await.unwrap();
        for (i, payload) in all.iter().enumerate() {
            assert_eq!(payload[0], 15 - i as u8);
        }
    }

    #[test]
    fn test_create_store_memory() {
        let store = create_store(&StoreConfig::memory()).unwrap();
        assert_eq!(store.stored_bytes(), 0);
        assert!(!store.is_closed());
    }
}
