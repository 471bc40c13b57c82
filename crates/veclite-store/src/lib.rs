#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

pub mod segment;
pub mod wal;

mod fs_impl;
mod mem_impl;
#[cfg(feature = "object-store")]
mod object_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;
#[cfg(feature = "object-store")]
pub use object_impl::ObjectBlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use veclite_core::{Result, VecliteError};

/// Abstract key → bytes store.
///
/// `atomic_write` guarantees observers see either the previous contents or
/// the new contents, never a torn write. `append` is order-preserving but
/// not crash-atomic; only the WAL decoder tolerates a torn tail.
#[async_trait]
pub trait BlobIo: Send + Sync {
    async fn read(&self, key: &str) -> Result<Bytes>;
    async fn write(&self, key: &str, data: Bytes) -> Result<()>;
    async fn append(&self, key: &str, data: Bytes) -> Result<()>;
    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub type DynBlobStore = Arc<dyn BlobIo>;

pub type StoreFactory = Arc<dyn Fn(&str) -> Result<DynBlobStore> + Send + Sync>;

/// Maps URI schemes (`mem:`, `file:`, host-registered) to store factories.
pub struct SchemeRegistry {
    factories: RwLock<HashMap<String, StoreFactory>>,
}

impl SchemeRegistry {
    /// Registry pre-populated with the `mem:` and `file:` schemes.
    pub fn with_defaults() -> Self {
        let reg = Self {
            factories: RwLock::new(HashMap::new()),
        };
        reg.register("mem", Arc::new(|_rest| Ok(Arc::new(MemBlobStore::new()) as DynBlobStore)));
        reg.register(
            "file",
            Arc::new(|rest: &str| {
                let path = rest.trim_start_matches("//");
                if path.is_empty() {
                    return Err(VecliteError::Unsupported(
                        "file: URI needs a path".to_string(),
                    ));
                }
                Ok(Arc::new(FsBlobStore::new(path)?) as DynBlobStore)
            }),
        );
        reg
    }

    pub fn register(&self, scheme: &str, factory: StoreFactory) {
        self.factories.write().insert(scheme.to_string(), factory);
    }

    /// Opens a store for `uri` (`scheme:rest`).
    pub fn open(&self, uri: &str) -> Result<DynBlobStore> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| VecliteError::Unsupported(format!("not a store URI: {uri}")))?;
        let factory = self
            .factories
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| VecliteError::Unsupported(format!("unknown scheme: {scheme}")))?;
        factory(rest)
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        f.debug_struct("SchemeRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_opens_mem_uri() {
        let reg = SchemeRegistry::with_defaults();
        let store = reg.open("mem:").unwrap();
        store.write("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn registry_rejects_unknown_scheme() {
        let reg = SchemeRegistry::with_defaults();
        assert!(matches!(
            reg.open("s3://bucket"),
            Err(VecliteError::Unsupported(_))
        ));
    }
}
