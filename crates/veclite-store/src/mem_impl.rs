use crate::BlobIo;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use veclite_core::{Result, VecliteError};

/// In-memory blob store. Every operation is trivially atomic because the
/// map is mutated under one lock.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobIo for MemBlobStore {
    async fn read(&self, key: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| VecliteError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.blobs.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn append(&self, key: &str, data: Bytes) -> Result<()> {
        let mut blobs = self.blobs.write();
        match blobs.get_mut(key) {
            Some(existing) => {
                let mut buf = BytesMut::with_capacity(existing.len() + data.len());
                buf.extend_from_slice(existing);
                buf.extend_from_slice(&data);
                *existing = buf.freeze();
            }
            None => {
                blobs.insert(key.to_string(), data);
            }
        }
        Ok(())
    }

    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()> {
        self.write(key, data).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
