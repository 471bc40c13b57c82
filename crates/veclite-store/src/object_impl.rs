use crate::BlobIo;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use object_store::path::Path as ObjPath;
use object_store::ObjectStore;
use std::sync::Arc;
use veclite_core::{Result, VecliteError};

/// Adapter over any `object_store` backend (S3, GCS, local, ...).
///
/// Object stores have no native append; `append` is emulated with a
/// read-modify-write, which is safe here because the WAL has a single
/// writer.
pub struct ObjectBlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    fn map_err(key: &str, e: object_store::Error) -> VecliteError {
        match e {
            object_store::Error::NotFound { .. } => VecliteError::NotFound(key.to_string()),
            other => VecliteError::Io(std::io::Error::other(other)),
        }
    }
}

#[async_trait]
impl BlobIo for ObjectBlobStore {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let result = self
            .inner
            .get(&ObjPath::from(key))
            .await
            .map_err(|e| Self::map_err(key, e))?;
        result.bytes().await.map_err(|e| Self::map_err(key, e))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner
            .put(&ObjPath::from(key), data.into())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(())
    }

    async fn append(&self, key: &str, data: Bytes) -> Result<()> {
        let merged = match self.read(key).await {
            Ok(existing) => {
                let mut buf = BytesMut::with_capacity(existing.len() + data.len());
                buf.extend_from_slice(&existing);
                buf.extend_from_slice(&data);
                buf.freeze()
            }
            Err(e) if e.is_not_found() => data,
            Err(e) => return Err(e),
        };
        self.write(key, merged).await
    }

    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()> {
        // Object puts are already all-or-nothing.
        self.write(key, data).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        match self.inner.delete(&ObjPath::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::map_err(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let metas: Vec<object_store::ObjectMeta> = self
            .inner
            .list(None)
            .try_collect()
            .await
            .map_err(|e| Self::map_err(prefix, e))?;
        Ok(metas
            .into_iter()
            .map(|m| m.location.to_string())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
