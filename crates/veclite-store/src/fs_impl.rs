use crate::BlobIo;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use veclite_core::{Result, VecliteError};

/// Local-filesystem blob store rooted at one directory. Keys map to file
/// names inside the root; path separators in keys are rejected.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(VecliteError::Unsupported(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn map_io(key: &str, e: std::io::Error) -> VecliteError {
        if e.kind() == std::io::ErrorKind::NotFound {
            VecliteError::NotFound(key.to_string())
        } else {
            VecliteError::Io(e)
        }
    }
}

#[async_trait]
impl BlobIo for FsBlobStore {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => Err(Self::map_io(key, e)),
        }
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }

    async fn append(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &data).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }

    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let root = self.root.clone();
        // tmp + rename + fsync(parent): readers see the old or the new
        // contents, never a torn write.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            std::fs::File::open(&root)?.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| VecliteError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VecliteError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.starts_with(".tmp-") {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store
            .atomic_write("head.json", Bytes::from_static(b"{\"epoch\":1}"))
            .await
            .unwrap();
        assert_eq!(
            store.read("head.json").await.unwrap(),
            Bytes::from_static(b"{\"epoch\":1}")
        );
        // No tmp residue
        assert!(store.list("").await.unwrap().iter().all(|k| k == "head.json"));
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.read("../etc").await.is_err());
        assert!(store.read("a/b").await.is_err());
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        for chunk in [b"one" as &[u8], b"two", b"three"] {
            store.append("w.wal", Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        assert_eq!(
            store.read("w.wal").await.unwrap(),
            Bytes::from_static(b"onetwothree")
        );
    }
}
