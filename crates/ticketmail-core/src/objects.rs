//! Attachment object storage.
//!
//! Objects are content addressed by their SHA-256, so writing the same
//! attachment twice (for example when a crashed cycle is retried) is
//! harmless.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result, TenantId};

/// Hex SHA-256 of some bytes.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Blob storage for attachment contents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under their checksum; returns the storage path.
    async fn put(&self, tenant_id: TenantId, checksum: &str, bytes: &[u8]) -> Result<String>;

    /// Read back a stored object.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

fn object_path(tenant_id: TenantId, checksum: &str) -> Result<String> {
    if checksum.len() < 2 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Corrupt(format!("invalid checksum {checksum:?}")));
    }
    Ok(format!("{tenant_id}/{}/{checksum}", &checksum[..2]))
}

/// Objects under a local directory: `<root>/<tenant>/<aa>/<checksum>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store rooted at `root`; created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, tenant_id: TenantId, checksum: &str, bytes: &[u8]) -> Result<String> {
        let path = object_path(tenant_id, checksum)?;
        let full = self.root.join(&path);
        if tokio::fs::try_exists(&full).await? {
            return Ok(path);
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = full.with_extension("partial");
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &full).await?;
        debug!(path = %path, size = bytes.len(), "Stored attachment");
        Ok(path)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(full) = self.resolve(path) else {
            return Ok(None);
        };
        match tokio::fs::read(full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process object store for tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, tenant_id: TenantId, checksum: &str, bytes: &[u8]) -> Result<String> {
        let path = object_path(tenant_id, checksum)?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(path)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_memory_store_dedupes() {
        let store = MemoryObjectStore::new();
        let tenant = TenantId::new();
        let sum = checksum(b"data");
        let a = store.put(tenant, &sum, b"data").await.unwrap();
        let b = store.put(tenant, &sum, b"data").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap().unwrap(), b"data");
        assert!(store.put(tenant, "../../etc", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let root = std::env::temp_dir().join(format!("ticketmail-objects-{}", uuid::Uuid::new_v4()));
        let store = FsObjectStore::new(&root);
        let tenant = TenantId::new();
        let sum = checksum(b"hello");

        let path = store.put(tenant, &sum, b"hello").await.unwrap();
        assert!(path.starts_with(&tenant.to_string()));
        assert_eq!(store.put(tenant, &sum, b"hello").await.unwrap(), path);
        assert_eq!(store.get(&path).await.unwrap().unwrap(), b"hello");
        assert!(store.get("../outside").await.unwrap().is_none());
        assert!(store.get(&format!("{tenant}/zz/missing")).await.unwrap().is_none());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
