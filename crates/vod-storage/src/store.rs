//! Object store capability and an in-memory implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::delivery::CdnSigner;
use crate::error::{StorageError, StorageResult};

/// Key/value blob storage with signed read URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<()>;

    /// Store the contents of a local file under `key`.
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()>;

    /// Fetch an object.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Fetch an object into a local file and return its size.
    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<u64>;

    /// Time-limited read URL for `key`.
    async fn sign(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Cheap reachability probe used by readiness checks.
    async fn check_connectivity(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// In-process [`ObjectStore`] for tests and local development.
///
/// Signed URLs use the CDN token scheme when a signer is configured and the
/// `memory://{key}?expires_in={secs}` form otherwise.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    signer: Option<CdnSigner>,
    failing_puts: AtomicU32,
    failing_signs: AtomicBool,
    put_count: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer(mut self, signer: CdnSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Make the next `n` writes fail with an upload error.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Make every signing call fail until reset.
    pub fn fail_signing(&self, fail: bool) {
        self.failing_signs.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> u32 {
        self.put_count.load(Ordering::SeqCst)
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    /// Keys under `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if self.take_put_failure() {
            return Err(StorageError::upload_failed(format!("injected failure for {}", key)));
        }
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        let data = tokio::fs::read(path).await?;
        self.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let data = self.get(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn sign(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        if self.failing_signs.load(Ordering::SeqCst) {
            return Err(StorageError::presign_failed("injected signing failure"));
        }
        match &self.signer {
            Some(signer) => signer.sign_url(key, ttl),
            None => Ok(format!("memory://{}?expires_in={}", key, ttl.as_secs())),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let store = MemoryObjectStore::new();
        store.put("a/b", b"one".to_vec(), "text/plain").await.unwrap();
        store.put("a/b", b"two".to_vec(), "text/plain").await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), b"two");
        assert_eq!(store.put_count(), 2);
        assert!(matches!(
            store.get("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_put_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(1);
        assert!(store.put("k", vec![1], "x").await.is_err());
        assert!(store.put("k", vec![1], "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let store = MemoryObjectStore::new();
        store.upload_file(&src, "uploads/x/x.bin", "video/mp4").await.unwrap();
        let dst = dir.path().join("nested").join("out.bin");
        let size = store.download_file("uploads/x/x.bin", &dst).await.unwrap();

        assert_eq!(size, 7);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
        assert_eq!(
            store.object("uploads/x/x.bin").await.unwrap().content_type,
            "video/mp4"
        );
    }

    #[tokio::test]
    async fn test_sign_reports_ttl() {
        let store = MemoryObjectStore::new();
        let url = store
            .sign("videos/a/hls/a_v0_000.ts", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(url, "memory://videos/a/hls/a_v0_000.ts?expires_in=3600");

        store.fail_signing(true);
        assert!(store.sign("k", Duration::from_secs(1)).await.is_err());
    }
}
