use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{Acl, MediaError, MediaResult, ObjectStore, RemoteLocator};

/// One stored object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub acl: Acl,
}

/// In-process object store for tests and local development.
///
/// Cloning shares the underlying objects. Failures can be injected for
/// writes and for ACL updates on specific keys.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<(String, String), StoredObject>>>,
    failing_acl_keys: Arc<RwLock<HashSet<String>>>,
    fail_writes: Arc<AtomicBool>,
    acl_batches: Arc<AtomicUsize>,
    acl_updates: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(locator: &RemoteLocator) -> (String, String) {
        (locator.bucket.clone(), locator.key.clone())
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make ACL updates for `key` fail with `AccessDenied`
    pub fn fail_acl_for<S: Into<String>>(&self, key: S) {
        self.failing_acl_keys.write().insert(key.into());
    }

    /// Number of batched ACL requests received
    pub fn acl_batches(&self) -> usize {
        self.acl_batches.load(Ordering::SeqCst)
    }

    /// Number of individual ACL updates attempted
    pub fn acl_updates(&self) -> usize {
        self.acl_updates.load(Ordering::SeqCst)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Insert an object directly, bypassing failure injection
    pub fn insert<B: Into<Bytes>>(&self, bucket: &str, key: &str, body: B, content_type: Option<&str>, acl: Acl) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: content_type.map(str::to_string),
                acl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn apply_acl(&self, locator: &RemoteLocator, acl: Acl) -> MediaResult<()> {
        self.acl_updates.fetch_add(1, Ordering::SeqCst);
        if self.failing_acl_keys.read().contains(&locator.key) {
            return Err(MediaError::remote("AccessDenied", format!("Access Denied for {}", locator)));
        }
        match self.objects.write().get_mut(&Self::id(locator)) {
            Some(object) => {
                object.acl = acl;
                Ok(())
            }
            None => Err(MediaError::remote("NoSuchKey", format!("{} does not exist", locator))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, locator: &RemoteLocator) -> MediaResult<bool> {
        Ok(self.objects.read().contains_key(&Self::id(locator)))
    }

    async fn read(&self, locator: &RemoteLocator) -> MediaResult<Bytes> {
        self.objects
            .read()
            .get(&Self::id(locator))
            .map(|object| object.body.clone())
            .ok_or_else(|| MediaError::not_found(locator.to_path()))
    }

    async fn write(
        &self,
        locator: &RemoteLocator,
        body: Bytes,
        content_type: Option<&str>,
        acl: Acl,
    ) -> MediaResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MediaError::remote("InternalError", format!("write to {} rejected", locator)));
        }
        self.objects.write().insert(
            Self::id(locator),
            StoredObject {
                body,
                content_type: content_type.map(str::to_string),
                acl,
            },
        );
        Ok(())
    }

    async fn copy(&self, from: &RemoteLocator, to: &RemoteLocator) -> MediaResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MediaError::remote("InternalError", format!("copy to {} rejected", to)));
        }
        let mut objects = self.objects.write();
        let source = objects
            .get(&Self::id(from))
            .cloned()
            .ok_or_else(|| MediaError::not_found(from.to_path()))?;
        objects.insert(Self::id(to), source);
        Ok(())
    }

    async fn delete(&self, locator: &RemoteLocator) -> MediaResult<()> {
        self.objects.write().remove(&Self::id(locator));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> MediaResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn get_acl(&self, locator: &RemoteLocator) -> MediaResult<Acl> {
        self.objects
            .read()
            .get(&Self::id(locator))
            .map(|object| object.acl)
            .ok_or_else(|| MediaError::not_found(locator.to_path()))
    }

    async fn set_acl(&self, locator: &RemoteLocator, acl: Acl) -> MediaResult<()> {
        self.apply_acl(locator, acl)
    }

    async fn set_acl_batch(
        &self,
        locators: &[RemoteLocator],
        acl: Acl,
        _concurrency: usize,
    ) -> Vec<MediaResult<()>> {
        self.acl_batches.fetch_add(1, Ordering::SeqCst);
        locators.iter().map(|locator| self.apply_acl(locator, acl)).collect()
    }

    async fn presign_get(&self, locator: &RemoteLocator, expires_in: Duration) -> MediaResult<String> {
        Ok(format!(
            "https://{}.s3.amazonaws.com/{}?X-Amz-Expires={}&X-Amz-Signature={}",
            locator.bucket,
            locator.key,
            expires_in.as_secs(),
            Uuid::new_v4().simple()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemoryObjectStore::new();
        let locator = RemoteLocator::new("media", "uploads/a.txt");

        store
            .write(&locator, Bytes::from_static(b"hello"), Some("text/plain"), Acl::PublicRead)
            .await
            .unwrap();
        assert!(store.exists(&locator).await.unwrap());
        assert_eq!(store.read(&locator).await.unwrap(), Bytes::from_static(b"hello"));

        store.delete(&locator).await.unwrap();
        assert!(!store.exists(&locator).await.unwrap());
        assert!(store.read(&locator).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_previous_object() {
        let store = MemoryObjectStore::new();
        store.insert("media", "a.txt", &b"old"[..], None, Acl::PublicRead);
        store.fail_writes(true);

        let locator = RemoteLocator::new("media", "a.txt");
        assert!(store.write(&locator, Bytes::from_static(b"new"), None, Acl::PublicRead).await.is_err());
        assert_eq!(store.read(&locator).await.unwrap(), Bytes::from_static(b"old"));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryObjectStore::new();
        store.insert("media", "uploads/2024/a.png", &b"a"[..], None, Acl::PublicRead);
        store.insert("media", "uploads/2025/b.png", &b"b"[..], None, Acl::PublicRead);
        store.insert("other", "uploads/2024/c.png", &b"c"[..], None, Acl::PublicRead);

        let keys = store.list("media", "uploads/2024/").await.unwrap();
        assert_eq!(keys, vec!["uploads/2024/a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_acl_batch_reports_per_file() {
        let store = MemoryObjectStore::new();
        store.insert("media", "a", &b"a"[..], None, Acl::PublicRead);
        store.insert("media", "b", &b"b"[..], None, Acl::PublicRead);
        store.fail_acl_for("b");

        let locators = vec![RemoteLocator::new("media", "a"), RemoteLocator::new("media", "b")];
        let results = store.set_acl_batch(&locators, Acl::Private, 4).await;

        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code(), "AccessDenied");
        assert_eq!(store.acl_batches(), 1);
        assert_eq!(store.object("media", "a").unwrap().acl, Acl::Private);
    }
}
