use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::{Acl, MediaResult, RemoteLocator};

/// Filesystem-like primitives over the object store.
///
/// Implementations must make `write` atomic: when it returns an error the
/// destination is left exactly as it was.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists at `locator`
    async fn exists(&self, locator: &RemoteLocator) -> MediaResult<bool>;

    /// Read a whole object
    async fn read(&self, locator: &RemoteLocator) -> MediaResult<Bytes>;

    /// Write a whole object with the given ACL
    async fn write(
        &self,
        locator: &RemoteLocator,
        body: Bytes,
        content_type: Option<&str>,
        acl: Acl,
    ) -> MediaResult<()>;

    /// Server-side copy, keeping the source ACL
    async fn copy(&self, from: &RemoteLocator, to: &RemoteLocator) -> MediaResult<()>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, locator: &RemoteLocator) -> MediaResult<()>;

    /// Keys in `bucket` starting with `prefix`
    async fn list(&self, bucket: &str, prefix: &str) -> MediaResult<Vec<String>>;

    /// Current ACL classification of an object
    async fn get_acl(&self, locator: &RemoteLocator) -> MediaResult<Acl>;

    /// Apply an ACL to one object
    async fn set_acl(&self, locator: &RemoteLocator, acl: Acl) -> MediaResult<()>;

    /// Apply an ACL to many objects as one pooled batch.
    ///
    /// Returns one result per locator in input order. The default runs up
    /// to `concurrency` updates at a time.
    async fn set_acl_batch(
        &self,
        locators: &[RemoteLocator],
        acl: Acl,
        concurrency: usize,
    ) -> Vec<MediaResult<()>> {
        let pending: Vec<_> = locators
            .iter()
            .enumerate()
            .map(|(index, locator)| async move { (index, self.set_acl(locator, acl).await) })
            .collect();
        let mut results: Vec<(usize, MediaResult<()>)> = futures::stream::iter(pending)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Presigned GET URL for an object
    async fn presign_get(&self, locator: &RemoteLocator, expires_in: Duration) -> MediaResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keeps the default batch and tracks how many updates run at once
    struct Pooled {
        inner: MemoryObjectStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for Pooled {
        async fn exists(&self, locator: &RemoteLocator) -> MediaResult<bool> {
            self.inner.exists(locator).await
        }

        async fn read(&self, locator: &RemoteLocator) -> MediaResult<Bytes> {
            self.inner.read(locator).await
        }

        async fn write(&self, locator: &RemoteLocator, body: Bytes, content_type: Option<&str>, acl: Acl) -> MediaResult<()> {
            self.inner.write(locator, body, content_type, acl).await
        }

        async fn copy(&self, from: &RemoteLocator, to: &RemoteLocator) -> MediaResult<()> {
            self.inner.copy(from, to).await
        }

        async fn delete(&self, locator: &RemoteLocator) -> MediaResult<()> {
            self.inner.delete(locator).await
        }

        async fn list(&self, bucket: &str, prefix: &str) -> MediaResult<Vec<String>> {
            self.inner.list(bucket, prefix).await
        }

        async fn get_acl(&self, locator: &RemoteLocator) -> MediaResult<Acl> {
            self.inner.get_acl(locator).await
        }

        async fn set_acl(&self, locator: &RemoteLocator, acl: Acl) -> MediaResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let result = self.inner.set_acl(locator, acl).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn presign_get(&self, locator: &RemoteLocator, expires_in: Duration) -> MediaResult<String> {
            self.inner.presign_get(locator, expires_in).await
        }
    }

    #[tokio::test]
    async fn test_default_batch_keeps_order_and_bounds_concurrency() {
        let inner = MemoryObjectStore::new();
        let mut locators = Vec::new();
        for i in 0..6 {
            let key = format!("uploads/{}.png", i);
            inner.insert("media", &key, vec![0u8], None, Acl::PublicRead);
            locators.push(RemoteLocator::new("media", key));
        }
        inner.fail_acl_for("uploads/4.png");
        locators.push(RemoteLocator::new("media", "uploads/missing.png"));

        let store = Pooled {
            inner: inner.clone(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let results = store.set_acl_batch(&locators, Acl::Private, 2).await;

        assert_eq!(results.len(), 7);
        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.is_err())
            .map(|(index, _)| index)
            .collect();
        assert_eq!(failed, vec![4, 6]);
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(inner.object("media", "uploads/0.png").unwrap().acl, Acl::Private);
        assert_eq!(inner.acl_batches(), 0);
    }
}
