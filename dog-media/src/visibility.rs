use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{Acl, MediaError, MediaEvent, MediaObject, MediaResult, ObjectStore, PathResolver, RemoteLocator};

/// Decides whether a media object is private
pub trait PrivacyPolicy: Send + Sync {
    fn is_private(&self, media: &MediaObject) -> bool;
}

/// Uses the record's own `private` flag (false unless set)
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFlagPolicy;

impl PrivacyPolicy for RecordFlagPolicy {
    fn is_private(&self, media: &MediaObject) -> bool {
        media.private
    }
}

impl<F> PrivacyPolicy for F
where
    F: Fn(&MediaObject) -> bool + Send + Sync,
{
    fn is_private(&self, media: &MediaObject) -> bool {
        self(media)
    }
}

/// Applies and queries access classification across a media object's files
pub struct VisibilityManager<S: ObjectStore> {
    store: Arc<S>,
    resolver: Arc<PathResolver>,
    policy: Arc<dyn PrivacyPolicy>,
    presign_expiry: Duration,
    concurrency: usize,
    events: broadcast::Sender<MediaEvent>,
}

impl<S: ObjectStore> VisibilityManager<S> {
    pub fn new(store: Arc<S>, resolver: Arc<PathResolver>, events: broadcast::Sender<MediaEvent>) -> Self {
        Self {
            store,
            resolver,
            policy: Arc::new(RecordFlagPolicy),
            presign_expiry: Duration::from_secs(6 * 60 * 60),
            concurrency: 8,
            events,
        }
    }

    pub fn with_policy<P: PrivacyPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn is_private(&self, media: &MediaObject) -> bool {
        self.policy.is_private(media)
    }

    /// Every physical file that must share one ACL: the primary file, each
    /// derivative, the retained original and any legacy backup sizes.
    pub fn list_physical_files(&self, media: &MediaObject) -> Vec<String> {
        let mut relative = vec![media.file.clone()];
        relative.extend(media.sizes.iter().map(|size| media.sibling(&size.file)));
        if let Some(original) = &media.original_image {
            relative.push(media.sibling(original));
        }
        relative.extend(media.backup_sizes.iter().map(|size| media.sibling(&size.file)));

        let mut files: Vec<String> = Vec::with_capacity(relative.len());
        for path in relative {
            let path = self.resolver.upload_path(&path);
            if !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }

    fn locators(&self, media: &MediaObject) -> Vec<RemoteLocator> {
        self.list_physical_files(media)
            .iter()
            .filter_map(|path| {
                let locator = self.resolver.reverse_local_path_to_locator(path);
                if locator.is_none() {
                    debug!("Skipping unresolvable file {}", path);
                }
                locator
            })
            .collect()
    }

    /// Apply `acl` to every resolvable file as one batch.
    ///
    /// Updates are not transactional: on failure some files may already
    /// carry the new ACL. Returns the number of files updated.
    pub async fn set_files_acl(&self, media: &MediaObject, acl: Acl) -> MediaResult<usize> {
        let locators = self.locators(media);
        let results = self.store.set_acl_batch(&locators, acl, self.concurrency).await;

        let failures: Vec<MediaError> = results.into_iter().filter_map(Result::err).collect();
        if let Some(first) = failures.first() {
            let (code, message) = match first {
                MediaError::Remote { code, message } => (code.clone(), message.clone()),
                other => (other.code().to_string(), other.to_string()),
            };
            warn!(
                "ACL update to {} failed for {} of {} file(s) of {}: [{}] {}",
                acl,
                failures.len(),
                locators.len(),
                media.id,
                code,
                message
            );
            return Err(MediaError::AclUpdateFailed {
                code,
                message,
                failed: failures.len(),
            });
        }

        info!("Set {} on {} file(s) of {}", acl, locators.len(), media.id);
        // No receivers is fine.
        let _ = self.events.send(MediaEvent::AclChanged {
            media_id: media.id.clone(),
            acl,
            files: locators.len(),
            at: Utc::now(),
        });
        Ok(locators.len())
    }

    /// ACL currently applied to the primary file
    pub async fn query_acl(&self, media: &MediaObject) -> MediaResult<Acl> {
        let path = self.resolver.upload_path(&media.file);
        let locator = self
            .resolver
            .reverse_local_path_to_locator(&path)
            .ok_or_else(|| MediaError::not_found(path.clone()))?;
        self.store.get_acl(&locator).await
    }

    /// Sign `url` when `media` is private; anything else comes back unchanged
    pub async fn sign_url(&self, url: &str, media: &MediaObject) -> String {
        if !self.is_private(media) {
            return url.to_string();
        }

        let Some(locator) = self.resolver.reverse_url_to_locator(url) else {
            return url.to_string();
        };

        match self.store.presign_get(&locator, self.presign_expiry).await {
            Ok(presigned) => {
                let Some((_, query)) = presigned.split_once('?') else {
                    warn!("Presigned URL for {} carried no query", locator);
                    return url.to_string();
                };
                let base = url.split_once('?').map_or(url, |(base, _)| base);
                format!("{}?{}", base, query)
            }
            Err(err) => {
                warn!("Could not presign {}: {}", locator, err);
                url.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DerivativeDescriptor, MediaConfig, MemoryObjectStore};

    fn derivative(size: &str, file: &str) -> DerivativeDescriptor {
        DerivativeDescriptor {
            size: size.into(),
            file: file.into(),
            width: 10,
            height: 10,
            mime_type: "image/avif".into(),
        }
    }

    fn media() -> MediaObject {
        let mut media = MediaObject::new("2024/05/photo.avif", "image/avif");
        media.sizes = vec![
            derivative("thumbnail", "photo-150x150.avif"),
            derivative("medium", "photo-300x200.avif"),
        ];
        media.original_image = Some("photo-original.avif".into());
        media.backup_sizes = vec![derivative("thumbnail-orig", "photo-150x150.avif")];
        media
    }

    fn manager(store: &MemoryObjectStore) -> (VisibilityManager<MemoryObjectStore>, broadcast::Receiver<MediaEvent>) {
        let config = MediaConfig::new("media").with_content_root("/srv/content");
        let (tx, rx) = broadcast::channel(16);
        let manager = VisibilityManager::new(Arc::new(store.clone()), Arc::new(PathResolver::new(&config)), tx);
        (manager, rx)
    }

    #[test]
    fn test_list_physical_files_order_and_dedupe() {
        let store = MemoryObjectStore::new();
        let (manager, _rx) = manager(&store);
        assert_eq!(
            manager.list_physical_files(&media()),
            vec![
                "s3://media/uploads/2024/05/photo.avif",
                "s3://media/uploads/2024/05/photo-150x150.avif",
                "s3://media/uploads/2024/05/photo-300x200.avif",
                "s3://media/uploads/2024/05/photo-original.avif",
            ]
        );
    }

    #[test]
    fn test_privacy_policy_override() {
        let store = MemoryObjectStore::new();
        let (manager, _rx) = manager(&store);
        assert!(!manager.is_private(&media()));
        assert!(manager.is_private(&media().with_private(true)));

        let manager = manager.with_policy(|m: &MediaObject| m.file.starts_with("2024/"));
        assert!(manager.is_private(&media()));
    }

    #[tokio::test]
    async fn test_sign_url_public_unchanged() {
        let store = MemoryObjectStore::new();
        let (manager, _rx) = manager(&store);
        let url = "https://media.s3.amazonaws.com/uploads/2024/05/photo.avif?ver=2";
        assert_eq!(manager.sign_url(url, &media()).await, url);
    }

    #[tokio::test]
    async fn test_sign_url_replaces_query() {
        let store = MemoryObjectStore::new();
        let (manager, _rx) = manager(&store);
        let manager = manager.with_presign_expiry(Duration::from_secs(600));
        let url = "https://media.s3.amazonaws.com/uploads/2024/05/photo.avif?ver=2";

        let signed = manager.sign_url(url, &media().with_private(true)).await;

        assert_eq!(signed.matches('?').count(), 1);
        assert!(!signed.contains("ver=2"));
        assert!(signed.starts_with("https://media.s3.amazonaws.com/uploads/2024/05/photo.avif?"));
        assert!(signed.contains("X-Amz-Expires=600"));
    }

    #[tokio::test]
    async fn test_sign_url_foreign_fails_open() {
        let store = MemoryObjectStore::new();
        let (manager, _rx) = manager(&store);
        let url = "https://elsewhere.org/photo.avif";
        assert_eq!(manager.sign_url(url, &media().with_private(true)).await, url);
    }
}
