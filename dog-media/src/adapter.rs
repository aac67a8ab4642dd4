use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::codec::is_image;
use crate::{
    generate_derivatives, Acl, ConversionPolicy, ImageEditor, IncomingUpload, MediaConfig, MediaError, MediaEvent,
    MediaObject, MediaResult, ObjectStore, PathResolver, PrivacyPolicy, RasterEditor, RemoteLocator, S3ObjectStore,
    StagedImage, StagingSession, UploadIntakeFilter, VisibilityManager,
};

/// The media adapter: what host services embed to offload their library
pub struct MediaAdapter<S: ObjectStore, E: ImageEditor = RasterEditor> {
    store: Arc<S>,
    resolver: Arc<PathResolver>,
    policy: ConversionPolicy,
    intake: UploadIntakeFilter,
    visibility: VisibilityManager<S>,
    events: broadcast::Sender<MediaEvent>,
    config: MediaConfig,
    _editor: PhantomData<fn() -> E>,
}

impl MediaAdapter<S3ObjectStore, RasterEditor> {
    /// Build the shared S3 client and the adapter around it
    pub async fn init(config: MediaConfig) -> MediaResult<Self> {
        let store = S3ObjectStore::connect(&config).await?;
        Self::new(store, config)
    }
}

impl<S: ObjectStore, E: ImageEditor> MediaAdapter<S, E> {
    /// Create an adapter over any object store
    pub fn new(store: S, config: MediaConfig) -> MediaResult<Self> {
        config.validate()?;

        let store = Arc::new(store);
        let resolver = Arc::new(PathResolver::new(&config));
        let policy = ConversionPolicy::new(config.conversion.clone());
        let (events, _) = broadcast::channel(256);
        let visibility = VisibilityManager::new(store.clone(), resolver.clone(), events.clone())
            .with_presign_expiry(config.presign_expiry)
            .with_concurrency(config.acl_concurrency);

        info!(
            "Media adapter ready: uploads at {} served from {}",
            resolver.upload_root(),
            resolver.upload_base_url()
        );

        Ok(Self {
            store,
            resolver,
            intake: UploadIntakeFilter::new(policy.clone()),
            policy,
            visibility,
            events,
            config,
            _editor: PhantomData,
        })
    }

    /// Replace the default record-flag privacy rule
    pub fn with_privacy_policy<P: PrivacyPolicy + 'static>(mut self, policy: P) -> Self {
        self.visibility = self.visibility.with_policy(policy);
        self
    }

    /// Tear the adapter down. Pending event receivers see the channel close.
    pub fn shutdown(self) {
        info!(
            "Media adapter for {} shut down ({} subscriber(s))",
            self.resolver.remote_root(),
            self.events.receiver_count()
        );
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn policy(&self) -> &ConversionPolicy {
        &self.policy
    }

    pub fn visibility(&self) -> &VisibilityManager<S> {
        &self.visibility
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// A fresh staging session wired to this adapter's policy and store
    pub fn staging(&self) -> StagingSession<'_, S> {
        self.session(&self.policy, self.config.default_acl)
    }

    /// Run an upload through the intake filter before storage.
    ///
    /// Never fails: a failed transcode passes the original through.
    pub fn intake(&self, upload: IncomingUpload) -> IncomingUpload {
        let from = upload.mime_type.clone();
        let upload = self.intake.prefilter::<E>(upload);

        if upload.mime_type != from {
            let _ = self.events.send(MediaEvent::Converted {
                name: upload.name.clone(),
                from,
                to: upload.mime_type.clone(),
                at: Utc::now(),
            });
        }
        upload
    }

    /// Sizes follow the primary's stored format: a primary that escaped
    /// conversion keeps its sizes in the same format.
    fn derivative_policy(&self, primary_mime: &str) -> ConversionPolicy {
        if self.policy.should_convert(primary_mime) {
            ConversionPolicy::disabled()
        } else {
            self.policy.clone()
        }
    }

    fn session<'a>(&'a self, policy: &'a ConversionPolicy, acl: Acl) -> StagingSession<'a, S> {
        StagingSession::new(self.store.as_ref(), &self.resolver)
            .with_policy(policy)
            .with_quality(self.policy.quality())
            .with_staging_dir(self.config.staging_dir.clone())
            .with_acl(acl)
    }

    /// First free `subdir/name` in the store, suffixing `-1`, `-2`, ... before
    /// the extension when the plain name is taken.
    async fn unique_target(&self, subdir: &str, name: &str) -> MediaResult<(String, String, RemoteLocator)> {
        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (name, None),
        };

        for attempt in 0u32.. {
            let candidate = match (attempt, extension) {
                (0, _) => name.to_string(),
                (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
                (n, None) => format!("{}-{}", stem, n),
            };
            let relative = if subdir.is_empty() {
                candidate
            } else {
                format!("{}/{}", subdir, candidate)
            };
            let remote = self.resolver.upload_path(&relative);
            let locator = self
                .resolver
                .reverse_local_path_to_locator(&remote)
                .ok_or_else(|| MediaError::invalid(format!("cannot resolve {}", remote)))?;

            if !self.store.exists(&locator).await? {
                if attempt > 0 {
                    debug!("{} taken, storing as {}", name, relative);
                }
                return Ok((relative, remote, locator));
            }
        }
        Err(MediaError::invalid(format!("no free name for {}", name)))
    }

    /// Offload an upload: intake, write the original with the right ACL,
    /// then generate every configured size next to it.
    ///
    /// An upload whose name is already taken in `subdir` is stored under a
    /// suffixed name (`photo-1.png`) rather than replacing the existing file.
    /// Sizes are cut from the decoded upload, before intake transcodes it.
    /// A failed derivative pass removes the original again and surfaces the
    /// error (`SaveFailed` for any size that could not be written), so no
    /// record ever points at a half-converted set.
    #[instrument(skip(self, upload), fields(name = %upload.name))]
    pub async fn store_upload(&self, upload: IncomingUpload, subdir: &str, private: bool) -> MediaResult<MediaObject> {
        let source_mime = upload.mime_type.clone();
        let decoded = if is_image(&source_mime) {
            match E::open(&upload.path) {
                Ok(image) => Some(image),
                Err(err) => {
                    warn!("Could not decode {}, storing without sizes: {}", upload.name, err);
                    None
                }
            }
        } else {
            None
        };

        let upload = self.intake(upload);

        let (relative, remote, locator) = self.unique_target(subdir.trim_matches('/'), &upload.name).await?;

        let acl = Acl::for_private(private, self.config.default_acl);
        let body = Bytes::from(tokio::fs::read(&upload.path).await?);
        let filesize = body.len() as u64;
        self.store
            .write(&locator, body, Some(&upload.mime_type), acl)
            .await
            .map_err(|err| MediaError::save_failed(remote.clone(), err))?;

        let mut media = MediaObject::new(relative, upload.mime_type.clone()).with_private(private);
        media.filesize = filesize;
        media.converted_from = upload.converted_from.clone();

        let Some(image) = decoded else {
            info!("Stored {} ({} bytes)", remote, filesize);
            return Ok(media);
        };
        let original = StagedImage { image, path: remote.clone() };
        let (width, height) = original.dimensions();
        media.width = Some(width);
        media.height = Some(height);

        let policy = self.derivative_policy(&upload.mime_type);
        let mut session = self.session(&policy, acl);
        let generated = generate_derivatives(&mut session, &policy, &original, &source_mime, &self.config.sizes).await;
        session.finish();

        match generated {
            Ok(sizes) => {
                media.sizes = sizes;
                info!("Stored {} with {} size(s)", remote, media.sizes.len());
                Ok(media)
            }
            Err(err) => {
                if let Err(cleanup) = self.store.delete(&locator).await {
                    warn!("Failed to remove {} after a failed upload: {}", remote, cleanup);
                }
                Err(err)
            }
        }
    }

    /// Rebuild the sizes of an existing object from its stored primary file
    #[instrument(skip(self, media), fields(media_id = %media.id))]
    pub async fn regenerate_derivatives(&self, media: &mut MediaObject) -> MediaResult<usize> {
        let acl = Acl::for_private(self.visibility.is_private(media), self.config.default_acl);
        let remote = self.resolver.upload_path(&media.file);
        let policy = self.derivative_policy(&media.mime_type);

        let mut session = self.session(&policy, acl);
        let generated = match session.load::<E>(&remote).await {
            Ok(original) => {
                let (width, height) = original.dimensions();
                media.width = Some(width);
                media.height = Some(height);
                generate_derivatives(&mut session, &policy, &original, &media.mime_type, &self.config.sizes).await
            }
            Err(err) => Err(err),
        };
        let released = session.finish();
        debug!("Released {} staged file(s)", released);

        media.sizes = generated?;
        info!("Regenerated {} size(s) for {}", media.sizes.len(), remote);
        Ok(media.sizes.len())
    }

    /// Public URL of the object or one of its sizes, signed when private.
    ///
    /// An unknown size name falls back to the primary file.
    pub async fn url(&self, media: &MediaObject, size: Option<&str>) -> String {
        let file = match size.and_then(|name| media.size(name)) {
            Some(derivative) => media.sibling(&derivative.file),
            None => media.file.clone(),
        };
        let url = self.resolver.resolve_url(&self.resolver.upload_path(&file));
        self.visibility.sign_url(&url, media).await
    }

    /// `(url, width)` candidates, narrowest first, each signed when private
    pub async fn srcset(&self, media: &MediaObject) -> Vec<(String, u32)> {
        let mut candidates: Vec<(String, u32)> = media
            .sizes
            .iter()
            .map(|size| (media.sibling(&size.file), size.width))
            .collect();
        if let Some(width) = media.width {
            candidates.push((media.file.clone(), width));
        }
        candidates.sort_by_key(|(_, width)| *width);
        candidates.dedup_by_key(|(_, width)| *width);

        let mut srcset = Vec::with_capacity(candidates.len());
        for (file, width) in candidates {
            let url = self.resolver.resolve_url(&self.resolver.upload_path(&file));
            srcset.push((self.visibility.sign_url(&url, media).await, width));
        }
        srcset
    }

    /// Flip an object between public and private.
    ///
    /// The ACL batch runs first; the record's flag is only patched once
    /// every file carries the new ACL.
    #[instrument(skip(self, media), fields(media_id = %media.id))]
    pub async fn set_private(&self, media: &mut MediaObject, private: bool) -> MediaResult<usize> {
        let acl = Acl::for_private(private, self.config.default_acl);
        let updated = self.visibility.set_files_acl(media, acl).await?;
        media.private = private;
        Ok(updated)
    }

    /// Delete every physical file of an object.
    ///
    /// All deletes are attempted; the first failure is reported afterwards.
    #[instrument(skip(self, media), fields(media_id = %media.id))]
    pub async fn delete(&self, media: &MediaObject) -> MediaResult<usize> {
        let files = self.visibility.list_physical_files(media);
        let mut first_error: Option<MediaError> = None;
        let mut deleted = 0;

        for path in &files {
            let Some(locator) = self.resolver.reverse_local_path_to_locator(path) else {
                debug!("Skipping unresolvable file {}", path);
                continue;
            };
            match self.store.delete(&locator).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    warn!("Failed to delete {}: {}", path, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        info!("Deleted {} file(s) of {}", deleted, media.id);
        let _ = self.events.send(MediaEvent::Deleted {
            media_id: media.id.clone(),
            files: deleted,
            at: Utc::now(),
        });
        Ok(deleted)
    }
}
