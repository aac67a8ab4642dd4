//! Local staging of remote images.
//!
//! The codec needs random-access local files; the object store only offers
//! whole-object reads and writes. A [`StagingSession`] mirrors remote
//! objects into temp files for loading, and routes saves through a local
//! temp before copying them to their destination. Every temp file the
//! session creates is removed when the session ends, on every exit path.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

use crate::{Acl, ConversionPolicy, ImageEditor, MediaError, MediaResult, ObjectStore, PathResolver};

/// An image loaded through a staging session
#[derive(Debug)]
pub struct StagedImage<E> {
    pub image: E,
    /// Logical path the image was loaded from (remote or local)
    pub path: String,
}

impl<E: ImageEditor> StagedImage<E> {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Directory part of the logical path
    pub fn dir(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    /// Basename of the logical path
    pub fn basename(&self) -> &str {
        self.path.rsplit_once('/').map_or(self.path.as_str(), |(_, name)| name)
    }
}

/// Result of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Final logical destination
    pub path: String,
    /// Basename of `path`
    pub filename: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
}

/// One load/transform/save cycle against remote or local images
pub struct StagingSession<'a, S: ObjectStore> {
    store: &'a S,
    resolver: &'a PathResolver,
    policy: Option<&'a ConversionPolicy>,
    staging_dir: Option<PathBuf>,
    quality: u8,
    acl: Acl,
    staged: HashMap<String, TempPath>,
}

fn extension_of(path: &str) -> &str {
    let name = path.rsplit_once('/').map_or(path, |(_, name)| name);
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

impl<'a, S: ObjectStore> StagingSession<'a, S> {
    pub fn new(store: &'a S, resolver: &'a PathResolver) -> Self {
        Self {
            store,
            resolver,
            policy: None,
            staging_dir: None,
            quality: 85,
            acl: Acl::PublicRead,
            staged: HashMap::new(),
        }
    }

    /// Run every save through `policy` before its format is resolved
    pub fn with_policy(mut self, policy: &'a ConversionPolicy) -> Self {
        self.quality = policy.quality();
        self.policy = Some(policy);
        self
    }

    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// ACL given to remote files written by this session
    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    /// Number of temp files currently held
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    fn temp_file(&self, extension: &str) -> MediaResult<NamedTempFile> {
        let suffix = if extension.is_empty() {
            String::new()
        } else {
            format!(".{}", extension)
        };
        let mut builder = tempfile::Builder::new();
        builder.prefix("dog-media-").suffix(&suffix);
        let file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    /// Load an image, staging it locally first when it lives in the store.
    ///
    /// Anything else must be a local file: URLs outside the store are
    /// `NotFound`, the codec only opens paths on disk.
    pub async fn load<E: ImageEditor>(&mut self, path: &str) -> MediaResult<StagedImage<E>> {
        if !self.resolver.is_managed(path) {
            if path.starts_with("http://") || path.starts_with("https://") {
                return Err(MediaError::not_found(path));
            }

            let image = E::open(Path::new(path))?;
            return Ok(StagedImage {
                image,
                path: path.to_string(),
            });
        }

        let locator = self
            .resolver
            .reverse_local_path_to_locator(path)
            .ok_or_else(|| MediaError::not_found(path))?;
        if !self.store.exists(&locator).await? {
            return Err(MediaError::not_found(path));
        }

        let body = self.store.read(&locator).await?;
        let mut temp = self.temp_file(extension_of(path))?;
        temp.write_all(&body)?;
        temp.flush()?;

        let temp = temp.into_temp_path();
        let local = temp.to_path_buf();
        debug!("Staged {} at {}", path, local.display());

        // Replacing an earlier copy of the same file drops (and removes) it.
        self.staged.insert(path.to_string(), temp);

        let image = E::open(&local)?;
        Ok(StagedImage {
            image,
            path: path.to_string(),
        })
    }

    /// Encode `image` and write it to `destination`.
    ///
    /// The attached conversion policy, if any, may rewrite the filename and
    /// MIME type first. Remote destinations are written from a local temp
    /// that is removed whether or not the copy succeeds.
    pub async fn save<E: ImageEditor>(
        &mut self,
        image: &E,
        destination: &str,
        mime_type: &str,
    ) -> MediaResult<SavedFile> {
        let (destination, mime_type) = match self.policy {
            Some(policy) => policy.apply(destination, mime_type),
            None => (destination.to_string(), mime_type.to_string()),
        };
        let (width, height) = image.dimensions();

        let filesize = if self.resolver.is_managed(&destination) {
            self.save_remote(image, &destination, &mime_type).await?
        } else {
            self.save_local(image, &destination, &mime_type)?
        };

        let filename = destination
            .rsplit_once('/')
            .map_or(destination.as_str(), |(_, name)| name)
            .to_string();

        Ok(SavedFile {
            path: destination,
            filename,
            mime_type,
            width,
            height,
            filesize,
        })
    }

    async fn save_remote<E: ImageEditor>(&self, image: &E, destination: &str, mime_type: &str) -> MediaResult<u64> {
        let locator = self
            .resolver
            .reverse_local_path_to_locator(destination)
            .ok_or_else(|| MediaError::invalid(format!("cannot resolve {}", destination)))?;

        let temp = self.temp_file(extension_of(destination))?.into_temp_path();
        image.save(&temp, mime_type, self.quality)?;

        let body = Bytes::from(tokio::fs::read(&temp).await?);
        let filesize = body.len() as u64;
        let written = self.store.write(&locator, body, Some(mime_type), self.acl).await;

        if let Err(err) = temp.close() {
            warn!("Failed to remove staging file: {}", err);
        }

        written.map_err(|err| MediaError::save_failed(destination, err))?;
        debug!("Saved {} ({} bytes)", destination, filesize);
        Ok(filesize)
    }

    fn save_local<E: ImageEditor>(&self, image: &E, destination: &str, mime_type: &str) -> MediaResult<u64> {
        let target = Path::new(destination);
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(".dog-media-")
            .tempfile_in(dir)
            .map_err(|err| MediaError::save_failed(destination, err))?
            .into_temp_path();
        image.save(&temp, mime_type, self.quality)?;

        let filesize = std::fs::metadata(&temp)?.len();
        temp.persist(target)
            .map_err(|err| MediaError::save_failed(destination, err.error))?;
        Ok(filesize)
    }

    /// Whether something already lives at `path`, remote or local
    pub async fn exists(&self, path: &str) -> MediaResult<bool> {
        match self.resolver.reverse_local_path_to_locator(path) {
            Some(locator) if self.resolver.is_managed(path) => self.store.exists(&locator).await,
            _ => Ok(tokio::fs::try_exists(path).await?),
        }
    }

    /// Best-effort removal of a file this session wrote
    pub async fn discard(&self, path: &str) {
        let result = match self.resolver.reverse_local_path_to_locator(path) {
            Some(locator) if self.resolver.is_managed(path) => self.store.delete(&locator).await,
            _ => tokio::fs::remove_file(path).await.map_err(MediaError::from),
        };
        if let Err(err) = result {
            warn!("Failed to discard {}: {}", path, err);
        }
    }

    /// Drop the staged copy of `path`, if any
    pub fn release(&mut self, path: &str) -> bool {
        self.staged.remove(path).is_some()
    }

    /// End the session, removing every staged file. Returns how many were held.
    pub fn finish(mut self) -> usize {
        self.release_all()
    }

    fn release_all(&mut self) -> usize {
        let count = self.staged.len();
        for (path, temp) in self.staged.drain() {
            if let Err(err) = temp.close() {
                warn!("Failed to remove staging file for {}: {}", path, err);
            }
        }
        count
    }
}

impl<S: ObjectStore> Drop for StagingSession<'_, S> {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            debug!("Released {} staging file(s)", released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MediaConfig, MemoryObjectStore, RasterEditor};
    use image::{DynamicImage, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        RasterEditor::from_image(DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200]))))
            .encode("image/png", 85)
            .unwrap()
    }

    fn setup() -> (MemoryObjectStore, PathResolver, tempfile::TempDir) {
        let store = MemoryObjectStore::new();
        let resolver = PathResolver::new(&MediaConfig::new("media").with_content_root("/srv/content"));
        (store, resolver, tempfile::tempdir().unwrap())
    }

    fn dir_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_load_remote_stages_and_cleans_up() {
        let (store, resolver, scratch) = setup();
        store.insert("media", "uploads/a.png", png_bytes(8, 6), Some("image/png"), Acl::PublicRead);

        let mut session = StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));
        let staged: StagedImage<RasterEditor> = session.load("s3://media/uploads/a.png").await.unwrap();

        assert_eq!(staged.dimensions(), (8, 6));
        assert_eq!(staged.path, "s3://media/uploads/a.png");
        assert_eq!(staged.basename(), "a.png");
        assert_eq!(session.staged_count(), 1);
        assert_eq!(dir_entries(scratch.path()), 1);

        assert_eq!(session.finish(), 1);
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_restaging_same_file_keeps_one_temp() {
        let (store, resolver, scratch) = setup();
        store.insert("media", "uploads/a.png", png_bytes(8, 6), Some("image/png"), Acl::PublicRead);

        let mut session = StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));
        let _first: StagedImage<RasterEditor> = session.load("s3://media/uploads/a.png").await.unwrap();
        let _second: StagedImage<RasterEditor> = session.load("s3://media/uploads/a.png").await.unwrap();

        assert_eq!(session.staged_count(), 1);
        assert_eq!(dir_entries(scratch.path()), 1);
    }

    #[tokio::test]
    async fn test_load_missing_remote_is_not_found() {
        let (store, resolver, scratch) = setup();
        let mut session = StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));

        let err = session
            .load::<RasterEditor>("s3://media/uploads/missing.png")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_load_local_passes_through() {
        let (store, resolver, scratch) = setup();
        let local = scratch.path().join("local.png");
        std::fs::write(&local, png_bytes(4, 4)).unwrap();

        let mut session = StagingSession::new(&store, &resolver);
        let staged: StagedImage<RasterEditor> = session.load(local.to_str().unwrap()).await.unwrap();

        assert_eq!(staged.dimensions(), (4, 4));
        assert_eq!(session.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_load_foreign_url_is_not_found() {
        let (store, resolver, scratch) = setup();
        let mut session = StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));

        for url in ["https://cdn.example.com/a.png", "http://other.example.com/uploads/a.png"] {
            let err = session.load::<RasterEditor>(url).await.unwrap_err();
            assert!(err.is_not_found(), "{} gave {}", url, err);
        }
        assert_eq!(session.staged_count(), 0);
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_exists_checks_store_and_disk() {
        let (store, resolver, scratch) = setup();
        store.insert("media", "uploads/a.png", png_bytes(2, 2), Some("image/png"), Acl::PublicRead);
        let local = scratch.path().join("b.png");
        std::fs::write(&local, png_bytes(2, 2)).unwrap();

        let session = StagingSession::new(&store, &resolver);
        assert!(session.exists("s3://media/uploads/a.png").await.unwrap());
        assert!(!session.exists("s3://media/uploads/b.png").await.unwrap());
        assert!(session.exists(local.to_str().unwrap()).await.unwrap());
        assert!(!session.exists(scratch.path().join("c.png").to_str().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_staged_files() {
        let (store, resolver, scratch) = setup();
        store.insert("media", "uploads/a.png", png_bytes(8, 6), Some("image/png"), Acl::PublicRead);

        {
            let mut session =
                StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));
            let _staged: StagedImage<RasterEditor> = session.load("s3://media/uploads/a.png").await.unwrap();
            assert_eq!(dir_entries(scratch.path()), 1);
        }
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_save_remote_writes_with_acl() {
        let (store, resolver, scratch) = setup();
        let image = RasterEditor::from_image(DynamicImage::ImageRgb8(RgbImage::new(6, 4)));

        let mut session = StagingSession::new(&store, &resolver)
            .with_staging_dir(Some(scratch.path().to_path_buf()))
            .with_acl(Acl::Private);
        let saved = session.save(&image, "s3://media/uploads/out.png", "image/png").await.unwrap();

        assert_eq!(saved.filename, "out.png");
        assert_eq!((saved.width, saved.height), (6, 4));
        let stored = store.object("media", "uploads/out.png").unwrap();
        assert_eq!(stored.acl, Acl::Private);
        assert_eq!(stored.content_type.as_deref(), Some("image/png"));
        assert_eq!(stored.body.len() as u64, saved.filesize);
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_failed_remote_copy_is_save_failed() {
        let (store, resolver, scratch) = setup();
        store.fail_writes(true);
        let image = RasterEditor::from_image(DynamicImage::ImageRgb8(RgbImage::new(6, 4)));

        let mut session = StagingSession::new(&store, &resolver).with_staging_dir(Some(scratch.path().to_path_buf()));
        let err = session
            .save(&image, "s3://media/uploads/out.png", "image/png")
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::SaveFailed { .. }));
        assert!(store.object("media", "uploads/out.png").is_none());
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_save_local_is_atomic_rename() {
        let (store, resolver, scratch) = setup();
        let image = RasterEditor::from_image(DynamicImage::ImageRgb8(RgbImage::new(6, 4)));
        let destination = scratch.path().join("out.png");

        let mut session = StagingSession::new(&store, &resolver);
        let saved = session
            .save(&image, destination.to_str().unwrap(), "image/png")
            .await
            .unwrap();

        assert!(destination.exists());
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), saved.filesize);
        assert_eq!(dir_entries(scratch.path()), 1);
    }
}
