//! Format conversion policy.
//!
//! One naming rule applies everywhere a filename is derived for an asset:
//! the last extension of the basename is replaced by the target's
//! extension (`photo.png` becomes `photo.avif`). Primary saves, intake and
//! the derivative pass all go through [`ConversionPolicy::apply`].

use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::codec::fit_dimensions;
use crate::{
    ConversionRules, DerivativeDescriptor, ImageEditor, IncomingUpload, MediaError, MediaResult, ObjectStore, SizeSpec,
    StagedImage, StagingSession,
};

/// Source formats eligible for transcoding
const CONVERTIBLE: [&str; 3] = ["image/png", "image/jpeg", "image/jpg"];

/// Decides whether an image is transcoded and keeps every representation consistent
#[derive(Debug, Clone)]
pub struct ConversionPolicy {
    rules: ConversionRules,
}

impl ConversionPolicy {
    pub fn new(rules: ConversionRules) -> Self {
        Self { rules }
    }

    /// A policy that never converts
    pub fn disabled() -> Self {
        Self::new(ConversionRules {
            enabled: false,
            ..ConversionRules::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.rules.enabled
    }

    pub fn quality(&self) -> u8 {
        self.rules.quality
    }

    pub fn target_mime(&self) -> &'static str {
        self.rules.target.mime_type()
    }

    /// True exactly for PNG, JPEG and the legacy `image/jpg` alias
    pub fn should_convert(&self, mime_type: &str) -> bool {
        self.rules.enabled && CONVERTIBLE.contains(&mime_type.to_ascii_lowercase().as_str())
    }

    /// MIME type a file of `mime_type` ends up with
    pub fn output_mime(&self, mime_type: &str) -> String {
        if self.should_convert(mime_type) {
            self.target_mime().to_string()
        } else {
            mime_type.to_string()
        }
    }

    /// Replace the basename's last extension with the target extension.
    ///
    /// Works on bare names and full paths alike; directories are untouched.
    pub fn target_filename(&self, filename: &str) -> String {
        let (dir, name) = match filename.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, filename),
        };
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let renamed = format!("{}.{}", stem, self.rules.target.extension());
        match dir {
            Some(dir) => format!("{}/{}", dir, renamed),
            None => renamed,
        }
    }

    /// Rewrite a filename and MIME type when the source format converts
    pub fn apply(&self, filename: &str, mime_type: &str) -> (String, String) {
        if self.should_convert(mime_type) {
            (self.target_filename(filename), self.target_mime().to_string())
        } else {
            (filename.to_string(), mime_type.to_string())
        }
    }

    /// Encode an in-memory image in the target format
    pub fn convert_image<E: ImageEditor>(&self, image: &E, quality: Option<u8>) -> MediaResult<Vec<u8>> {
        image.encode(self.target_mime(), quality.unwrap_or(self.rules.quality))
    }

    /// Bring every derivative record in line with the naming rule
    pub fn rewrite_derivatives(&self, sizes: &mut [DerivativeDescriptor]) {
        for size in sizes.iter_mut() {
            let (file, mime_type) = self.apply(&size.file, &size.mime_type);
            size.file = file;
            size.mime_type = mime_type;
        }
    }
}

/// `photo.png` at 150x150 is `photo-150x150.png`
pub fn derivative_filename(basename: &str, width: u32, height: u32) -> String {
    match basename.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}x{}.{}", stem, width, height, ext),
        None => format!("{}-{}x{}", basename, width, height),
    }
}

/// Generate every configured size of `original` next to it.
///
/// When the policy converts `source_mime`, the whole pass encodes straight
/// into the target format. Sizes that would not shrink the original are
/// skipped. Any failed save fails the pass with `SaveFailed`, codec failures
/// included. Sizes this pass created are removed again; files that were
/// already there (a regeneration overwriting live sizes) are left in place.
pub async fn generate_derivatives<S: ObjectStore, E: ImageEditor>(
    session: &mut StagingSession<'_, S>,
    policy: &ConversionPolicy,
    original: &StagedImage<E>,
    source_mime: &str,
    sizes: &[SizeSpec],
) -> MediaResult<Vec<DerivativeDescriptor>> {
    let (width, height) = original.dimensions();
    let output_mime = policy.output_mime(source_mime);
    let dir = original.dir().to_string();
    let basename = original.basename().to_string();

    let mut generated: Vec<DerivativeDescriptor> = Vec::with_capacity(sizes.len());
    let mut created: Vec<String> = Vec::with_capacity(sizes.len());
    for size in sizes {
        let Some((w, h)) = fit_dimensions(width, height, size.max_width, size.max_height, size.crop) else {
            debug!("Skipping size {} for {}", size.name, original.path);
            continue;
        };

        let (name, mime_type) = policy.apply(&derivative_filename(&basename, w, h), source_mime);
        debug_assert_eq!(mime_type, output_mime);

        let destination = if dir.is_empty() { name } else { format!("{}/{}", dir, name) };
        // Unknown counts as existing: never discard what may be live.
        let existed = session.exists(&destination).await.unwrap_or(true);
        let saved = match original.image.resize(w, h, size.crop) {
            Ok(resized) => session.save(&resized, &destination, &mime_type).await,
            Err(err) => Err(err),
        };
        let saved = match saved {
            Ok(saved) => saved,
            Err(err) => {
                for done in &created {
                    session.discard(done).await;
                }
                return Err(match err {
                    MediaError::ConversionFailed { format, reason } => {
                        MediaError::save_failed(destination, format!("conversion to {} failed: {}", format, reason))
                    }
                    other => other,
                });
            }
        };
        if !existed {
            created.push(saved.path.clone());
        }

        generated.push(DerivativeDescriptor {
            size: size.name.clone(),
            file: saved.filename,
            width: saved.width,
            height: saved.height,
            mime_type: saved.mime_type,
        });
    }

    policy.rewrite_derivatives(&mut generated);
    Ok(generated)
}

/// Transcodes uploads before they reach storage.
///
/// A failed transcode never blocks an upload: the original is passed on
/// untouched.
#[derive(Debug, Clone)]
pub struct UploadIntakeFilter {
    policy: ConversionPolicy,
}

impl UploadIntakeFilter {
    pub fn new(policy: ConversionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ConversionPolicy {
        &self.policy
    }

    pub fn prefilter<E: ImageEditor>(&self, upload: IncomingUpload) -> IncomingUpload {
        if !self.policy.should_convert(&upload.mime_type) {
            return upload;
        }

        match self.transcode::<E>(&upload) {
            Ok(converted) => {
                info!(
                    "Converted upload {} from {} to {} ({} -> {} bytes)",
                    upload.name, upload.mime_type, converted.mime_type, upload.size, converted.size
                );
                converted
            }
            Err(err) => {
                warn!("Keeping original upload {}: {}", upload.name, err);
                upload
            }
        }
    }

    fn transcode<E: ImageEditor>(&self, upload: &IncomingUpload) -> MediaResult<IncomingUpload> {
        let image = E::open(&upload.path)?;
        let encoded = self.policy.convert_image(&image, None)?;

        // Replace the uploaded file in one rename so a failure leaves it intact.
        let dir = match upload.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp = tempfile::Builder::new().prefix(".dog-media-").tempfile_in(dir)?;
        temp.write_all(&encoded)?;
        temp.flush()?;
        temp.persist(&upload.path).map_err(|err| err.error)?;

        let (name, mime_type) = self.policy.apply(&upload.name, &upload.mime_type);
        Ok(IncomingUpload {
            path: upload.path.clone(),
            name,
            mime_type,
            size: encoded.len() as u64,
            converted_from: Some(upload.mime_type.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RasterEditor, TargetFormat};
    use image::{DynamicImage, ImageFormat, RgbImage};

    fn policy() -> ConversionPolicy {
        ConversionPolicy::new(ConversionRules {
            target: TargetFormat::Avif,
            ..ConversionRules::default()
        })
    }

    #[test]
    fn test_should_convert_allow_list() {
        let policy = policy();
        for mime in ["image/png", "image/jpeg", "image/jpg", "IMAGE/PNG"] {
            assert!(policy.should_convert(mime), "{}", mime);
        }
        for mime in ["image/avif", "image/webp", "image/gif", "application/pdf", ""] {
            assert!(!policy.should_convert(mime), "{}", mime);
        }
        assert!(!ConversionPolicy::disabled().should_convert("image/png"));
    }

    #[test]
    fn test_target_itself_is_not_converted() {
        let webp = ConversionPolicy::new(ConversionRules {
            target: TargetFormat::WebP,
            ..ConversionRules::default()
        });
        assert!(!webp.should_convert("image/webp"));
        assert_eq!(webp.apply("photo.png", "image/png"), ("photo.webp".to_string(), "image/webp".to_string()));
    }

    #[test]
    fn test_apply_replaces_last_extension() {
        let policy = policy();
        assert_eq!(policy.apply("photo.png", "image/png"), ("photo.avif".to_string(), "image/avif".to_string()));
        assert_eq!(policy.apply("my.photo.jpeg", "image/jpeg").0, "my.photo.avif");
        assert_eq!(policy.apply("noext", "image/jpg").0, "noext.avif");
        assert_eq!(
            policy.apply("s3://media/uploads/v1.2/photo.png", "image/png").0,
            "s3://media/uploads/v1.2/photo.avif"
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let policy = policy();
        let (name, mime) = policy.apply("photo.png", "image/png");
        assert_eq!(policy.apply(&name, &mime), (name.clone(), mime.clone()));
    }

    #[test]
    fn test_apply_leaves_other_types() {
        let policy = policy();
        assert_eq!(
            policy.apply("doc.pdf", "application/pdf"),
            ("doc.pdf".to_string(), "application/pdf".to_string())
        );
    }

    #[test]
    fn test_rewrite_derivatives() {
        let policy = policy();
        let mut sizes = vec![
            DerivativeDescriptor {
                size: "thumbnail".into(),
                file: "photo-150x150.png".into(),
                width: 150,
                height: 150,
                mime_type: "image/png".into(),
            },
            DerivativeDescriptor {
                size: "medium".into(),
                file: "photo-300x200.avif".into(),
                width: 300,
                height: 200,
                mime_type: "image/avif".into(),
            },
        ];
        policy.rewrite_derivatives(&mut sizes);
        assert!(sizes.iter().all(|d| d.mime_type == "image/avif" && d.file.ends_with(".avif")));
        assert_eq!(sizes[0].file, "photo-150x150.avif");
    }

    #[test]
    fn test_derivative_filename() {
        assert_eq!(derivative_filename("photo.png", 150, 100), "photo-150x100.png");
        assert_eq!(derivative_filename("photo", 150, 100), "photo-150x100");
    }

    #[test]
    fn test_prefilter_transcodes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let filter = UploadIntakeFilter::new(ConversionPolicy::new(ConversionRules::default()));

        let upload = filter.prefilter::<RasterEditor>(IncomingUpload::new(path.clone(), "icon.png", "image/png", 10));

        assert_eq!(upload.name, "icon.webp");
        assert_eq!(upload.mime_type, "image/webp");
        assert_eq!(upload.converted_from.as_deref(), Some("image/png"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(upload.size, bytes.len() as u64);
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::WebP);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_prefilter_keeps_undecodable_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"not really a png").unwrap();

        let upload = policy_filter().prefilter::<RasterEditor>(IncomingUpload::new(path.clone(), "a.png", "image/png", 16));

        assert_eq!(upload.name, "a.png");
        assert_eq!(upload.mime_type, "image/png");
        assert!(upload.converted_from.is_none());
        assert_eq!(std::fs::read(&path).unwrap(), b"not really a png");
    }

    fn policy_filter() -> UploadIntakeFilter {
        UploadIntakeFilter::new(policy())
    }
}
