use std::io::Cursor;
use std::path::Path;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::{MediaError, MediaResult};

/// Narrow load / transform / encode interface over an image codec.
///
/// Every method works on local files or memory; remote paths are handled
/// by [`StagingSession`](crate::StagingSession), which wraps any editor.
pub trait ImageEditor: Sized + Send + Sync {
    /// Decode an image from a local file
    fn open(path: &Path) -> MediaResult<Self>;

    fn dimensions(&self) -> (u32, u32);

    /// Resized copy. With `crop` the result is exactly `width` x `height`.
    fn resize(&self, width: u32, height: u32, crop: bool) -> MediaResult<Self>;

    /// Encode into `mime_type`
    fn encode(&self, mime_type: &str, quality: u8) -> MediaResult<Vec<u8>>;

    /// Encode into `mime_type` and write to a local file
    fn save(&self, path: &Path, mime_type: &str, quality: u8) -> MediaResult<()> {
        let encoded = self.encode(mime_type, quality)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }
}

/// [`ImageEditor`] on the `image` crate
#[derive(Debug, Clone)]
pub struct RasterEditor {
    image: DynamicImage,
}

impl RasterEditor {
    pub fn from_image(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }
}

impl ImageEditor for RasterEditor {
    fn open(path: &Path) -> MediaResult<Self> {
        let reader = image::ImageReader::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => MediaError::not_found(path.display().to_string()),
            _ => MediaError::from(err),
        })?;
        let image = reader
            .with_guessed_format()?
            .decode()
            .map_err(|err| MediaError::conversion_failed("decode", err))?;
        Ok(Self { image })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    fn resize(&self, width: u32, height: u32, crop: bool) -> MediaResult<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::invalid(format!("cannot resize to {}x{}", width, height)));
        }
        let image = if crop {
            self.image.resize_to_fill(width, height, FilterType::Lanczos3)
        } else {
            self.image.resize_exact(width, height, FilterType::Lanczos3)
        };
        Ok(Self { image })
    }

    fn encode(&self, mime_type: &str, quality: u8) -> MediaResult<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        let written = match mime_type {
            "image/png" => self.image.write_to(&mut buf, ImageFormat::Png),
            "image/gif" => self.image.write_to(&mut buf, ImageFormat::Gif),
            "image/jpeg" | "image/jpg" => {
                let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
                DynamicImage::ImageRgb8(self.image.to_rgb8()).write_with_encoder(encoder)
            }
            "image/avif" => {
                let encoder = AvifEncoder::new_with_speed_quality(&mut buf, 8, quality);
                DynamicImage::ImageRgba8(self.image.to_rgba8()).write_with_encoder(encoder)
            }
            "image/webp" => {
                let encoder = WebPEncoder::new_lossless(&mut buf);
                DynamicImage::ImageRgba8(self.image.to_rgba8()).write_with_encoder(encoder)
            }
            other => return Err(MediaError::conversion_failed(other, "unsupported output format")),
        };
        written.map_err(|err| MediaError::conversion_failed(mime_type, err))?;
        Ok(buf.into_inner())
    }
}

/// Canonical file extension for a MIME type
pub fn extension_for(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/avif" => Some("avif"),
        _ => None,
    }
}

/// MIME type guessed from a filename's extension
pub fn mime_for_filename(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" | "jpe" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

pub fn is_image(mime_type: &str) -> bool {
    extension_for(mime_type).is_some()
}

/// Dimensions of a derivative that fits `max_width` x `max_height`.
///
/// A bound of 0 is unbounded. Never upscales; `None` when the result
/// would match the original.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32, crop: bool) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (max_width == 0 && max_height == 0) {
        return None;
    }

    let fitted = if crop {
        let w = if max_width == 0 { width } else { max_width.min(width) };
        let h = if max_height == 0 { height } else { max_height.min(height) };
        (w, h)
    } else {
        let ratio_w = if max_width == 0 { f64::INFINITY } else { max_width as f64 / width as f64 };
        let ratio_h = if max_height == 0 { f64::INFINITY } else { max_height as f64 / height as f64 };
        let ratio = ratio_w.min(ratio_h).min(1.0);
        (
            ((width as f64 * ratio).round() as u32).max(1),
            ((height as f64 * ratio).round() as u32).max(1),
        )
    };

    if fitted == (width, height) {
        None
    } else {
        Some(fitted)
    }
}
