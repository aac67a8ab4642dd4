//! # dog-media: Remote-backed media library offloading
//!
//! `dog-media` keeps a host application's media library in an S3-compatible
//! bucket instead of on local disk. Uploads are transcoded to a modern format
//! on the way in, resized copies are generated next to the original, and each
//! media object can be flipped between public and private with every URL the
//! host renders signed accordingly.
//!
//! ## Key Features
//!
//! - **Path mapping**: local content paths, `s3://` paths and public URLs convert into each other losslessly
//! - **Transparent transcoding**: PNG and JPEG uploads become WebP (or AVIF), and every size follows
//! - **Staged editing**: remote originals are mirrored to temp files for the codec and cleaned up on every exit path
//! - **Per-object visibility**: one ACL across all files of an object, presigned URLs for private ones
//! - **Storage agnostic**: S3 through the AWS SDK, or any [`ObjectStore`] implementation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_media::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> MediaResult<()> {
//! let adapter = MediaAdapter::init(MediaConfig::from_env()?).await?;
//!
//! let upload = IncomingUpload::new("/tmp/upload-1234", "photo.png", "image/png", 48_213);
//! let mut media = adapter.store_upload(upload, "2024/05", false).await?;
//!
//! // `photo.webp` plus its sizes, all public
//! let url = adapter.url(&media, Some("thumbnail")).await;
//!
//! // Every file goes private in one batch; URLs come back presigned
//! adapter.set_private(&mut media, true).await?;
//! let signed = adapter.url(&media, None).await;
//! # let _ = (url, signed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │   Your Service    │  ← Keeps MediaObject records
//! ├───────────────────┤
//! │   MediaAdapter    │  ← Intake, sizes, visibility, URLs
//! ├───────────────────┤
//! │ Staging / Policy  │  ← Temp files, naming, transcoding
//! ├───────────────────┤
//! │   ObjectStore     │  ← Storage primitives
//! └───────────────────┘
//! ```

pub mod adapter;
pub mod codec;
mod config;
mod convert;
mod error;
mod memory_store;
mod paths;
mod s3_store;
mod staging;
pub mod store;
mod types;
mod visibility;

// Re-export main types for clean API
pub use adapter::MediaAdapter;
pub use codec::{ImageEditor, RasterEditor};
pub use config::{ConversionRules, MediaConfig, SizeSpec, StaticCredentials, TargetFormat};
pub use convert::{derivative_filename, generate_derivatives, ConversionPolicy, UploadIntakeFilter};
pub use error::{MediaError, MediaResult};
pub use memory_store::{MemoryObjectStore, StoredObject};
pub use paths::{PathResolver, RemoteLocator, SCHEME};
pub use s3_store::S3ObjectStore;
pub use staging::{SavedFile, StagedImage, StagingSession};
pub use store::ObjectStore;
pub use types::{Acl, DerivativeDescriptor, IncomingUpload, MediaEvent, MediaId, MediaObject};
pub use visibility::{PrivacyPolicy, RecordFlagPolicy, VisibilityManager};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Acl, IncomingUpload, MediaAdapter, MediaConfig, MediaError, MediaEvent, MediaObject, MediaResult,
        ObjectStore, PrivacyPolicy,
    };
}
