use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Acl, MediaError, MediaResult};

/// Configuration for the media pipeline.
///
/// There is no proxy setting: the S3 client built by
/// [`S3ObjectStore::connect`](crate::S3ObjectStore::connect) uses the SDK's
/// default HTTP client. Hosts behind a proxy build their own
/// `aws_sdk_s3::Client` with a proxied HTTP client and hand it to
/// [`S3ObjectStore::from_client`](crate::S3ObjectStore::from_client).
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Bucket, optionally with a key prefix (`bucket/prefix`)
    pub bucket: String,

    /// Public base URL for the bucket (CDN or custom domain).
    /// When unset, `https://<bucket>.s3.amazonaws.com[/prefix]` is used.
    pub bucket_url: Option<String>,

    pub region: String,

    /// Static credentials; when unset the SDK's default provider chain is used
    pub credentials: Option<StaticCredentials>,

    /// Endpoint override for S3-compatible stores
    pub endpoint_url: Option<String>,

    pub force_path_style: bool,

    /// Local content root the host application believes it writes under
    pub content_root: String,

    /// Local uploads directory; defaults to `<content_root>/uploads`
    pub uploads_dir: Option<String>,

    /// ACL applied to public objects on write
    pub default_acl: Acl,

    /// Lifetime of presigned URLs for private objects
    pub presign_expiry: Duration,

    /// Number of permission updates in flight during a batch
    pub acl_concurrency: usize,

    /// Where staging temp files are created (system temp dir if unset)
    pub staging_dir: Option<PathBuf>,

    pub conversion: ConversionRules,

    /// Derivative sizes generated for every image
    pub sizes: Vec<SizeSpec>,
}

/// Static access key pair
#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Rules for transcoding raster uploads
#[derive(Debug, Clone)]
pub struct ConversionRules {
    pub enabled: bool,
    pub target: TargetFormat,
    /// Encoder quality, 1-100
    pub quality: u8,
}

impl Default for ConversionRules {
    fn default() -> Self {
        Self {
            enabled: true,
            target: TargetFormat::WebP,
            quality: 85,
        }
    }
}

/// Format uploads are transcoded into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// Lossless only; quality is ignored by the encoder
    WebP,
    /// Smaller and lossy, but [`RasterEditor`](crate::RasterEditor) cannot
    /// decode it, so sizes of a stored AVIF cannot be regenerated with it
    Avif,
}

impl TargetFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Avif => "image/avif",
            Self::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Avif => "avif",
            Self::WebP => "webp",
        }
    }
}

/// A named derivative size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSpec {
    pub name: String,
    /// 0 means unbounded
    pub max_width: u32,
    /// 0 means unbounded
    pub max_height: u32,
    pub crop: bool,
}

impl SizeSpec {
    pub fn new<S: Into<String>>(name: S, max_width: u32, max_height: u32) -> Self {
        Self {
            name: name.into(),
            max_width,
            max_height,
            crop: false,
        }
    }

    pub fn cropped(mut self) -> Self {
        self.crop = true;
        self
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_url: None,
            region: "us-east-1".to_string(),
            credentials: None,
            endpoint_url: None,
            force_path_style: false,
            content_root: "/var/www/content".to_string(),
            uploads_dir: None,
            default_acl: Acl::PublicRead,
            presign_expiry: Duration::from_secs(6 * 60 * 60),
            acl_concurrency: 8,
            staging_dir: None,
            conversion: ConversionRules::default(),
            sizes: vec![
                SizeSpec::new("thumbnail", 150, 150).cropped(),
                SizeSpec::new("medium", 300, 300),
                SizeSpec::new("large", 1024, 1024),
            ],
        }
    }
}

impl MediaConfig {
    /// Create a config for a bucket with defaults for everything else
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Read configuration from `MEDIA_*` environment variables
    pub fn from_env() -> MediaResult<Self> {
        fn get_env(key: &str) -> MediaResult<String> {
            env::var(key).map_err(|_| MediaError::invalid(format!("{} environment variable required", key)))
        }

        let mut config = Self::new(get_env("MEDIA_S3_BUCKET")?);
        config.bucket_url = env::var("MEDIA_S3_BUCKET_URL").ok();
        if let Ok(region) = env::var("MEDIA_S3_REGION") {
            config.region = region;
        }
        if let Ok(root) = env::var("MEDIA_CONTENT_ROOT") {
            config.content_root = root;
        }
        config.endpoint_url = env::var("MEDIA_S3_ENDPOINT_URL").ok();
        config.force_path_style = config.endpoint_url.is_some();

        if let (Ok(access_key_id), Ok(secret_access_key)) = (
            env::var("MEDIA_S3_ACCESS_KEY_ID"),
            env::var("MEDIA_S3_SECRET_ACCESS_KEY"),
        ) {
            config.credentials = Some(StaticCredentials {
                access_key_id,
                secret_access_key,
            });
        }

        Ok(config)
    }

    /// Check the config is usable
    pub fn validate(&self) -> MediaResult<()> {
        if self.bucket.trim_matches('/').is_empty() {
            return Err(MediaError::invalid("bucket must not be empty"));
        }
        if !(1..=100).contains(&self.conversion.quality) {
            return Err(MediaError::invalid(format!(
                "quality {} out of range (1-100)",
                self.conversion.quality
            )));
        }
        if self.acl_concurrency == 0 {
            return Err(MediaError::invalid("acl_concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Local uploads directory
    pub fn uploads_dir(&self) -> String {
        self.uploads_dir
            .clone()
            .unwrap_or_else(|| format!("{}/uploads", self.content_root.trim_end_matches('/')))
    }

    pub fn with_bucket_url<S: Into<String>>(mut self, url: S) -> Self {
        self.bucket_url = Some(url.into());
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret_access_key: S) -> Self {
        self.credentials = Some(StaticCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        });
        self
    }

    /// Point at an S3-compatible endpoint (path-style addressing)
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self.force_path_style = true;
        self
    }

    pub fn with_content_root<S: Into<String>>(mut self, root: S) -> Self {
        self.content_root = root.into();
        self
    }

    pub fn with_uploads_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.uploads_dir = Some(dir.into());
        self
    }

    pub fn with_default_acl(mut self, acl: Acl) -> Self {
        self.default_acl = acl;
        self
    }

    pub fn with_presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry;
        self
    }

    pub fn with_acl_concurrency(mut self, concurrency: usize) -> Self {
        self.acl_concurrency = concurrency;
        self
    }

    pub fn with_staging_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.conversion.quality = quality;
        self
    }

    pub fn with_target_format(mut self, target: TargetFormat) -> Self {
        self.conversion.target = target;
        self
    }

    /// Turn off transcoding entirely
    pub fn without_conversion(mut self) -> Self {
        self.conversion.enabled = false;
        self
    }

    pub fn with_sizes(mut self, sizes: Vec<SizeSpec>) -> Self {
        self.sizes = sizes;
        self
    }
}
