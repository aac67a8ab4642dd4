//! Translation between local-style upload paths, `s3://` paths and URLs.
//!
//! Everything here is pure string work; no I/O.

use crate::MediaConfig;

/// Scheme used for remote paths handed to the host as if they were local
pub const SCHEME: &str = "s3://";

/// Bucket + key address of one physical file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteLocator {
    pub bucket: String,
    pub key: String,
    /// Query string stripped while resolving a URL (without the `?`)
    pub query: Option<String>,
}

impl RemoteLocator {
    pub fn new<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            query: None,
        }
    }

    /// The `s3://bucket/key` form of this locator
    pub fn to_path(&self) -> String {
        format!("{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

impl std::fmt::Display for RemoteLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

/// Resolves paths between the three address spaces
#[derive(Debug, Clone)]
pub struct PathResolver {
    content_root: String,
    uploads_dir: String,
    /// `name` or `name/prefix`, no surrounding separators
    bucket: String,
    bucket_url: Option<String>,
}

fn trim_trailing(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && !path.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Remainder of `path` below `root`, starting with `/` (or empty)
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    }
}

impl PathResolver {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            content_root: trim_trailing(&config.content_root).to_string(),
            uploads_dir: trim_trailing(&config.uploads_dir()).to_string(),
            bucket: config.bucket.trim_matches('/').to_string(),
            bucket_url: config
                .bucket_url
                .as_deref()
                .map(|url| trim_trailing(url).to_string()),
        }
    }

    /// Bucket identifier (text before the first separator)
    pub fn bucket_name(&self) -> &str {
        self.bucket.split('/').next().unwrap_or(&self.bucket)
    }

    /// Key prefix embedded in the bucket setting, if any
    pub fn bucket_prefix(&self) -> Option<&str> {
        self.bucket.split_once('/').map(|(_, prefix)| prefix)
    }

    /// `s3://bucket[/prefix]`
    pub fn remote_root(&self) -> String {
        format!("{}{}", SCHEME, self.bucket)
    }

    /// Bucket URL derived from the bucket name, ignoring any configured URL
    pub fn default_bucket_url(&self) -> String {
        match self.bucket_prefix() {
            Some(prefix) => format!("https://{}.s3.amazonaws.com/{}", self.bucket_name(), prefix),
            None => format!("https://{}.s3.amazonaws.com", self.bucket_name()),
        }
    }

    /// Public base URL for the remote root
    pub fn base_url(&self) -> String {
        self.bucket_url
            .clone()
            .unwrap_or_else(|| self.default_bucket_url())
    }

    /// Remote uploads root, e.g. `s3://bucket/uploads`
    pub fn upload_root(&self) -> String {
        self.resolve_upload_root(&self.uploads_dir)
    }

    /// Public URL of the uploads root
    pub fn upload_base_url(&self) -> String {
        self.resolve_url(&self.upload_root())
    }

    /// Replace the local content root with the remote root. Idempotent.
    pub fn resolve_upload_root(&self, local: &str) -> String {
        let local = trim_trailing(local);
        match strip_root(local, &self.content_root) {
            Some(rest) => format!("{}{}", self.remote_root(), rest),
            None => local.to_string(),
        }
    }

    /// Inverse of [`resolve_upload_root`](Self::resolve_upload_root)
    pub fn local_path(&self, remote: &str) -> String {
        let remote = trim_trailing(remote);
        match strip_root(remote, &self.remote_root()) {
            Some(rest) => format!("{}{}", self.content_root, rest),
            None => remote.to_string(),
        }
    }

    /// Replace the remote root with the public base URL
    pub fn resolve_url(&self, remote: &str) -> String {
        let remote = trim_trailing(remote);
        match strip_root(remote, &self.remote_root()) {
            Some(rest) => format!("{}{}", self.base_url(), rest),
            None => remote.to_string(),
        }
    }

    /// Inverse of [`resolve_url`](Self::resolve_url); the query string is dropped
    pub fn url_to_remote_path(&self, url: &str) -> String {
        let (base, _) = split_query(url);
        let base = trim_trailing(base);
        match strip_root(base, &self.base_url()) {
            Some(rest) => format!("{}{}", self.remote_root(), rest),
            None => base.to_string(),
        }
    }

    /// Whether `path` lives under the managed remote root
    pub fn is_managed(&self, path: &str) -> bool {
        strip_root(trim_trailing(path), &self.remote_root()).is_some()
    }

    /// Recover bucket + key from an outward-facing URL
    pub fn reverse_url_to_locator(&self, url: &str) -> Option<RemoteLocator> {
        let (base, query) = split_query(url);
        let base = trim_trailing(base);

        let mut candidates = vec![self.base_url()];
        let default = self.default_bucket_url();
        if !candidates.contains(&default) {
            candidates.push(default);
        }

        let rest = candidates
            .iter()
            .find_map(|root| strip_root(base, root))?
            .trim_start_matches('/');

        let key = match self.bucket_prefix() {
            Some(prefix) if rest.is_empty() => prefix.to_string(),
            Some(prefix) => format!("{}/{}", prefix, rest),
            None => rest.to_string(),
        };
        if key.is_empty() {
            return None;
        }

        Some(RemoteLocator {
            bucket: self.bucket_name().to_string(),
            key,
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Recover bucket + key from an `s3://` path
    pub fn reverse_local_path_to_locator(&self, path: &str) -> Option<RemoteLocator> {
        let rest = trim_trailing(path).strip_prefix(SCHEME)?;
        let (bucket, key) = rest.split_once('/')?;
        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(RemoteLocator::new(bucket, key))
    }

    /// Remote path of a file relative to the uploads root
    pub fn upload_path(&self, relative: &str) -> String {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            self.upload_root()
        } else {
            format!("{}/{}", self.upload_root(), relative)
        }
    }
}
