use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MediaResult;

/// Unique identifier for a media object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaId(pub String);

impl MediaId {
    /// Generate a new random media ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access classification of a physical file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Acl {
    #[serde(rename = "public-read")]
    PublicRead,
    #[serde(rename = "private")]
    Private,
}

impl Acl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acl::PublicRead => "public-read",
            Acl::Private => "private",
        }
    }

    pub fn for_private(private: bool, public: Acl) -> Acl {
        if private {
            Acl::Private
        } else {
            public
        }
    }
}

impl std::fmt::Display for Acl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Acl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public-read" => Ok(Acl::PublicRead),
            "private" => Ok(Acl::Private),
            _ => Err(format!("Unknown ACL: {}", s)),
        }
    }
}

/// One generated size of a media object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeDescriptor {
    pub size: String,
    /// Basename, stored next to the original
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

/// A logical uploaded asset and every representation of it.
///
/// This is the host's per-asset metadata record; the pipeline reads and
/// patches it but never persists it on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaObject {
    pub id: MediaId,
    /// Path relative to the uploads root, e.g. `2024/05/photo.avif`
    pub file: String,
    pub mime_type: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub sizes: Vec<DerivativeDescriptor>,
    #[serde(default)]
    pub private: bool,
    /// Source MIME type when the file was transcoded on intake
    #[serde(default)]
    pub converted_from: Option<String>,
    /// Retained pre-edit original (basename)
    #[serde(default)]
    pub original_image: Option<String>,
    /// Legacy backup sizes kept from earlier edits
    #[serde(default)]
    pub backup_sizes: Vec<DerivativeDescriptor>,
}

impl MediaObject {
    pub fn new<F: Into<String>, M: Into<String>>(file: F, mime_type: M) -> Self {
        Self {
            id: MediaId::new(),
            file: file.into(),
            mime_type: mime_type.into(),
            width: None,
            height: None,
            filesize: 0,
            sizes: Vec::new(),
            private: false,
            converted_from: None,
            original_image: None,
            backup_sizes: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: MediaId) -> Self {
        self.id = id;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Whether the original was transcoded on intake
    pub fn is_converted(&self) -> bool {
        self.converted_from.is_some()
    }

    /// Directory of the primary file relative to the uploads root ("" at the root)
    pub fn dir(&self) -> &str {
        match self.file.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        }
    }

    /// Basename of the primary file
    pub fn basename(&self) -> &str {
        match self.file.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.file,
        }
    }

    /// Path relative to the uploads root of a sibling file
    pub fn sibling(&self, basename: &str) -> String {
        match self.dir() {
            "" => basename.to_string(),
            dir => format!("{}/{}", dir, basename),
        }
    }

    pub fn size(&self, name: &str) -> Option<&DerivativeDescriptor> {
        self.sizes.iter().find(|d| d.size == name)
    }

    /// Serialize into the host's key-value document
    pub fn to_document(&self) -> MediaResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Read back from the host's key-value document
    pub fn from_document(document: serde_json::Value) -> MediaResult<Self> {
        Ok(serde_json::from_value(document)?)
    }
}

/// A file handed over by the host before it reaches storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingUpload {
    /// Local file holding the uploaded bytes
    pub path: PathBuf,
    /// Client-supplied filename
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Source MIME type when the intake filter transcoded the file
    pub converted_from: Option<String>,
}

impl IncomingUpload {
    pub fn new<P: Into<PathBuf>, N: Into<String>, M: Into<String>>(path: P, name: N, mime_type: M, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            converted_from: None,
        }
    }
}

/// Notifications emitted by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Every physical file of a media object now carries `acl`
    AclChanged {
        media_id: MediaId,
        acl: Acl,
        files: usize,
        at: DateTime<Utc>,
    },

    /// An upload was transcoded on intake
    Converted {
        name: String,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },

    /// All physical files of a media object were removed
    Deleted {
        media_id: MediaId,
        files: usize,
        at: DateTime<Utc>,
    },
}

impl MediaEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::AclChanged { .. } => "acl_changed",
            Self::Converted { .. } => "converted",
            Self::Deleted { .. } => "deleted",
        }
    }
}
