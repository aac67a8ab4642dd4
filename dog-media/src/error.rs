use thiserror::Error;

/// Result type for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while moving media through the pipeline
#[derive(Error, Debug)]
pub enum MediaError {
    /// Source file missing and not a recognized remote reference
    #[error("Media not found: {path}")]
    NotFound { path: String },

    /// The final copy to the destination did not complete
    #[error("Save to {destination} failed: {reason}")]
    SaveFailed { destination: String, reason: String },

    /// The codec could not produce the requested format
    #[error("Conversion to {format} failed: {reason}")]
    ConversionFailed { format: String, reason: String },

    /// One or more permission updates in a batch failed
    #[error("ACL update failed for {failed} file(s): [{code}] {message}")]
    AclUpdateFailed {
        code: String,
        message: String,
        failed: usize,
    },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    /// Error reported by the object store, with its service error code
    #[error("Remote store error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl MediaError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a save failed error
    pub fn save_failed<D: Into<String>, R: std::fmt::Display>(destination: D, reason: R) -> Self {
        Self::SaveFailed {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a conversion failed error
    pub fn conversion_failed<F: Into<String>, R: std::fmt::Display>(format: F, reason: R) -> Self {
        Self::ConversionFailed {
            format: format.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a remote store error
    pub fn remote<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Service error code carried by this error, if any
    pub fn code(&self) -> &str {
        match self {
            Self::Remote { code, .. } | Self::AclUpdateFailed { code, .. } => code,
            Self::NotFound { .. } => "NotFound",
            Self::SaveFailed { .. } => "SaveFailed",
            Self::ConversionFailed { .. } => "ConversionFailed",
            Self::Invalid { .. } => "Invalid",
            Self::Io { .. } => "Io",
            Self::Serialization { .. } => "Serialization",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
