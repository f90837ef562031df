//! Error types and handlers for registry operations
//!
//! Every fallible operation in the crate returns [`RegistryError`]. The copy engine
//! wraps lower level failures in [`RegistryError::Operation`] so operators can tell a
//! failed source fetch from a failed destination push; [`RegistryError::kind`] sees
//! through that wrapping.

pub mod handlers;

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Stage of a copy operation an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    FetchManifest,
    FetchIndex,
    PushImage,
    PushIndex,
}

impl fmt::Display for CopyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CopyStage::FetchManifest => "fetch manifest",
            CopyStage::FetchIndex => "fetch index",
            CopyStage::PushImage => "push image",
            CopyStage::PushIndex => "push index",
        };
        f.write_str(name)
    }
}

/// Root classification of an error, independent of any stage wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    PermissionDenied,
    NotFound,
    NoMatchingPlatform,
    PlatformMismatch,
    Transport,
    SchemeMismatch,
    Cancelled,
    Registry,
    Parse,
    Io,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Malformed plan or missing required registry
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server rejected credentials or the operation (401/403)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Repository, tag or digest does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No manifest matches the requested architectures {requested:?}")]
    NoMatchingPlatform { requested: Vec<String> },

    #[error("Image architecture {architecture} does not match the requested architectures {requested:?}")]
    PlatformMismatch {
        architecture: String,
        requested: Vec<String>,
    },

    /// Network or TLS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Client spoke TLS to a plaintext-only server
    #[error("Scheme mismatch: {0}")]
    SchemeMismatch(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Any other non-success registry response
    #[error("Registry error (status {status}): {message}")]
    Registry { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} failed: {source}")]
    Operation {
        stage: CopyStage,
        #[source]
        source: Box<RegistryError>,
    },
}

impl RegistryError {
    /// Wrap this error with the copy stage it happened in
    pub fn during(self, stage: CopyStage) -> Self {
        match self {
            // cancellation stays recognisable at the top level
            RegistryError::Cancelled => RegistryError::Cancelled,
            other => RegistryError::Operation {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Config(_) => ErrorKind::Config,
            RegistryError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::NoMatchingPlatform { .. } => ErrorKind::NoMatchingPlatform,
            RegistryError::PlatformMismatch { .. } => ErrorKind::PlatformMismatch,
            RegistryError::Transport(_) => ErrorKind::Transport,
            RegistryError::SchemeMismatch(_) => ErrorKind::SchemeMismatch,
            RegistryError::Cancelled => ErrorKind::Cancelled,
            RegistryError::Registry { .. } => ErrorKind::Registry,
            RegistryError::Parse(_) => ErrorKind::Parse,
            RegistryError::Io(_) => ErrorKind::Io,
            RegistryError::Operation { source, .. } => source.kind(),
        }
    }

    /// Stage of the outermost stage wrapping, if any
    pub fn stage(&self) -> Option<CopyStage> {
        match self {
            RegistryError::Operation { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        RegistryError::Config(format!("Invalid plan document: {}", err))
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Config(format!("Invalid URL: {}", err))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<std::string::FromUtf8Error> for RegistryError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RegistryError::Parse(format!("UTF-8 conversion error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sees_through_stage_wrapping() {
        let err = RegistryError::NotFound("library/nginx:missing".to_string())
            .during(CopyStage::FetchManifest);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.stage(), Some(CopyStage::FetchManifest));
        assert!(err.to_string().starts_with("fetch manifest failed"));
    }

    #[test]
    fn cancelled_is_never_wrapped() {
        let err = RegistryError::Cancelled.during(CopyStage::PushIndex);
        assert!(matches!(err, RegistryError::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn no_matching_platform_names_the_filter() {
        let err = RegistryError::NoMatchingPlatform {
            requested: vec!["s390x".to_string()],
        };
        assert!(err.to_string().contains("s390x"));
    }
}
