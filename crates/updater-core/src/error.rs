//! Error types for the update engine.

use thiserror::Error;

use crate::transfer::TransferError;

/// Coarse classification of a failure, used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Offline, socket timeouts and resets. Retried automatically.
    Transient,
    /// A transfer mechanism failed in a way another mechanism can recover.
    BackendFallback,
    /// Size or digest mismatch. Never retried with the same patch.
    Verification,
    /// The external apply process reported an error code.
    ApplyFailure,
    /// No write access, disabled by policy, unreadable manifest.
    Fatal,
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A record attribute was missing or malformed
    #[error("invalid update record: {0}")]
    InvalidRecord(String),

    /// Attempt to set an extension property that shadows a fixed attribute
    #[error("property name is reserved: {0}")]
    ReservedProperty(String),

    /// Status file content could not be interpreted
    #[error("invalid status token: {0}")]
    InvalidStatus(String),

    /// The manifest did not have the expected shape
    #[error("unknown manifest schema: {0}")]
    UnknownManifestSchema(String),

    /// Artifact size does not match expected value
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Artifact hash does not match expected value
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Another process holds the update lock
    #[error("update lock is held by another instance")]
    LockUnavailable,

    /// Updating is disabled by policy or configuration
    #[error("updates are disabled: {0}")]
    Disabled(String),

    /// The external apply process could not be launched
    #[error("apply process failed to start: {0}")]
    ApplyLaunch(String),

    /// Transfer backend failure
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed record file or manifest
    #[error("XML error: {0}")]
    XmlError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<quick_xml::Error> for UpdateError {
    fn from(err: quick_xml::Error) -> Self {
        UpdateError::XmlError(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for UpdateError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        UpdateError::XmlError(err.to_string())
    }
}

impl From<toml::de::Error> for UpdateError {
    fn from(err: toml::de::Error) -> Self {
        UpdateError::ConfigError(err.to_string())
    }
}

impl UpdateError {
    /// Returns the recovery class for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            UpdateError::HttpError(_) => ErrorClass::Transient,
            UpdateError::Transfer(e) => e.class(),
            UpdateError::SizeMismatch { .. } | UpdateError::HashMismatch { .. } => {
                ErrorClass::Verification
            }
            UpdateError::ApplyLaunch(_) => ErrorClass::ApplyFailure,
            UpdateError::IoError(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorClass::Fatal
            }
            UpdateError::IoError(_) => ErrorClass::Transient,
            UpdateError::InvalidRecord(_)
            | UpdateError::ReservedProperty(_)
            | UpdateError::InvalidStatus(_)
            | UpdateError::UnknownManifestSchema(_)
            | UpdateError::LockUnavailable
            | UpdateError::Disabled(_)
            | UpdateError::ConfigError(_)
            | UpdateError::JsonError(_)
            | UpdateError::XmlError(_) => ErrorClass::Fatal,
        }
    }
}
