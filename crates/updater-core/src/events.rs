//! Events published by the coordinator.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver. A slow subscriber
//! that lags loses events; the coordinator never blocks on one.

use serde::Serialize;

use crate::status::{UpdateState, UpdateStatus};
use crate::transfer::{BackendKind, TransferStatus};

/// Why `UpdateAvailable` was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailableReason {
    /// The update cannot run on this system
    Unsupported,
    /// The user lacks the rights to apply it
    CantApply,
    /// Found by a foreground check or not auto-downloaded
    ShowPrompt,
    /// Elevation is required and was refused too often
    ElevationFailure,
}

/// Why `UpdateError` was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorReason {
    CheckFailed,
    DownloadFailed,
    ApplyFailed,
    /// The download cannot be written, no fallback
    AccessDenied,
}

/// Observable update events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UpdateEvent {
    CheckComplete { updates: usize, error_code: Option<i32> },
    DownloadStarted { version: String, backend: BackendKindName },
    DownloadProgress { transferred: u64, total: u64 },
    DownloadStopped { status: String },
    UpdateAvailable { version: String, reason: AvailableReason },
    UpdateDownloading { version: String },
    UpdateDownloaded { version: String, state: UpdateStatus },
    UpdateStaged { version: String, state: UpdateStatus },
    UpdateSwap { version: String },
    UpdateError { version: Option<String>, reason: ErrorReason, code: i32 },
    StateTransition { from: UpdateState, to: UpdateState },
    CheckAttemptFailed { errors: u32 },
    CheckAttemptsExceeded { errors: u32 },
    DownloadAttemptFailed { attempts: u32 },
    DownloadAttemptsExceeded { attempts: u32 },
    ElevationAttemptFailed { attempts: u32 },
    ElevationAttemptsExceeded { attempts: u32 },
}

/// Serializable backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKindName {
    Native,
    Chunked,
}

impl From<BackendKind> for BackendKindName {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Native => BackendKindName::Native,
            BackendKind::Chunked => BackendKindName::Chunked,
        }
    }
}

impl UpdateEvent {
    pub fn download_stopped(status: &TransferStatus) -> Self {
        UpdateEvent::DownloadStopped { status: status.to_string() }
    }

    /// Short name, as used in logs and by the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::CheckComplete { .. } => "check-complete",
            UpdateEvent::DownloadStarted { .. } => "download-started",
            UpdateEvent::DownloadProgress { .. } => "download-progress",
            UpdateEvent::DownloadStopped { .. } => "download-stopped",
            UpdateEvent::UpdateAvailable { .. } => "update-available",
            UpdateEvent::UpdateDownloading { .. } => "update-downloading",
            UpdateEvent::UpdateDownloaded { .. } => "update-downloaded",
            UpdateEvent::UpdateStaged { .. } => "update-staged",
            UpdateEvent::UpdateSwap { .. } => "update-swap",
            UpdateEvent::UpdateError { .. } => "update-error",
            UpdateEvent::StateTransition { .. } => "state-transition",
            UpdateEvent::CheckAttemptFailed { .. } => "check-attempt-failed",
            UpdateEvent::CheckAttemptsExceeded { .. } => "check-attempts-exceeded",
            UpdateEvent::DownloadAttemptFailed { .. } => "download-attempt-failed",
            UpdateEvent::DownloadAttemptsExceeded { .. } => "download-attempts-exceeded",
            UpdateEvent::ElevationAttemptFailed { .. } => "elevation-attempt-failed",
            UpdateEvent::ElevationAttemptsExceeded { .. } => "elevation-attempts-exceeded",
        }
    }
}
