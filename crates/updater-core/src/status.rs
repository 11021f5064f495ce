//! Lifecycle states and the on-disk status token.
//!
//! The status file in the ready directory holds `<state>` or
//! `<state>:<code>` followed by a newline. It is the only thing crash
//! recovery trusts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::UpdateError;

/// Name of the status file inside the ready directory.
pub const STATUS_FILE: &str = "update.status";
/// Name of the version file inside the ready directory.
pub const VERSION_FILE: &str = "update.version";

/// Lifecycle state of an update, its patch, or the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UpdateStatus {
    #[default]
    #[serde(rename = "null")]
    None,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "pending-service")]
    PendingService,
    #[serde(rename = "pending-elevate")]
    PendingElevate,
    #[serde(rename = "applying")]
    Applying,
    #[serde(rename = "applied")]
    Applied,
    #[serde(rename = "applied-service")]
    AppliedService,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "download-failed")]
    DownloadFailed,
    #[serde(rename = "failed")]
    Failed,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::None => "null",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Pending => "pending",
            UpdateStatus::PendingService => "pending-service",
            UpdateStatus::PendingElevate => "pending-elevate",
            UpdateStatus::Applying => "applying",
            UpdateStatus::Applied => "applied",
            UpdateStatus::AppliedService => "applied-service",
            UpdateStatus::Succeeded => "succeeded",
            UpdateStatus::DownloadFailed => "download-failed",
            UpdateStatus::Failed => "failed",
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(
            self,
            UpdateStatus::Pending | UpdateStatus::PendingService | UpdateStatus::PendingElevate
        )
    }

    pub fn is_applied(self) -> bool {
        matches!(self, UpdateStatus::Applied | UpdateStatus::AppliedService)
    }

    /// Pending or applied: the patch is fully downloaded.
    pub fn is_downloaded(self) -> bool {
        self.is_pending() || self.is_applied()
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "null" | "" => UpdateStatus::None,
            "downloading" => UpdateStatus::Downloading,
            "pending" => UpdateStatus::Pending,
            "pending-service" => UpdateStatus::PendingService,
            "pending-elevate" => UpdateStatus::PendingElevate,
            "applying" => UpdateStatus::Applying,
            "applied" => UpdateStatus::Applied,
            "applied-service" => UpdateStatus::AppliedService,
            "succeeded" => UpdateStatus::Succeeded,
            "download-failed" => UpdateStatus::DownloadFailed,
            "failed" => UpdateStatus::Failed,
            other => return Err(UpdateError::InvalidStatus(other.to_string())),
        };
        Ok(status)
    }
}

/// Process-wide state of the updater, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    /// Nothing in progress
    #[default]
    Idle,
    /// A patch is being transferred
    Downloading,
    /// The apply process is staging the ready update
    Staging,
    /// An update is ready and waits for a restart
    Pending,
    /// A newer update replaces the pending one
    Swap,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Idle => "idle",
            UpdateState::Downloading => "downloading",
            UpdateState::Staging => "staging",
            UpdateState::Pending => "pending",
            UpdateState::Swap => "swap",
        };
        f.write_str(name)
    }
}

/// Parsed content of a status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusToken {
    pub status: UpdateStatus,
    pub error_code: Option<i32>,
}

impl StatusToken {
    pub fn new(status: UpdateStatus) -> Self {
        Self { status, error_code: None }
    }

    pub fn failed(code: i32) -> Self {
        Self { status: UpdateStatus::Failed, error_code: Some(code) }
    }
}

impl From<UpdateStatus> for StatusToken {
    fn from(status: UpdateStatus) -> Self {
        Self::new(status)
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "{}:{}", self.status, code),
            None => write!(f, "{}", self.status),
        }
    }
}

impl FromStr for StatusToken {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some((state, code)) => {
                let status = state.trim().parse()?;
                let code = code
                    .trim()
                    .parse()
                    .map_err(|_| UpdateError::InvalidStatus(s.to_string()))?;
                Ok(StatusToken { status, error_code: Some(code) })
            }
            None => Ok(StatusToken::new(s.parse()?)),
        }
    }
}

/// Reads the raw status token from `dir`. Missing or unreadable files read
/// as `null`.
pub fn read_status(dir: &Path) -> String {
    let path = dir.join(STATUS_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let token = content.trim();
            if token.is_empty() {
                UpdateStatus::None.to_string()
            } else {
                token.to_string()
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => UpdateStatus::None.to_string(),
        Err(e) => {
            warn!("Unable to read status file {:?}: {}", path, e);
            UpdateStatus::None.to_string()
        }
    }
}

/// Returns true if a status file exists in `dir`.
pub fn status_file_exists(dir: &Path) -> bool {
    dir.join(STATUS_FILE).exists()
}

/// Writes `token` to the status file in `dir`, creating `dir` if needed.
pub fn write_status(dir: &Path, token: StatusToken) -> Result<(), UpdateError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(STATUS_FILE), format!("{}\n", token))?;
    Ok(())
}

/// Writes the target version, or `null` when unknown.
pub fn write_version(dir: &Path, version: Option<&str>) -> Result<(), UpdateError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(VERSION_FILE), format!("{}\n", version.unwrap_or("null")))?;
    Ok(())
}

/// Reads the version file, returning `None` for a missing file or `null`.
pub fn read_version(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join(VERSION_FILE)).ok()?;
    let version = content.trim();
    if version.is_empty() || version == "null" {
        None
    } else {
        Some(version.to_string())
    }
}
