//! Persisted counters and user choices.
//!
//! Retry caps must survive a restart in the middle of a sequence, so every
//! counter lives here rather than in memory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::UpdateError;

/// Counters and choices persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePrefs {
    /// Cumulative download attempts for the current update
    #[serde(default)]
    pub download_attempts: u32,

    /// Version `download_attempts` was counted for
    #[serde(default)]
    pub download_version: Option<String>,

    /// Elevation attempts for the current update
    #[serde(default)]
    pub elevate_attempts: u32,

    /// Elevation cancellations, all platforms
    #[serde(default)]
    pub cancelations: u32,

    /// Elevation cancellations counted by the platform gate
    #[serde(default)]
    pub cancelations_gated: u32,

    /// Version the user was last asked to elevate for
    #[serde(default)]
    pub elevate_version: Option<String>,

    /// The user chose never to elevate for `elevate_version`
    #[serde(default)]
    pub elevate_never: bool,

    /// Consecutive privileged service failures
    #[serde(default)]
    pub service_errors: u32,

    /// Set once the service path has been disabled after repeated failures
    #[serde(default)]
    pub service_disabled: bool,

    /// Consecutive background check failures
    #[serde(default)]
    pub background_errors: u32,
}

impl UpdatePrefs {
    /// Load prefs from a file, returning defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let prefs: Self = serde_json::from_str(&content)?;
        Ok(prefs)
    }

    /// Save prefs to a file.
    pub fn save(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// True once automatic downloads of `version` have failed more than
    /// `max_attempts` times.
    pub fn download_attempts_exhausted(&self, version: Option<&str>, max_attempts: u32) -> bool {
        self.download_attempts > max_attempts && self.download_version.as_deref() == version
    }

    /// Clears the download attempt counter.
    pub fn clear_download_attempts(&mut self) {
        self.download_attempts = 0;
        self.download_version = None;
    }

    /// Clears the elevation cancellation counters.
    pub fn clear_cancelations(&mut self) {
        self.cancelations = 0;
        self.cancelations_gated = 0;
    }
}

/// Owner of the prefs file. Every mutation is written through immediately.
#[derive(Debug)]
pub struct PrefsStore {
    path: PathBuf,
    prefs: UpdatePrefs,
}

impl PrefsStore {
    /// Open the prefs file, falling back to defaults on a corrupt file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let prefs = match UpdatePrefs::load(&path) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!("Ignoring unreadable prefs file {:?}: {}", path, e);
                UpdatePrefs::default()
            }
        };
        Self { path, prefs }
    }

    pub fn get(&self) -> &UpdatePrefs {
        &self.prefs
    }

    /// Apply `f` and persist the result. Write failures are logged; the
    /// in-memory value stays authoritative for this session.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut UpdatePrefs) -> R) -> R {
        let result = f(&mut self.prefs);
        if let Err(e) = self.prefs.save(&self.path) {
            warn!("Failed to persist prefs to {:?}: {}", self.path, e);
        }
        result
    }
}
