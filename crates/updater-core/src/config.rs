//! Configuration structures for the update engine.
//!
//! Every limit that has a hard ceiling is read through an `effective_*`
//! accessor so a hand-edited config file can never raise it past the cap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Manifest URL template (supports %PRODUCT%, %VERSION%, %CHANNEL%, ...)
    #[serde(default)]
    pub update_url: Option<String>,

    /// Optional version pin sent with each check
    #[serde(default)]
    pub pin: Option<String>,

    /// Whether the installation may migrate to a 64-bit build
    #[serde(default)]
    pub allow_migration: bool,

    /// Whether to automatically download updates
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Whether to stage downloaded updates in the background
    #[serde(default = "default_true")]
    pub staging_enabled: bool,

    /// Set when running as a headless background task
    #[serde(default)]
    pub background_task: bool,

    /// Updates disabled by policy
    #[serde(default)]
    pub disabled_by_policy: bool,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Download configuration
    #[serde(default)]
    pub download: DownloadConfig,

    /// Manifest check configuration
    #[serde(default)]
    pub check: CheckConfig,

    /// Elevation configuration
    #[serde(default)]
    pub elevation: ElevationConfig,

    /// Privileged service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Staging poll configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Other-instance wait configuration
    #[serde(default)]
    pub instances: InstancesConfig,

    /// External apply process
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Apply error code tables
    #[serde(default)]
    pub apply_errors: ApplyErrorCodes,

    /// On-disk layout
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            update_url: None,
            pin: None,
            allow_migration: false,
            auto_download: true,
            staging_enabled: true,
            background_task: false,
            disabled_by_policy: false,
            network: NetworkConfig::default(),
            download: DownloadConfig::default(),
            check: CheckConfig::default(),
            elevation: ElevationConfig::default(),
            service: ServiceConfig::default(),
            staging: StagingConfig::default(),
            instances: InstancesConfig::default(),
            apply: ApplyConfig::default(),
            apply_errors: ApplyErrorCodes::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Network retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout for streaming in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Consecutive socket errors tolerated before a download is failed
    #[serde(default = "default_socket_max_errors")]
    pub socket_max_errors: u32,

    /// Delay before retrying after a socket error, in milliseconds
    #[serde(default = "default_socket_retry_timeout")]
    pub socket_retry_timeout_ms: u64,

    /// Proxy URL; when set the native transfer backend is not used
    #[serde(default)]
    pub proxy: Option<String>,

    /// User agent for manifest and download requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            socket_max_errors: default_socket_max_errors(),
            socket_retry_timeout_ms: default_socket_retry_timeout(),
            proxy: None,
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    pub fn effective_socket_max_errors(&self) -> u32 {
        self.socket_max_errors.min(20)
    }

    pub fn effective_socket_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_retry_timeout_ms.min(10_000))
    }
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Download attempts before the update is abandoned
    #[serde(default = "default_download_max_attempts")]
    pub max_attempts: u32,

    /// Chunk size for chunked transfers in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Whether the native background transfer backend may be used
    #[serde(default = "default_true")]
    pub native_enabled: bool,

    /// Allow chunked transfer inside a background task (tests only)
    #[serde(default)]
    pub allow_chunked_in_background: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_download_max_attempts(),
            chunk_size: default_chunk_size(),
            native_enabled: true,
            allow_chunked_in_background: false,
        }
    }
}

impl DownloadConfig {
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.min(10)
    }
}

/// Manifest check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Consecutive background check failures before signalling
    #[serde(default = "default_background_max_errors")]
    pub background_max_errors: u32,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            background_max_errors: default_background_max_errors(),
        }
    }
}

impl CheckConfig {
    pub fn effective_background_max_errors(&self) -> u32 {
        self.background_max_errors.min(20)
    }
}

/// Elevation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevationConfig {
    /// Elevation attempts before the elevation-attempts-exceeded signal
    #[serde(default = "default_elevation_max_attempts")]
    pub max_attempts: u32,

    /// Elevation cancellations tolerated before giving up on an update
    #[serde(default = "default_cancelations_max")]
    pub cancelations_max: u32,

    /// Whether the platform gates updates on elevation cancellations
    #[serde(default = "default_elevation_gate")]
    pub gate_enabled: bool,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_elevation_max_attempts(),
            cancelations_max: default_cancelations_max(),
            gate_enabled: default_elevation_gate(),
        }
    }
}

impl ElevationConfig {
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.min(10)
    }

    pub fn effective_cancelations_max(&self) -> u32 {
        self.cancelations_max.min(5)
    }
}

/// Privileged service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Consecutive service failures before the service path is disabled
    #[serde(default = "default_service_max_errors")]
    pub max_errors: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_errors: default_service_max_errors(),
        }
    }
}

impl ServiceConfig {
    pub fn effective_max_errors(&self) -> u32 {
        self.max_errors.min(10)
    }
}

/// Staging poll configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// First poll interval in seconds
    #[serde(default = "default_staging_min_interval")]
    pub min_interval_seconds: u64,

    /// Longest poll interval in seconds
    #[serde(default = "default_staging_max_interval")]
    pub max_interval_seconds: u64,

    /// Polls at the same interval before doubling it
    #[serde(default = "default_staging_attempts_per_interval")]
    pub attempts_per_interval: u32,

    /// Wall-clock ceiling in seconds after which staging is assumed dead
    #[serde(default = "default_staging_max_duration")]
    pub max_duration_seconds: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            min_interval_seconds: default_staging_min_interval(),
            max_interval_seconds: default_staging_max_interval(),
            attempts_per_interval: default_staging_attempts_per_interval(),
            max_duration_seconds: default_staging_max_duration(),
        }
    }
}

/// Configuration for waiting on other running instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// Whether to wait for other instances before checking
    #[serde(default = "default_true")]
    pub check_enabled: bool,

    /// Poll interval in seconds
    #[serde(default = "default_instances_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Give up waiting after this many seconds
    #[serde(default = "default_instances_timeout")]
    pub timeout_seconds: u64,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            check_enabled: true,
            poll_interval_seconds: default_instances_poll_interval(),
            timeout_seconds: default_instances_timeout(),
        }
    }
}

impl InstancesConfig {
    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.min(2 * 24 * 60 * 60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

/// External apply process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Path of the apply executable
    #[serde(default)]
    pub updater_path: Option<PathBuf>,

    /// Arguments; `{ready_dir}` is replaced with the ready directory
    #[serde(default = "default_apply_args")]
    pub args: Vec<String>,

    /// Install attempts allowed per patch for write errors
    #[serde(default = "default_max_total_install_attempts")]
    pub max_total_install_attempts: u32,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            updater_path: None,
            args: default_apply_args(),
            max_total_install_attempts: default_max_total_install_attempts(),
        }
    }
}

/// Error code tables published by the apply process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyErrorCodes {
    /// Codes that mean the install location could not be written
    #[serde(default = "default_write_errors")]
    pub write_errors: Vec<i32>,

    /// Codes that mean the privileged service failed
    #[serde(default = "default_service_errors")]
    pub service_errors: Vec<i32>,

    /// The user cancelled the elevation prompt
    #[serde(default = "default_elevation_canceled")]
    pub elevation_canceled: i32,
}

impl Default for ApplyErrorCodes {
    fn default() -> Self {
        Self {
            write_errors: default_write_errors(),
            service_errors: default_service_errors(),
            elevation_canceled: default_elevation_canceled(),
        }
    }
}

impl ApplyErrorCodes {
    pub fn is_write_error(&self, code: i32) -> bool {
        self.write_errors.contains(&code)
    }

    pub fn is_service_error(&self, code: i32) -> bool {
        self.service_errors.contains(&code)
    }
}

/// On-disk layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `updates/`, record files, and the lock
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Debounce window for record writes in milliseconds
    #[serde(default = "default_save_interval")]
    pub save_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            save_interval_ms: default_save_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_socket_max_errors() -> u32 {
    10
}

fn default_socket_retry_timeout() -> u64 {
    2000
}

fn default_user_agent() -> String {
    format!("updater-core/{}", env!("CARGO_PKG_VERSION"))
}

fn default_download_max_attempts() -> u32 {
    2
}

fn default_chunk_size() -> u64 {
    300_000
}

fn default_background_max_errors() -> u32 {
    10
}

fn default_elevation_max_attempts() -> u32 {
    2
}

fn default_cancelations_max() -> u32 {
    3
}

fn default_elevation_gate() -> bool {
    cfg!(target_os = "macos")
}

fn default_service_max_errors() -> u32 {
    10
}

fn default_staging_min_interval() -> u64 {
    15
}

fn default_staging_max_interval() -> u64 {
    5 * 60
}

fn default_staging_attempts_per_interval() -> u32 {
    5
}

fn default_staging_max_duration() -> u64 {
    60 * 60
}

fn default_instances_poll_interval() -> u64 {
    5 * 60
}

fn default_instances_timeout() -> u64 {
    6 * 60 * 60
}

fn default_apply_args() -> Vec<String> {
    vec!["{ready_dir}".to_string()]
}

fn default_max_total_install_attempts() -> u32 {
    2
}

fn default_write_errors() -> Vec<i32> {
    vec![7, 35, 37, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70]
}

fn default_service_errors() -> Vec<i32> {
    vec![24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 49, 50, 51, 58]
}

fn default_elevation_canceled() -> i32 {
    9
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("update-data")
}

fn default_save_interval() -> u64 {
    200
}
