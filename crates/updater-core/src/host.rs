//! Host collaborators.
//!
//! Everything the engine needs from the running application or the OS is
//! reached through the traits here and bundled into [`HostServices`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ApplyConfig;
use crate::error::UpdateError;
use crate::record::RecordDefaults;
use crate::transfer::NativeTransferService;
use crate::verify::PatchVerifier;

/// Identity of the running application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Display name
    pub name: String,
    /// Product identifier used in the manifest URL
    pub product: String,
    pub version: String,
    pub build_id: String,
    pub channel: String,
    pub build_target: String,
    pub os_version: String,
    pub platform_version: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, build_id: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            product: name.clone(),
            name,
            version: version.into(),
            build_id: build_id.into(),
            channel: "default".to_string(),
            build_target: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os_version: std::env::consts::OS.to_string(),
            platform_version: String::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn record_defaults(&self) -> RecordDefaults {
        RecordDefaults {
            app_name: self.name.clone(),
            app_version: self.version.clone(),
            ..RecordDefaults::default()
        }
    }
}

/// What the current user may do with the installation.
pub trait PrivilegeProbe: Send + Sync {
    /// Applying needs an elevation prompt.
    fn elevation_required(&self) -> bool;

    /// The privileged maintenance service is installed and usable.
    fn service_installed(&self) -> bool;

    /// The user may apply updates at all.
    fn can_apply(&self) -> bool;

    /// Updates may be staged in the background.
    fn can_stage(&self) -> bool;
}

/// Other processes using the same installation.
pub trait InstanceProbe: Send + Sync {
    fn other_instances_running(&self) -> bool;
}

/// Connectivity.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    fn is_offline(&self) -> bool;

    /// Resolves once the network is back.
    async fn wait_online(&self);
}

/// Runs the external apply process in staging mode.
#[async_trait]
pub trait ApplyLauncher: Send + Sync {
    /// Launches the apply process for `ready_dir` and returns once it has
    /// exited. The outcome is read back from the status file.
    async fn stage(&self, ready_dir: &Path) -> Result<(), UpdateError>;
}

/// Fixed answers for [`PrivilegeProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPrivileges {
    pub elevation_required: bool,
    pub service_installed: bool,
    pub can_apply: bool,
    pub can_stage: bool,
}

impl Default for StaticPrivileges {
    fn default() -> Self {
        Self { elevation_required: false, service_installed: false, can_apply: true, can_stage: true }
    }
}

impl PrivilegeProbe for StaticPrivileges {
    fn elevation_required(&self) -> bool {
        self.elevation_required
    }

    fn service_installed(&self) -> bool {
        self.service_installed
    }

    fn can_apply(&self) -> bool {
        self.can_apply
    }

    fn can_stage(&self) -> bool {
        self.can_stage
    }
}

/// Assumes this is the only running instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleInstance;

impl InstanceProbe for SingleInstance {
    fn other_instances_running(&self) -> bool {
        false
    }
}

/// Assumes the network is always up.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl NetworkMonitor for AlwaysOnline {
    fn is_offline(&self) -> bool {
        false
    }

    async fn wait_online(&self) {}
}

/// Launches the apply executable with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessApplyLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessApplyLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Builds a launcher from the `[apply]` section, if an executable is set.
    pub fn from_config(config: &ApplyConfig) -> Option<Self> {
        let program = config.updater_path.clone()?;
        Some(Self::new(program, config.args.clone()))
    }

    fn args_for(&self, ready_dir: &Path) -> Vec<String> {
        let dir = ready_dir.to_string_lossy();
        self.args.iter().map(|arg| arg.replace("{ready_dir}", &dir)).collect()
    }
}

#[async_trait]
impl ApplyLauncher for ProcessApplyLauncher {
    async fn stage(&self, ready_dir: &Path) -> Result<(), UpdateError> {
        let args = self.args_for(ready_dir);
        info!("Launching apply process {:?} {:?}", self.program, args);
        let status = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(ready_dir)
            .status()
            .await
            .map_err(|e| UpdateError::ApplyLaunch(format!("{}: {}", self.program.display(), e)))?;
        if status.success() {
            debug!("Apply process exited cleanly");
        } else {
            warn!("Apply process exited with {}", status);
        }
        Ok(())
    }
}

/// Collaborators injected into the coordinator.
#[derive(Clone)]
pub struct HostServices {
    pub app: AppInfo,
    pub privileges: Arc<dyn PrivilegeProbe>,
    pub instances: Arc<dyn InstanceProbe>,
    pub network: Arc<dyn NetworkMonitor>,
    /// `None` when no apply executable is known; staging is then skipped
    pub apply: Option<Arc<dyn ApplyLauncher>>,
    /// OS transfer queue, when the platform has one
    pub native: Option<Arc<dyn NativeTransferService>>,
    pub verifier: PatchVerifier,
}

impl HostServices {
    /// Services for a plain single-user installation.
    pub fn local(app: AppInfo, apply: &ApplyConfig) -> Self {
        Self {
            app,
            privileges: Arc::new(StaticPrivileges::default()),
            instances: Arc::new(SingleInstance),
            network: Arc::new(AlwaysOnline),
            apply: ProcessApplyLauncher::from_config(apply)
                .map(|launcher| Arc::new(launcher) as Arc<dyn ApplyLauncher>),
            native: None,
            verifier: PatchVerifier::new(),
        }
    }
}
