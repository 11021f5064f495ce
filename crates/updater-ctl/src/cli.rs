//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use updater_core::{
    AppInfo, CheckKind, CheckOutcome, HostServices, UpdateCoordinator, UpdateEvent, UpdateState,
    UpdaterConfig,
};

use crate::output::{OutputFormat, OutputFormatter, StatusOutput, UpdateSummary};
use crate::ExitCode;

/// updater-ctl - inspect and drive application updates
#[derive(Parser, Debug)]
#[command(name = "updater-ctl")]
#[command(version, about = "Inspect and drive application updates")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path (TOML)
    #[arg(long, global = true, env = "UPDATER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for update state, overriding the config
    #[arg(long, global = true, env = "UPDATER_ROOT")]
    pub root: Option<PathBuf>,

    #[command(flatten)]
    pub app: AppArgs,
}

/// Identity of the application being updated
#[derive(Args, Debug, Clone)]
pub struct AppArgs {
    #[arg(long = "app-name", global = true, env = "UPDATER_APP_NAME", default_value = "Application")]
    pub name: String,

    #[arg(id = "app_version", long = "app-version", global = true, env = "UPDATER_APP_VERSION", default_value = "0")]
    pub version: String,

    #[arg(long = "build-id", global = true, env = "UPDATER_BUILD_ID", default_value = "0")]
    pub build_id: String,

    #[arg(long, global = true, env = "UPDATER_CHANNEL", default_value = "default")]
    pub channel: String,
}

impl AppArgs {
    fn app_info(&self) -> AppInfo {
        AppInfo::new(&self.name, &self.version, &self.build_id).with_channel(&self.channel)
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the active updates and counters
    Status,
    /// List past updates, newest first
    History(HistoryArgs),
    /// Check for an update once
    Check(CheckArgs),
    /// Check periodically and download in the background until interrupted
    Run(RunArgs),
    /// Drop the active updates and reset all counters
    Reset,
}

#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// Show at most this many entries
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Run as a user-initiated check; never downloads automatically
    #[arg(long)]
    pub foreground: bool,

    /// Wait for a background download to finish
    #[arg(long)]
    pub wait: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Seconds between background checks
    #[arg(long, default_value_t = 86_400)]
    pub interval: u64,
}

impl Cli {
    /// Load the config file named by `--config`, or defaults when none is given.
    pub fn load_config(&self) -> anyhow::Result<UpdaterConfig> {
        match &self.config {
            Some(path) => UpdaterConfig::load_from_file(path)
                .with_context(|| format!("loading config from {}", path.display())),
            None => Ok(UpdaterConfig::default()),
        }
    }

    /// Apply command-line overrides to a loaded config.
    pub fn with_overrides(&self, mut config: UpdaterConfig) -> UpdaterConfig {
        if let Some(root) = &self.root {
            config.storage.root_dir = root.clone();
        }
        config
    }

    /// Execute the CLI command with a resolved config
    pub async fn execute_with_config(self, config: UpdaterConfig) -> anyhow::Result<ExitCode> {
        let config = self.with_overrides(config);
        let host = HostServices::local(self.app.app_info(), &config.apply);
        let coordinator = UpdateCoordinator::new(config, host).context("creating update coordinator")?;
        let formatter = OutputFormatter::new(self.output, self.verbose);

        let result = match self.command {
            Commands::Status => status(&coordinator, &formatter).await,
            Commands::History(args) => history(&coordinator, &formatter, args).await,
            Commands::Check(args) => check(&coordinator, &formatter, args).await,
            Commands::Run(args) => run(&coordinator, &formatter, args).await,
            Commands::Reset => reset(&coordinator, &formatter).await,
        };
        coordinator.shutdown().await;
        result
    }
}

fn print(text: String) {
    if !text.is_empty() {
        println!("{text}");
    }
}

async fn status(coordinator: &UpdateCoordinator, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
    coordinator.init().await?;
    let status = StatusOutput {
        state: coordinator.state(),
        has_lock: coordinator.has_lock().await,
        ready: coordinator.ready_update().await.as_ref().map(UpdateSummary::from),
        downloading: coordinator.downloading_update().await.as_ref().map(UpdateSummary::from),
        prefs: coordinator.prefs().await,
    };
    print(formatter.format_status(&status));
    Ok(ExitCode::Success)
}

async fn history(
    coordinator: &UpdateCoordinator,
    formatter: &OutputFormatter,
    args: HistoryArgs,
) -> anyhow::Result<ExitCode> {
    coordinator.init().await?;
    let mut history = coordinator.history().await;
    if let Some(limit) = args.limit {
        history.truncate(limit);
    }
    print(formatter.format_history(&history));
    Ok(ExitCode::Success)
}

async fn check(
    coordinator: &UpdateCoordinator,
    formatter: &OutputFormatter,
    args: CheckArgs,
) -> anyhow::Result<ExitCode> {
    let kind = if args.foreground { CheckKind::Foreground } else { CheckKind::Background };
    let mut events = coordinator.subscribe();
    formatter.progress("checking for updates");
    let outcome = coordinator.check_for_updates(kind).await?;
    print(formatter.format_check(&outcome));

    match outcome {
        CheckOutcome::Failed { .. } => return Ok(ExitCode::UpdateFailed),
        CheckOutcome::Downloading { .. } if args.wait => {}
        _ => return Ok(ExitCode::Success),
    }

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} update events", missed);
                continue;
            }
            Err(RecvError::Closed) => return Ok(ExitCode::GeneralError),
        };
        if let Some(line) = formatter.format_event(&event) {
            println!("{line}");
        }
        match event {
            UpdateEvent::UpdateDownloaded { .. } if coordinator.state() != UpdateState::Staging => {
                formatter.success("update downloaded");
                return Ok(ExitCode::Success);
            }
            UpdateEvent::UpdateStaged { .. } => {
                formatter.success("update staged");
                return Ok(ExitCode::Success);
            }
            UpdateEvent::UpdateError { .. } => return Ok(ExitCode::UpdateFailed),
            _ => {}
        }
    }
}

async fn run(coordinator: &UpdateCoordinator, formatter: &OutputFormatter, args: RunArgs) -> anyhow::Result<ExitCode> {
    coordinator.init().await?;
    let mut events = coordinator.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    info!("Checking for updates every {} seconds", args.interval.max(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let outcome = coordinator.check_for_updates(CheckKind::Background).await?;
                print(formatter.format_check(&outcome));
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = formatter.format_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} update events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(ExitCode::Success)
}

async fn reset(coordinator: &UpdateCoordinator, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
    coordinator.init().await?;
    if !coordinator.has_lock().await {
        return Ok(ExitCode::LockUnavailable);
    }
    coordinator.reset().await?;
    formatter.success("update state reset");
    Ok(ExitCode::Success)
}
