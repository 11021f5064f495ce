//! updater-ctl - CLI for an updater-core installation
//!
//! This crate provides a command-line interface for:
//! - Showing the active updates and persisted counters
//! - Listing the update history
//! - Running manifest checks and background downloads
//! - Resetting a stuck installation

pub mod cli;
pub mod output;

pub use cli::Cli;
pub use output::{OutputFormat, OutputFormatter};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: The check, download, or install failed
/// - 3: Another process holds the update lock
/// - 4: Updates are disabled by policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    UpdateFailed = 2,
    LockUnavailable = 3,
    Disabled = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }
}

impl From<&updater_core::UpdateError> for ExitCode {
    fn from(error: &updater_core::UpdateError) -> Self {
        match error {
            updater_core::UpdateError::LockUnavailable => ExitCode::LockUnavailable,
            updater_core::UpdateError::Disabled(_) => ExitCode::Disabled,
            _ => ExitCode::GeneralError,
        }
    }
}
