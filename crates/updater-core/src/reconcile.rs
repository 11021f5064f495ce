//! Startup reconciliation.
//!
//! Before anything else runs, the on-disk status token, the two update
//! slots, and the ready patch file are compared. [`plan_startup`] turns
//! those facts into a [`StartupPlan`]; the coordinator carries it out.
//! Keeping the decision pure means every combination can be tested without
//! touching disk.

use crate::codes;
use crate::status::{StatusToken, UpdateStatus};

/// What was found on disk at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupFacts {
    /// The user can apply updates at all
    pub can_apply: bool,
    /// Parsed status token; `None` when the file held garbage
    pub status: Option<StatusToken>,
    /// A status file exists, even if empty
    pub status_file_exists: bool,
    pub has_ready: bool,
    pub has_downloading: bool,
    /// `update.patch` is present in the ready dir
    pub ready_patch_exists: bool,
    /// Record state of the ready update
    pub ready_state: Option<UpdateStatus>,
    /// Either update targets a different channel than the app
    pub channel_mismatch: bool,
    /// Ready update is not newer than the running build
    pub ready_too_old: bool,
    /// Downloading update is not newer than the running build
    pub downloading_too_old: bool,
}

/// Which slot a discard applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ready,
    Downloading,
    Both,
}

/// What to do with the downloading update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadingAction {
    None,
    /// Continue the transfer; clean up the downloading update if it fails
    Resume,
    /// An update was installed meanwhile; the downloading partial is stale
    Drop,
}

/// What to do with the ready update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyAction {
    /// Nothing is ready
    None,
    /// `applying` seen for the first time: mark the record applying and
    /// poll for the end of staging
    AwaitStaging,
    /// `applying` seen again: the apply process crashed
    CrashReset,
    /// Failed or unknown state without an update to attach it to
    CleanupReady,
    /// Install finished; record it in history
    Succeeded { synthesize: bool },
    /// Waiting for the user to elevate
    PendingElevate,
    /// Pending or applied; drop it if the patch vanished
    VerifyPending,
    /// Install failed; try `handle_failure`, then fall back to the complete
    /// patch
    Failed { error_code: Option<i32> },
}

/// Result of [`plan_startup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    /// The user cannot apply updates; clear everything silently
    CleanupActive,
    /// State is inconsistent; fail every update with code 91 and clear both
    /// slots. With `synthesize`, a placeholder record stands in for a
    /// missing update in the history.
    Reset { synthesize: bool },
    /// Fail `slot` with `code` and clear both slots
    Discard { slot: Slot, code: i32 },
    Proceed { downloading: DownloadingAction, ready: ReadyAction },
}

/// Decide what to do with the state found at startup.
pub fn plan_startup(facts: &StartupFacts) -> StartupPlan {
    if !facts.can_apply {
        return StartupPlan::CleanupActive;
    }

    let Some(token) = facts.status else {
        return StartupPlan::Reset { synthesize: false };
    };
    let status = token.status;

    match status {
        UpdateStatus::Downloading => {
            if !facts.has_downloading || facts.has_ready {
                return StartupPlan::Reset { synthesize: true };
            }
        }
        UpdateStatus::Pending
        | UpdateStatus::PendingService
        | UpdateStatus::PendingElevate
        | UpdateStatus::Applying
        | UpdateStatus::Applied
        | UpdateStatus::AppliedService => {
            if !facts.has_ready {
                return StartupPlan::Reset { synthesize: true };
            }
            if !facts.ready_patch_exists {
                return StartupPlan::Reset { synthesize: false };
            }
        }
        UpdateStatus::Succeeded | UpdateStatus::Failed => {}
        UpdateStatus::DownloadFailed => {
            return StartupPlan::Reset { synthesize: !facts.has_downloading };
        }
        UpdateStatus::None => {
            return StartupPlan::Reset { synthesize: facts.status_file_exists };
        }
    }

    if facts.channel_mismatch {
        return StartupPlan::Discard { slot: Slot::Both, code: codes::ERR_CHANNEL_CHANGE };
    }

    let version_checked = status.is_downloaded() || status == UpdateStatus::Downloading;
    if version_checked {
        if facts.has_ready && facts.ready_too_old {
            return StartupPlan::Discard { slot: Slot::Ready, code: codes::ERR_OLDER_VERSION_OR_SAME_BUILD };
        }
        if facts.has_downloading && facts.downloading_too_old {
            return StartupPlan::Discard {
                slot: Slot::Downloading,
                code: codes::ERR_OLDER_VERSION_OR_SAME_BUILD,
            };
        }
    }

    let downloading = if facts.has_downloading || status == UpdateStatus::Downloading {
        if status == UpdateStatus::Succeeded {
            DownloadingAction::Drop
        } else {
            DownloadingAction::Resume
        }
    } else {
        DownloadingAction::None
    };

    if status == UpdateStatus::Downloading {
        return StartupPlan::Proceed { downloading, ready: ReadyAction::None };
    }

    let ready = match status {
        UpdateStatus::Applying => {
            let first_time = facts.has_ready
                && matches!(
                    facts.ready_state,
                    Some(UpdateStatus::Pending) | Some(UpdateStatus::PendingService)
                );
            if first_time {
                ReadyAction::AwaitStaging
            } else {
                ReadyAction::CrashReset
            }
        }
        UpdateStatus::Succeeded => ReadyAction::Succeeded { synthesize: !facts.has_ready },
        _ if !facts.has_ready => ReadyAction::CleanupReady,
        UpdateStatus::PendingElevate => ReadyAction::PendingElevate,
        UpdateStatus::Pending
        | UpdateStatus::PendingService
        | UpdateStatus::Applied
        | UpdateStatus::AppliedService => ReadyAction::VerifyPending,
        _ => ReadyAction::Failed { error_code: token.error_code },
    };

    StartupPlan::Proceed { downloading, ready }
}
