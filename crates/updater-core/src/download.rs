//! Download decisions.
//!
//! Everything here is synchronous and free of IO: which patch to fetch,
//! whether a progress report is plausible, and what a finished transfer
//! means. The coordinator drives the transfer and carries out the
//! decisions.

use tracing::{debug, info, warn};

use crate::record::{props, PatchType, UpdateRecord};
use crate::status::UpdateStatus;
use crate::transfer::{BackendKind, TransferEvent, TransferStatus};

/// Result of [`select_patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSelection {
    /// The selected patch was mid-download; continue it
    Resume(usize),
    /// The native backend failed on this patch; try it again with chunked
    RetryChunked(usize),
    /// A fresh patch was selected
    Selected(usize),
    /// The selected patch is already pending or applied
    AlreadyDownloaded,
    /// The complete patch failed before; the update cannot be installed
    CompleteFailed,
    /// No eligible patch
    NothingToDownload,
}

impl PatchSelection {
    /// Index of the patch to transfer, if any.
    pub fn patch_index(self) -> Option<usize> {
        match self {
            PatchSelection::Resume(i) | PatchSelection::RetryChunked(i) | PatchSelection::Selected(i) => {
                Some(i)
            }
            _ => None,
        }
    }
}

/// Chooses the patch of `update` to download.
///
/// Partial patches are preferred. A failed partial is deselected and the
/// complete patch tried instead. With `has_ready` only partial patches are
/// eligible, since they apply on top of the ready update.
pub fn select_patch(update: &mut UpdateRecord, has_ready: bool) -> PatchSelection {
    let mut use_complete = false;

    if let Some(index) = update.selected_index() {
        let patch = &update.patches[index];
        debug!("Found existing patch {} with state {}", patch.patch_type, patch.state);

        if patch.state == UpdateStatus::Downloading {
            return PatchSelection::Resume(index);
        }
        if patch.state.is_downloaded() {
            return PatchSelection::AlreadyDownloaded;
        }
        if patch.properties.contains(props::NATIVE_RESULT)
            && !patch.properties.contains(props::CHUNKED_RESULT)
            && patch.error_code == 0
        {
            info!("Retrying patch with chunked transfer after native result {:?}",
                patch.properties.get(props::NATIVE_RESULT));
            return PatchSelection::RetryChunked(index);
        }
        if patch.patch_type == PatchType::Complete {
            warn!("Complete patch of {} failed, giving up", update.describe());
            return PatchSelection::CompleteFailed;
        }

        use_complete = true;
        update.patches[index].selected = false;
    }

    let partial = update.patches.iter().position(|p| p.patch_type == PatchType::Partial);
    let mut chosen = if use_complete { None } else { partial };

    if chosen.is_none() {
        if has_ready {
            debug!("Not selecting a complete patch while an update is ready");
            return PatchSelection::NothingToDownload;
        }
        if let Some(partial) = partial {
            update.patches[partial].selected = false;
        }
        chosen = update.patches.iter().position(|p| p.patch_type == PatchType::Complete);
    }

    let Some(index) = chosen else {
        return PatchSelection::NothingToDownload;
    };
    update.patches[index].selected = true;
    update.is_complete_update = update.patches[index].patch_type == PatchType::Complete;
    PatchSelection::Selected(index)
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download.
    pub total: u64,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} bytes ({:.1}%)", self.downloaded, self.total, self.percentage())
    }
}

/// What to do with one transfer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Started { final_url: String },
    Progress(DownloadProgress),
    /// Byte counts do not match the patch; cancel with this status
    Cancel(TransferStatus),
    Stopped(TransferStatus),
}

/// Byte accounting for one running transfer.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub backend: BackendKind,
    pub patch_size: u64,
    pub last_progress: Option<DownloadProgress>,
    stopped: bool,
}

impl DownloadSession {
    pub fn new(backend: BackendKind, patch_size: u64) -> Self {
        Self { backend, patch_size, last_progress: None, stopped: false }
    }

    /// Interprets `event`. Progress past the patch size, or with a total
    /// that disagrees with it once bytes are flowing, is rejected.
    pub fn step(&mut self, event: TransferEvent) -> StepAction {
        match event {
            TransferEvent::Started { final_url } => StepAction::Started { final_url },
            TransferEvent::Progress { transferred, total } => {
                if transferred > self.patch_size {
                    warn!("Progress {} is higher than patch size {}", transferred, self.patch_size);
                    return StepAction::Cancel(TransferStatus::Unexpected);
                }
                if transferred > 0 && total != self.patch_size {
                    warn!("Transfer total {} is not the patch size {}", total, self.patch_size);
                    return StepAction::Cancel(TransferStatus::Unexpected);
                }
                let progress = DownloadProgress::new(transferred, total);
                self.last_progress = Some(progress);
                StepAction::Progress(progress)
            }
            TransferEvent::Stopped(status) => {
                self.stopped = true;
                StepAction::Stopped(status)
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// How a transfer ended, after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopClass {
    /// Transferred and verified
    Success,
    /// Transferred but the content failed verification
    Corrupted,
    /// Verified but could not be moved to the ready dir
    MoveFailed,
    Offline,
    /// Socket-level error below the consecutive error threshold
    RetryableNetwork,
    Cancelled,
    /// The destination cannot be written
    PermissionDenied,
    OtherFailure,
}

/// Classifies a terminal status. Connection failures while the host
/// reports no network count as offline.
pub fn classify_stop(
    status: &TransferStatus,
    consecutive_socket_errors: u32,
    max_socket_errors: u32,
    network_offline: bool,
) -> StopClass {
    match status {
        TransferStatus::Success => StopClass::Success,
        TransferStatus::Offline => StopClass::Offline,
        s if s.is_retryable_network() && network_offline => StopClass::Offline,
        s if s.is_retryable_network() && consecutive_socket_errors < max_socket_errors => {
            StopClass::RetryableNetwork
        }
        TransferStatus::Cancelled => StopClass::Cancelled,
        s if s.is_permission_denied() => StopClass::PermissionDenied,
        _ => StopClass::OtherFailure,
    }
}

/// Next step after a transfer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Move the patch into the ready dir and mark it pending
    Promote,
    /// Resume when the network comes back
    WaitOnline,
    /// Resume after the socket retry delay
    RetrySoon,
    /// Explicit cancel; nothing further
    Cancelled,
    /// Try the same patch with the chunked backend
    RetryChunked,
    /// Try the complete patch of the same update
    FallBackToComplete,
    /// Count a failed download attempt
    GiveUp,
}

/// Result of [`decide_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    pub action: StopAction,
    /// Set the patch state to `download-failed`
    pub download_failed: bool,
    /// Move the downloading update to history
    pub discard: bool,
}

/// Completion decision table.
pub fn decide_stop(
    class: StopClass,
    backend: BackendKind,
    is_complete_update: bool,
    patch_count: usize,
) -> StopDecision {
    let decision = |action, download_failed, discard| StopDecision { action, download_failed, discard };
    match class {
        StopClass::Success => decision(StopAction::Promote, false, false),
        StopClass::Offline => decision(StopAction::WaitOnline, false, false),
        StopClass::RetryableNetwork => decision(StopAction::RetrySoon, false, false),
        StopClass::Cancelled => decision(StopAction::Cancelled, false, false),
        StopClass::PermissionDenied | StopClass::MoveFailed => decision(StopAction::GiveUp, true, true),
        StopClass::Corrupted | StopClass::OtherFailure => {
            if backend == BackendKind::Native {
                decision(StopAction::RetryChunked, true, false)
            } else if !is_complete_update && patch_count == 2 {
                decision(StopAction::FallBackToComplete, true, false)
            } else {
                decision(StopAction::GiveUp, true, true)
            }
        }
    }
}

/// Property that records the last result of `backend` on a patch.
pub fn result_property(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Native => props::NATIVE_RESULT,
        BackendKind::Chunked => props::CHUNKED_RESULT,
    }
}
