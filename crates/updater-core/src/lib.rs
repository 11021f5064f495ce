//! # updater-core
//!
//! Crash-resilient self-update engine for an installed application.
//!
//! This crate handles:
//! - Manifest checks with coalesced foreground and background requests
//! - Choosing the newest applicable update and the patch to fetch
//! - Resumable downloads over an OS background transfer service or chunked
//!   HTTP range requests, with fallback between the two
//! - Handing the patch to an external apply process and watching it stage
//! - Reconciling the on-disk state after a crash or restart
//!
//! ## On-disk state
//!
//! Everything lives under one root directory: the active records
//! (`active-update.xml`), the history (`updates.xml`), the persisted
//! counters (`prefs.json`), the cross-process lock, and the `updates/0`
//! (ready) and `updates/downloading` directories. The status token in
//! `updates/0/update.status` is shared with the apply process and is the
//! source of truth whenever the records disagree with it.
//!
//! ## Entry point
//!
//! [`UpdateCoordinator`] owns all of it. Construct one with an
//! [`UpdaterConfig`] and [`HostServices`], call
//! [`UpdateCoordinator::init`], then drive it with checks and downloads
//! while watching [`UpdateEvent`]s.

pub mod checker;
pub mod codes;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod events;
pub mod host;
pub mod lock;
pub mod prefs;
pub mod reconcile;
pub mod record;
pub mod select;
pub mod staging;
pub mod status;
pub mod store;
pub mod transfer;
pub mod verify;
pub mod version;

#[cfg(test)]
mod harness;
#[cfg(test)]
mod proptests;
#[cfg(test)]
mod scenarios;

// Re-export main types for convenience
pub use checker::{CheckError, CheckKind, CheckResult, HttpManifestFetcher, ManifestFetcher, UpdateChecker};
pub use config::UpdaterConfig;
pub use coordinator::{CheckOutcome, Collaborators, DownloadStart, UpdateCoordinator};
pub use download::DownloadProgress;
pub use error::{ErrorClass, UpdateError};
pub use events::{AvailableReason, ErrorReason, UpdateEvent};
pub use host::{
    AlwaysOnline, AppInfo, ApplyLauncher, HostServices, InstanceProbe, NetworkMonitor, PrivilegeProbe,
    ProcessApplyLauncher, SingleInstance, StaticPrivileges,
};
pub use prefs::UpdatePrefs;
pub use record::{PatchRecord, PatchType, UpdateRecord, UpdateType};
pub use status::{StatusToken, UpdateState, UpdateStatus};
pub use store::UpdateDirs;
pub use transfer::native::{NativeJob, NativeTransferService};
pub use transfer::{BackendKind, TransferBackend, TransferStatus};
pub use verify::{PatchVerifier, SignatureVerifier};
