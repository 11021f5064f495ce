//! The update coordinator.
//!
//! [`UpdateCoordinator`] owns the update slots, the on-disk state, and the
//! running transfer. Every mutation happens under one async mutex; transfer
//! events, staging polls, and retry timers run as tasks that take the same
//! mutex when they report back. A transfer that finishes after it was
//! superseded is recognised by its download id and ignored.
//!
//! The global [`UpdateState`] is published on a `watch` channel and every
//! notable step is broadcast as an [`UpdateEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checker::{CheckError, CheckKind, HttpManifestFetcher, ManifestFetcher, UpdateChecker};
use crate::codes;
use crate::config::UpdaterConfig;
use crate::download::{
    classify_stop, decide_stop, result_property, select_patch, DownloadProgress, DownloadSession,
    PatchSelection, StepAction, StopAction, StopClass,
};
use crate::error::UpdateError;
use crate::events::{AvailableReason, ErrorReason, UpdateEvent};
use crate::host::HostServices;
use crate::lock::UpdateLock;
use crate::prefs::{PrefsStore, UpdatePrefs};
use crate::reconcile::{plan_startup, DownloadingAction, ReadyAction, Slot, StartupFacts, StartupPlan};
use crate::record::{props, PatchType, UpdateRecord};
use crate::select::{apply_elevation_gate, select_update, Baseline};
use crate::staging::{classify_staging_result, wait_for_staging_end, StagingResult};
use crate::status::{read_version, StatusToken, UpdateState, UpdateStatus};
use crate::store::{UpdateDirs, UpdateStateStore};
use crate::transfer::native::{ACTIVE_POLL_INTERVAL, IDLE_POLL_INTERVAL};
use crate::transfer::{
    choose_backend, probe_native, BackendKind, ChunkedTransfer, NativeTransfer, TransferBackend,
    TransferCanceller, TransferError, TransferEvent, TransferRequest, TransferStatus,
};
use crate::version::is_at_least_as_old_as;

/// Capacity of the event broadcast channel.
const EVENT_BUFFER: usize = 256;

/// Result of [`UpdateCoordinator::check_for_updates`].
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Checking is disabled by policy
    NotAllowed,
    Failed { code: i32 },
    NoUpdate,
    /// An update the user has to act on
    Available { update: UpdateRecord, reason: AvailableReason },
    /// The update is being downloaded in the background
    Downloading { version: String },
    /// The selected patch is already downloaded
    AlreadyDownloaded { version: String },
}

/// Result of starting a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStart {
    Started,
    /// The same update is already transferring
    AlreadyDownloading,
    AlreadyDownloaded,
    /// No patch of the update can be downloaded
    NothingToDownload,
    Failed,
}

/// Replaceable collaborators, mainly for tests.
pub struct Collaborators {
    pub fetcher: Arc<dyn ManifestFetcher>,
    pub chunked: Arc<dyn TransferBackend>,
    pub native: Option<Arc<dyn TransferBackend>>,
}

struct ActiveDownload {
    id: u64,
    backend: BackendKind,
    canceller: TransferCanceller,
}

struct Inner {
    store: UpdateStateStore,
    prefs: PrefsStore,
    lock: Option<UpdateLock>,
    initialized: bool,
    download: Option<ActiveDownload>,
    consecutive_socket_errors: u32,
    /// Set once a second update was staged over a ready one; downloads
    /// still run but nothing else is promoted until restart
    only_download_updates_this_session: bool,
    /// A newer download replaced the ready update this session
    swapped_this_session: bool,
    /// Staging watchers, retry timers, and network waits
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

struct Shared {
    config: UpdaterConfig,
    host: HostServices,
    dirs: UpdateDirs,
    checker: UpdateChecker,
    chunked: Arc<dyn TransferBackend>,
    native: Option<Arc<dyn TransferBackend>>,
    native_in_use_by_other_user: Arc<AtomicBool>,
    inner: Mutex<Inner>,
    state: watch::Sender<UpdateState>,
    events: broadcast::Sender<UpdateEvent>,
    listeners: AtomicUsize,
    next_download: AtomicU64,
}

/// Drives checks, downloads, and staging for one installation.
#[derive(Clone)]
pub struct UpdateCoordinator {
    shared: Arc<Shared>,
}

impl UpdateCoordinator {
    /// Builds a coordinator with the HTTP fetcher, the chunked backend, and
    /// the native backend when the host provides an OS transfer service.
    pub fn new(config: UpdaterConfig, host: HostServices) -> Result<Self, UpdateError> {
        let in_use = Arc::new(AtomicBool::new(false));
        let fetcher =
            HttpManifestFetcher::new(&config.network).map_err(|e| UpdateError::HttpError(e.to_string()))?;
        let chunked = ChunkedTransfer::new(&config)?;
        let native = host.native.clone().map(|service| {
            Arc::new(NativeTransfer::new(service, in_use.clone())) as Arc<dyn TransferBackend>
        });
        let parts = Collaborators { fetcher: Arc::new(fetcher), chunked: Arc::new(chunked), native };
        Ok(Self::build(config, host, parts, in_use))
    }

    pub fn with_collaborators(config: UpdaterConfig, host: HostServices, parts: Collaborators) -> Self {
        Self::build(config, host, parts, Arc::new(AtomicBool::new(false)))
    }

    fn build(
        config: UpdaterConfig,
        host: HostServices,
        parts: Collaborators,
        native_in_use_by_other_user: Arc<AtomicBool>,
    ) -> Self {
        let dirs = UpdateDirs::new(config.storage.root_dir.clone());
        let store = UpdateStateStore::new(
            dirs.clone(),
            host.app.record_defaults(),
            Duration::from_millis(config.storage.save_interval_ms),
        );
        let prefs = PrefsStore::open(dirs.prefs_file());
        let checker = UpdateChecker::new(
            &config,
            host.app.clone(),
            parts.fetcher,
            host.network.clone(),
            host.instances.clone(),
        );
        let (state, _) = watch::channel(UpdateState::Idle);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            shared: Arc::new(Shared {
                config,
                host,
                dirs,
                checker,
                chunked: parts.chunked,
                native: parts.native,
                native_in_use_by_other_user,
                inner: Mutex::new(Inner {
                    store,
                    prefs,
                    lock: None,
                    initialized: false,
                    download: None,
                    consecutive_socket_errors: 0,
                    only_download_updates_this_session: false,
                    swapped_this_session: false,
                    tasks: Vec::new(),
                }),
                state,
                events,
                listeners: AtomicUsize::new(0),
                next_download: AtomicU64::new(1),
            }),
        }
    }

    /// Takes the update lock and reconciles what is on disk. Safe to call
    /// more than once; later calls do nothing.
    ///
    /// Without the lock the coordinator can still check, but never
    /// downloads or touches the update files.
    pub async fn init(&self) -> Result<(), UpdateError> {
        self.shared.init().await
    }

    /// Runs a manifest check and acts on the result.
    pub async fn check_for_updates(&self, kind: CheckKind) -> Result<CheckOutcome, UpdateError> {
        self.shared.init().await?;
        Ok(self.shared.clone().check(kind).await)
    }

    /// Starts downloading `update`, replacing any other download.
    pub async fn download_update(
        &self,
        update: UpdateRecord,
        foreground: bool,
    ) -> Result<DownloadStart, UpdateError> {
        self.shared.init().await?;
        if self.shared.config.disabled_by_policy {
            return Err(UpdateError::Disabled("policy".to_string()));
        }
        let mut inner = self.shared.inner.lock().await;
        if inner.lock.is_none() {
            return Err(UpdateError::LockUnavailable);
        }
        let started = self.shared.start_download(&mut inner, Some(update), foreground).await;
        if started == DownloadStart::Failed {
            self.shared.cleanup_downloading_update_locked(&mut inner).await;
        }
        Ok(started)
    }

    /// Cancels the running transfer, keeping the downloading update so a
    /// later call can resume it.
    pub async fn stop_downloading(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.download.is_none() {
            debug!("No download to stop");
            return;
        }
        self.shared.cancel_active_locked(&mut inner).await;
        let next = self.shared.idle_or_pending(&inner);
        self.shared.transition(next);
    }

    /// Registers interest in progress; transfers are polled faster while
    /// anyone listens.
    pub async fn add_download_listener(&self) {
        self.shared.listeners.fetch_add(1, Ordering::SeqCst);
        self.shared.apply_poll_interval().await;
    }

    pub async fn remove_download_listener(&self) {
        let _ = self
            .shared
            .listeners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.shared.apply_poll_interval().await;
    }

    pub async fn cleanup_ready_update(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.cleanup_ready_update_locked(&mut inner);
    }

    pub async fn cleanup_downloading_update(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.cleanup_downloading_update_locked(&mut inner).await;
    }

    pub async fn cleanup_active_updates(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.cleanup_active_updates_locked(&mut inner).await;
    }

    /// Drops both slots and the counters kept in prefs, then writes
    /// everything out.
    pub async fn reset(&self) -> Result<(), UpdateError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.cleanup_active_updates_locked(&mut inner).await;
        inner.prefs.update(|p| *p = UpdatePrefs::default());
        inner.consecutive_socket_errors = 0;
        inner.store.flush()
    }

    pub fn state(&self) -> UpdateState {
        self.shared.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<UpdateState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.shared.events.subscribe()
    }

    pub async fn ready_update(&self) -> Option<UpdateRecord> {
        self.shared.inner.lock().await.store.ready_update().cloned()
    }

    pub async fn downloading_update(&self) -> Option<UpdateRecord> {
        self.shared.inner.lock().await.store.downloading_update().cloned()
    }

    /// Past updates, newest first.
    pub async fn history(&self) -> Vec<UpdateRecord> {
        self.shared.inner.lock().await.store.history().to_vec()
    }

    pub async fn prefs(&self) -> UpdatePrefs {
        self.shared.inner.lock().await.prefs.get().clone()
    }

    pub async fn has_lock(&self) -> bool {
        self.shared.inner.lock().await.lock.is_some()
    }

    pub async fn is_downloading(&self) -> bool {
        self.shared.inner.lock().await.download.is_some()
    }

    pub async fn only_download_updates_this_session(&self) -> bool {
        self.shared.inner.lock().await.only_download_updates_this_session
    }

    /// Writes pending record changes now.
    pub async fn flush(&self) -> Result<(), UpdateError> {
        self.shared.inner.lock().await.store.flush()
    }

    /// Stops checks and timers and releases the lock. A native transfer is
    /// left to the OS and picked up again by the next process.
    pub async fn shutdown(&self) {
        info!("Shutting down update coordinator");
        self.shared.checker.stop_all().await;
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.download.take() {
            match active.backend {
                BackendKind::Native => info!("Leaving native transfer running"),
                BackendKind::Chunked => {
                    if let Err(e) = active.canceller.cancel(TransferStatus::Cancelled).await {
                        warn!("Failed to cancel download on shutdown: {}", e);
                    }
                }
            }
        }
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = inner.store.flush() {
            error!("Failed to save update records on shutdown: {}", e);
        }
        inner.lock = None;
    }
}

impl Shared {
    fn current_state(&self) -> UpdateState {
        *self.state.borrow()
    }

    fn transition(&self, to: UpdateState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            from = *current;
            *current = to;
            true
        });
        if changed {
            info!("Update state {} -> {}", from, to);
            self.emit(UpdateEvent::StateTransition { from, to });
        }
    }

    fn emit(&self, event: UpdateEvent) {
        debug!("Emitting {}", event.name());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn idle_or_pending(&self, inner: &Inner) -> UpdateState {
        match inner.store.ready_update() {
            Some(ready) if ready.state().is_downloaded() => UpdateState::Pending,
            _ => UpdateState::Idle,
        }
    }

    fn service_in_use(&self, prefs: &UpdatePrefs) -> bool {
        self.host.privileges.service_installed() && !prefs.service_disabled
    }

    /// Pending flavour for a freshly downloaded or re-queued update.
    fn best_pending_state(&self, prefs: &UpdatePrefs) -> UpdateStatus {
        if self.service_in_use(prefs) {
            UpdateStatus::PendingService
        } else if self.host.privileges.elevation_required() {
            UpdateStatus::PendingElevate
        } else {
            UpdateStatus::Pending
        }
    }

    fn can_stage(&self) -> bool {
        self.config.staging_enabled && self.host.apply.is_some() && self.host.privileges.can_stage()
    }

    async fn apply_poll_interval(&self) {
        let interval = if self.listeners.load(Ordering::SeqCst) > 0 {
            ACTIVE_POLL_INTERVAL
        } else {
            IDLE_POLL_INTERVAL
        };
        let inner = self.inner.lock().await;
        if let Some(active) = &inner.download {
            active.canceller.set_poll_interval(interval);
        }
    }

    // ---- startup ----

    async fn init(self: &Arc<Self>) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            return Ok(());
        }
        inner.initialized = true;
        std::fs::create_dir_all(self.dirs.root())?;

        match UpdateLock::acquire(&self.dirs.lock_file()) {
            Ok(lock) => inner.lock = Some(lock),
            Err(UpdateError::LockUnavailable) => {
                warn!("Another instance holds the update lock, only checks are possible")
            }
            Err(e) => warn!("Unable to take the update lock: {}", e),
        }

        let state = inner.store.reload(false);
        self.transition(state);
        if inner.lock.is_none() {
            return Ok(());
        }

        let facts = self.startup_facts(&inner);
        let plan = plan_startup(&facts);
        info!("Startup plan {:?}", plan);
        self.execute_plan(&mut inner, plan).await;
        inner.store.save_updates();
        Ok(())
    }

    fn startup_facts(&self, inner: &Inner) -> StartupFacts {
        let store = &inner.store;
        let app = &self.host.app;
        let too_old = |update: &UpdateRecord| match update.app_version.as_deref() {
            Some(version) => {
                is_at_least_as_old_as(version, update.build_id.as_deref(), &app.version, Some(&app.build_id))
            }
            None => true,
        };
        StartupFacts {
            can_apply: self.host.privileges.can_apply(),
            status: store.read_status().parse::<StatusToken>().ok(),
            status_file_exists: store.status_file_exists(),
            has_ready: store.ready_update().is_some(),
            has_downloading: store.downloading_update().is_some(),
            ready_patch_exists: store.ready_patch_exists(),
            ready_state: store.ready_update().map(UpdateRecord::state),
            channel_mismatch: store
                .ready_update()
                .into_iter()
                .chain(store.downloading_update())
                .any(|u| u.channel != app.channel),
            ready_too_old: store.ready_update().map(too_old).unwrap_or(false),
            downloading_too_old: store.downloading_update().map(too_old).unwrap_or(false),
        }
    }

    async fn execute_plan(self: &Arc<Self>, inner: &mut Inner, plan: StartupPlan) {
        match plan {
            StartupPlan::CleanupActive => {
                info!("Updates cannot be applied by this user, clearing active updates");
                self.cleanup_active_updates_locked(inner).await;
            }
            StartupPlan::Reset { synthesize } => {
                warn!("Update status and records disagree, resetting");
                self.reset_locked(inner, codes::ERR_UPDATE_STATE_NONE, synthesize).await;
            }
            StartupPlan::Discard { slot, code } => {
                info!("Discarding active updates ({:?}) with code {}", slot, code);
                if matches!(slot, Slot::Ready | Slot::Both) {
                    if let Some(ready) = inner.store.ready_update_mut() {
                        ready.mark_failed(code);
                    }
                }
                if matches!(slot, Slot::Downloading | Slot::Both) {
                    if let Some(downloading) = inner.store.downloading_update_mut() {
                        downloading.mark_failed(code);
                    }
                }
                self.cleanup_active_updates_locked(inner).await;
            }
            StartupPlan::Proceed { downloading, ready } => {
                self.apply_ready_action(inner, ready).await;
                match downloading {
                    DownloadingAction::None => {}
                    DownloadingAction::Drop => {
                        info!("An update was installed, dropping the stale download");
                        self.cleanup_downloading_update_locked(inner).await;
                    }
                    DownloadingAction::Resume => match self.start_download(inner, None, false).await {
                        DownloadStart::Started | DownloadStart::AlreadyDownloading => {}
                        other => {
                            warn!("Could not resume download at startup: {:?}", other);
                            self.cleanup_downloading_update_locked(inner).await;
                        }
                    },
                }
            }
        }
    }

    /// Record for the history when the status file names an update that
    /// has no record.
    fn synthesized_record(&self, code: Option<i32>) -> UpdateRecord {
        let mut update = UpdateRecord::placeholder();
        update.app_version =
            Some(read_version(&self.dirs.ready_dir()).unwrap_or_else(|| self.host.app.version.clone()));
        update.channel = self.host.app.channel.clone();
        if let Some(code) = code {
            update.mark_failed(code);
        }
        update
    }

    async fn reset_locked(&self, inner: &mut Inner, code: i32, synthesize: bool) {
        self.cancel_active_locked(inner).await;
        let mut any = false;
        for mut update in [inner.store.take_ready(), inner.store.take_downloading()].into_iter().flatten() {
            update.mark_failed(code);
            inner.store.add_to_history(&update);
            any = true;
        }
        if !any && synthesize {
            let update = self.synthesized_record(Some(code));
            inner.store.add_to_history(&update);
        }
        inner.store.save_updates();
        inner.store.clean_up_ready_dir(true);
        inner.store.clean_up_downloading_dir();
        self.transition(UpdateState::Idle);
    }

    async fn apply_ready_action(self: &Arc<Self>, inner: &mut Inner, action: ReadyAction) {
        match action {
            ReadyAction::None => {}
            ReadyAction::AwaitStaging => {
                info!("Staging is in progress, waiting for it to finish");
                if let Some(ready) = inner.store.ready_update_mut() {
                    ready.set_state(UpdateStatus::Applying);
                }
                inner.store.save_updates();
                self.transition(UpdateState::Staging);
                let task = tokio::spawn(self.clone().staging_task(false));
                inner.track(task);
            }
            ReadyAction::CrashReset => {
                warn!("The apply process crashed while staging");
                if let Some(ready) = inner.store.ready_update_mut() {
                    ready.mark_failed(codes::ERR_UPDATER_CRASHED);
                }
                self.cleanup_active_updates_locked(inner).await;
            }
            ReadyAction::CleanupReady => self.cleanup_ready_update_locked(inner),
            ReadyAction::Succeeded { synthesize } => self.record_success_locked(inner, synthesize),
            ReadyAction::PendingElevate | ReadyAction::VerifyPending => {
                self.transition(UpdateState::Pending);
            }
            ReadyAction::Failed { error_code } => {
                let code = error_code.unwrap_or(codes::INVALID_UPDATER_STATUS_CODE);
                info!("Install failed with code {}", code);
                if let Some(ready) = inner.store.ready_update_mut() {
                    ready.mark_failed(code);
                }
                inner.store.save_updates();
                if !self.handle_failure_locked(inner, code) {
                    self.fallback_to_complete_locked(inner).await;
                }
            }
        }
    }

    fn record_success_locked(&self, inner: &mut Inner, synthesize: bool) {
        let update = inner
            .store
            .take_ready()
            .or_else(|| synthesize.then(|| self.synthesized_record(None)));
        if let Some(mut update) = update {
            info!("Update {} installed", update.describe());
            update.set_state(UpdateStatus::Succeeded);
            update.status_text = Some("Install succeeded".to_string());
            inner.store.add_to_history(&update);
        }
        inner.prefs.update(|p| {
            p.clear_download_attempts();
            p.elevate_attempts = 0;
            p.elevate_version = None;
            p.elevate_never = false;
            p.clear_cancelations();
        });
        inner.store.save_updates();
        inner.store.clean_up_ready_dir(true);
        self.transition(UpdateState::Idle);
    }

    // ---- checks ----

    fn check(self: Arc<Self>, kind: CheckKind) -> BoxFuture<'static, CheckOutcome> {
        async move {
            let handle = self.checker.check(kind).await;
            let result = handle.result().await;
            self.emit(UpdateEvent::CheckComplete {
                updates: if result.succeeded { result.updates.len() } else { 0 },
                error_code: result.error_code(),
            });

            if !result.checks_allowed {
                return CheckOutcome::NotAllowed;
            }
            if let Some(error) = result.error {
                return self.check_failed(kind, error).await;
            }

            let mut inner = self.inner.lock().await;
            if kind == CheckKind::Background && inner.prefs.get().background_errors > 0 {
                inner.prefs.update(|p| p.background_errors = 0);
            }

            let app = &self.host.app;
            let running = Baseline { version: &app.version, build_id: Some(&app.build_id) };
            let selected = select_update(result.updates, running, inner.store.ready_update());
            let Some(mut update) = selected else {
                debug!("No update to offer");
                return CheckOutcome::NoUpdate;
            };
            apply_elevation_gate(
                &mut update,
                &mut inner.prefs,
                &self.config.elevation,
                self.host.privileges.elevation_required(),
            );

            let version = update.app_version.clone().unwrap_or_default();
            let reason = if update.unsupported {
                Some(AvailableReason::Unsupported)
            } else if !self.host.privileges.can_apply() {
                Some(AvailableReason::CantApply)
            } else if update.elevation_failure {
                Some(AvailableReason::ElevationFailure)
            } else if kind == CheckKind::Foreground || !self.config.auto_download || inner.lock.is_none() {
                Some(AvailableReason::ShowPrompt)
            } else if inner
                .prefs
                .get()
                .download_attempts_exhausted(update.app_version.as_deref(), self.config.download.effective_max_attempts())
            {
                info!("Downloads of {} keep failing, leaving it to the user", update.describe());
                Some(AvailableReason::ShowPrompt)
            } else {
                None
            };
            if let Some(reason) = reason {
                info!("Update {} available ({:?})", update.describe(), reason);
                self.emit(UpdateEvent::UpdateAvailable { version, reason });
                return CheckOutcome::Available { update, reason };
            }

            match self.start_download(&mut inner, Some(update.clone()), false).await {
                DownloadStart::Started | DownloadStart::AlreadyDownloading => {
                    CheckOutcome::Downloading { version }
                }
                DownloadStart::AlreadyDownloaded => CheckOutcome::AlreadyDownloaded { version },
                other => {
                    warn!("Background download of {} did not start: {:?}", version, other);
                    self.cleanup_downloading_update_locked(&mut inner).await;
                    let reason = AvailableReason::ShowPrompt;
                    self.emit(UpdateEvent::UpdateAvailable { version, reason });
                    CheckOutcome::Available { update, reason }
                }
            }
        }
        .boxed()
    }

    async fn check_failed(self: &Arc<Self>, kind: CheckKind, error: CheckError) -> CheckOutcome {
        let code = error.code();
        warn!("Update check failed: {} ({})", error, code);
        let mut inner = self.inner.lock().await;

        if kind == CheckKind::Background {
            if error == CheckError::Offline {
                info!("Offline, checking again when the network is back");
                let task = tokio::spawn(self.clone().recheck_when_online());
                inner.track(task);
            } else {
                let errors = inner.prefs.update(|p| {
                    p.background_errors += 1;
                    p.background_errors
                });
                if errors >= self.config.check.effective_background_max_errors() {
                    self.emit(UpdateEvent::CheckAttemptsExceeded { errors });
                } else {
                    self.emit(UpdateEvent::CheckAttemptFailed { errors });
                }
            }
        }
        self.emit(UpdateEvent::UpdateError { version: None, reason: ErrorReason::CheckFailed, code });
        CheckOutcome::Failed { code }
    }

    fn recheck_when_online(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.host.network.wait_online().await;
            info!("Network is back, checking for updates");
            let outcome = self.check(CheckKind::Background).await;
            debug!("Check after reconnect: {:?}", outcome);
        }
        .boxed()
    }

    // ---- downloads ----

    async fn start_download(
        self: &Arc<Self>,
        inner: &mut Inner,
        update: Option<UpdateRecord>,
        foreground: bool,
    ) -> DownloadStart {
        if inner.lock.is_none() {
            warn!("Not downloading without the update lock");
            return DownloadStart::Failed;
        }

        if let Some(update) = update {
            let same = |other: &UpdateRecord| {
                other.app_version == update.app_version && other.build_id == update.build_id
            };
            let same_as_downloading = inner.store.downloading_update().map(same).unwrap_or(false);
            if inner.download.is_some() {
                if same_as_downloading {
                    debug!("{} is already downloading", update.describe());
                    return DownloadStart::AlreadyDownloading;
                }
                self.cancel_active_locked(inner).await;
            }
            if self.config.background_task
                && update.properties.get(props::DISABLE_BACKGROUND_UPDATES) == Some("true")
            {
                info!("{} opts out of background downloads", update.describe());
                return DownloadStart::Failed;
            }
            if !same_as_downloading {
                if let Some(old) = inner.store.set_downloading(Some(update)) {
                    info!("Replacing downloading update {}", old.describe());
                    inner.store.add_to_history(&old);
                    inner.store.clean_up_downloading_dir();
                }
            }
        } else if inner.download.is_some() {
            return DownloadStart::AlreadyDownloading;
        }

        let has_ready = inner.store.ready_update().is_some();
        let selection = match inner.store.downloading_update_mut() {
            Some(update) => select_patch(update, has_ready),
            None => return DownloadStart::NothingToDownload,
        };
        debug!("Patch selection {:?}", selection);
        let index = match selection {
            PatchSelection::AlreadyDownloaded => return DownloadStart::AlreadyDownloaded,
            PatchSelection::CompleteFailed => {
                info!("The complete patch already failed, not downloading again");
                return DownloadStart::Failed;
            }
            PatchSelection::NothingToDownload => {
                if let Some(update) = inner.store.take_downloading() {
                    info!("Nothing to download for {}", update.describe());
                }
                inner.store.save_updates();
                return DownloadStart::NothingToDownload;
            }
            other => match other.patch_index() {
                Some(index) => index,
                None => return DownloadStart::NothingToDownload,
            },
        };

        let availability = probe_native(
            &self.config,
            self.native.is_some(),
            self.native_in_use_by_other_user.load(Ordering::SeqCst),
        );
        let Some(update) = inner.store.downloading_update() else {
            return DownloadStart::NothingToDownload;
        };
        let Some(patch) = update.patches.get(index) else {
            return DownloadStart::NothingToDownload;
        };
        let mut kind = choose_backend(availability, update, patch);
        let request = TransferRequest {
            url: patch.url.clone(),
            dest: self.dirs.downloading_patch(),
            size: patch.size,
            foreground,
        };
        let job_id = patch.properties.get(props::NATIVE_JOB_ID).map(str::to_string);
        let version = update.app_version.clone().unwrap_or_default();
        info!("Downloading {} patch of {} with {} transfer", patch.patch_type.as_str(), version, kind);

        if !has_ready {
            if let Err(e) = inner.store.write_status(UpdateStatus::Downloading) {
                warn!("Unable to write downloading status: {}", e);
                return DownloadStart::Failed;
            }
        }
        if let Some(update) = inner.store.downloading_update_mut() {
            update.set_state(UpdateStatus::Downloading);
        }
        inner.store.save_updates();
        if let Err(e) = std::fs::create_dir_all(self.dirs.downloading_dir()) {
            warn!("Unable to create download dir: {}", e);
            return DownloadStart::Failed;
        }

        let handle = loop {
            let started = match (kind, &self.native) {
                (BackendKind::Native, Some(native)) => match &job_id {
                    Some(id) => native.resume(id, request.clone()).await,
                    None => native.start(request.clone()).await,
                },
                _ => self.chunked.start(request.clone()).await,
            };
            match started {
                Ok(handle) => break handle,
                Err(e) if kind == BackendKind::Native => {
                    warn!("Native transfer did not start: {}, falling back to chunked", e);
                    if matches!(e, TransferError::AccessDenied) {
                        self.native_in_use_by_other_user.store(true, Ordering::SeqCst);
                    }
                    if let Some(patch) = inner.store.downloading_update_mut().and_then(|u| u.selected_patch_mut()) {
                        patch.properties.set_known(props::NATIVE_RESULT, e.to_string());
                        patch.properties.remove_known(props::NATIVE_JOB_ID);
                    }
                    kind = BackendKind::Chunked;
                }
                Err(e) => {
                    warn!("Download did not start: {}", e);
                    return DownloadStart::Failed;
                }
            }
        };

        if let Some(patch) = inner.store.downloading_update_mut().and_then(|u| u.selected_patch_mut()) {
            match handle.job_id() {
                Some(job) => patch.properties.set_known(props::NATIVE_JOB_ID, job),
                None => patch.properties.remove_known(props::NATIVE_JOB_ID),
            }
        }
        inner.store.save_updates();

        handle.set_poll_interval(if self.listeners.load(Ordering::SeqCst) > 0 {
            ACTIVE_POLL_INTERVAL
        } else {
            IDLE_POLL_INTERVAL
        });
        let id = self.next_download.fetch_add(1, Ordering::SeqCst);
        let (events, canceller) = handle.into_parts();
        inner.download = Some(ActiveDownload { id, backend: kind, canceller: canceller.clone() });

        if matches!(self.current_state(), UpdateState::Idle | UpdateState::Downloading) {
            self.transition(UpdateState::Downloading);
        }
        self.emit(UpdateEvent::DownloadStarted { version: version.clone(), backend: kind.into() });
        self.emit(UpdateEvent::UpdateDownloading { version });

        let task = tokio::spawn(self.clone().drive(id, kind, request.size, events, canceller));
        inner.track(task);
        DownloadStart::Started
    }

    /// Feeds transfer events through a [`DownloadSession`] until it stops.
    fn drive(
        self: Arc<Self>,
        id: u64,
        backend: BackendKind,
        patch_size: u64,
        mut events: mpsc::Receiver<TransferEvent>,
        canceller: TransferCanceller,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut session = DownloadSession::new(backend, patch_size);
            loop {
                let event = match events.recv().await {
                    Some(event) => event,
                    None => {
                        warn!("Transfer {} ended without a stop event", id);
                        TransferEvent::Stopped(TransferStatus::Failed("transfer channel closed".to_string()))
                    }
                };
                match session.step(event) {
                    StepAction::Started { final_url } => self.on_started(id, final_url).await,
                    StepAction::Progress(progress) => self.on_progress(id, progress).await,
                    StepAction::Cancel(status) => {
                        if let Err(e) = canceller.cancel(status).await {
                            warn!("Unable to cancel transfer {}: {}", id, e);
                        }
                    }
                    StepAction::Stopped(status) => {
                        self.on_stop(id, status).await;
                        return;
                    }
                }
            }
        }
        .boxed()
    }

    async fn on_started(&self, id: u64, final_url: String) {
        let mut inner = self.inner.lock().await;
        if inner.download.as_ref().map(|d| d.id) != Some(id) {
            return;
        }
        debug!("Transfer {} resolved to {}", id, final_url);
        if let Some(patch) = inner.store.downloading_update_mut().and_then(|u| u.selected_patch_mut()) {
            patch.final_url = Some(final_url);
        }
        inner.store.save_updates();
    }

    async fn on_progress(&self, id: u64, progress: DownloadProgress) {
        let mut inner = self.inner.lock().await;
        if inner.download.as_ref().map(|d| d.id) != Some(id) {
            return;
        }
        inner.consecutive_socket_errors = 0;
        debug!("Download progress {}", progress);
        self.emit(UpdateEvent::DownloadProgress { transferred: progress.downloaded, total: progress.total });
    }

    async fn on_stop(self: &Arc<Self>, id: u64, status: TransferStatus) {
        let mut inner = self.inner.lock().await;
        if inner.download.as_ref().map(|d| d.id) != Some(id) {
            debug!("Ignoring stop of superseded transfer {}", id);
            return;
        }
        let Some(active) = inner.download.take() else {
            return;
        };
        info!("Download stopped: {}", status);
        self.emit(UpdateEvent::download_stopped(&status));

        if status.is_success() && inner.only_download_updates_this_session {
            info!("Leaving the finished download in place until restart");
            return;
        }

        let mut status = status;
        if active.backend == BackendKind::Native {
            if status.is_success() {
                if let Err(e) = active.canceller.complete().await {
                    warn!("Unable to complete native job: {}", e);
                    status = TransferStatus::Failed(e.to_string());
                }
            } else if !status.is_cancelled() {
                if let Err(e) = active.canceller.cancel(status.clone()).await {
                    debug!("Ignoring failure to drop native job: {}", e);
                }
            }
        }

        let Some(update) = inner.store.downloading_update() else {
            warn!("Transfer finished without a downloading update");
            return;
        };
        let mut class = if status.is_success() {
            match update.selected_patch() {
                Some(patch) => match self.host.verifier.verify(&self.dirs.downloading_patch(), patch) {
                    Ok(()) => StopClass::Success,
                    Err(e) => {
                        warn!("Downloaded patch failed verification: {}", e);
                        StopClass::Corrupted
                    }
                },
                None => StopClass::OtherFailure,
            }
        } else {
            classify_stop(
                &status,
                inner.consecutive_socket_errors,
                self.config.network.effective_socket_max_errors(),
                self.host.network.is_offline(),
            )
        };

        if class == StopClass::Success {
            match self.promote_download_locked(&mut inner) {
                Ok(()) => return,
                Err(e) => {
                    warn!("Unable to move the patch into place: {}", e);
                    class = StopClass::MoveFailed;
                }
            }
        }
        self.handle_stop_failure_locked(&mut inner, active.backend, &status, class).await;
    }

    /// Moves a verified patch into the ready dir and marks it pending,
    /// swapping out any ready update.
    fn promote_download_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<(), UpdateError> {
        let had_ready = inner.store.ready_update().is_some();
        let version = inner
            .store
            .downloading_update()
            .and_then(|u| u.app_version.clone())
            .unwrap_or_default();
        if had_ready {
            info!("Replacing the ready update with {}", version);
            self.transition(UpdateState::Swap);
            self.emit(UpdateEvent::UpdateSwap { version: version.clone() });
        }

        inner.store.clean_up_ready_dir(true);
        if let Err(e) = inner.store.move_download_to_ready() {
            if had_ready {
                // The old ready patch is gone already.
                if let Some(old) = inner.store.take_ready() {
                    inner.store.add_to_history(&old);
                }
                inner.store.remove_status();
            }
            return Err(e);
        }

        let state = self.best_pending_state(inner.prefs.get());
        inner.store.write_status(state)?;
        inner.store.write_version(Some(&version))?;
        if let Some(update) = inner.store.downloading_update_mut() {
            update.set_state(state);
            update.install_date = chrono::Utc::now().timestamp_millis();
            update.status_text = Some("Install pending".to_string());
        }
        if let Some(old) = inner.store.promote_downloading() {
            debug!("Dropped ready update {}", old.describe());
        }
        inner.prefs.update(UpdatePrefs::clear_download_attempts);
        inner.consecutive_socket_errors = 0;
        inner.swapped_this_session |= had_ready;
        inner.store.save_updates();
        inner.store.clean_up_downloading_dir();

        if self.can_stage() {
            self.start_staging_locked(inner);
        } else {
            self.transition(UpdateState::Pending);
            self.emit(UpdateEvent::UpdateDownloaded { version, state });
        }
        Ok(())
    }

    async fn handle_stop_failure_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        backend: BackendKind,
        status: &TransferStatus,
        class: StopClass,
    ) {
        let Some(update) = inner.store.downloading_update() else {
            return;
        };
        let decision = decide_stop(class, backend, update.is_complete_update, update.patch_count());
        let version = update.app_version.clone();
        let has_ready = inner.store.ready_update().is_some();
        debug!("Stop {:?} on {} -> {:?}", class, backend, decision);

        if let Some(update) = inner.store.downloading_update_mut() {
            if let Some(patch) = update.selected_patch_mut() {
                patch.properties.set_known(result_property(backend), status.to_string());
            }
            if decision.download_failed {
                update.set_state(UpdateStatus::DownloadFailed);
            }
        }

        match decision.action {
            StopAction::Promote => {}
            StopAction::Cancelled => {
                info!("Download cancelled");
                let next = self.idle_or_pending(inner);
                self.transition(next);
            }
            StopAction::WaitOnline => {
                info!("Offline, resuming the download when the network is back");
                let task = tokio::spawn(self.clone().resume_when_online());
                inner.track(task);
            }
            StopAction::RetrySoon => {
                inner.consecutive_socket_errors += 1;
                let delay = self.config.network.effective_socket_retry_timeout();
                info!(
                    "Socket error {} of {}, retrying in {:?}",
                    inner.consecutive_socket_errors,
                    self.config.network.effective_socket_max_errors(),
                    delay
                );
                let task = tokio::spawn(self.clone().resume_after(delay));
                inner.track(task);
            }
            StopAction::RetryChunked | StopAction::FallBackToComplete => {
                inner.store.save_updates();
                if self.start_download(inner, None, false).await != DownloadStart::Started {
                    self.cleanup_downloading_update_locked(inner).await;
                }
            }
            StopAction::GiveUp => {
                let attempts = inner.prefs.update(|p| {
                    if p.download_version != version {
                        p.download_attempts = 0;
                        p.download_version = version.clone();
                    }
                    p.download_attempts += 1;
                    p.download_attempts
                });
                if attempts > self.config.download.effective_max_attempts() {
                    self.emit(UpdateEvent::DownloadAttemptsExceeded { attempts });
                } else {
                    self.emit(UpdateEvent::DownloadAttemptFailed { attempts });
                }
                let (reason, code) = if class == StopClass::PermissionDenied {
                    (ErrorReason::AccessDenied, codes::DOWNLOAD_ACCESS_DENIED)
                } else {
                    (ErrorReason::DownloadFailed, codes::DOWNLOAD_FAILED)
                };
                self.emit(UpdateEvent::UpdateError { version, reason, code });
            }
        }

        if decision.discard {
            if let Some(mut update) = inner.store.take_downloading() {
                update.install_date = chrono::Utc::now().timestamp_millis();
                inner.store.add_to_history(&update);
            }
            inner.store.clean_up_downloading_dir();
            if !has_ready {
                inner.store.remove_status();
            }
            let next = self.idle_or_pending(inner);
            self.transition(next);
        }
        inner.store.save_updates();
    }

    fn resume_when_online(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.host.network.wait_online().await;
            info!("Network is back, resuming download");
            self.resume_download().await;
        }
        .boxed()
    }

    fn resume_after(self: Arc<Self>, delay: Duration) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            self.resume_download().await;
        }
        .boxed()
    }

    async fn resume_download(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.download.is_some() || inner.store.downloading_update().is_none() {
            return;
        }
        match self.start_download(&mut inner, None, false).await {
            DownloadStart::Started | DownloadStart::AlreadyDownloading => {}
            other => {
                warn!("Could not resume download: {:?}", other);
                self.cleanup_downloading_update_locked(&mut inner).await;
            }
        }
    }

    // ---- staging ----

    fn start_staging_locked(self: &Arc<Self>, inner: &mut Inner) {
        if let Err(e) = inner.store.write_status(UpdateStatus::Applying) {
            warn!("Unable to write applying status, skipping staging: {}", e);
            self.transition(UpdateState::Pending);
            return;
        }
        // The record stays pending; startup marks it applying the first
        // time it finds this status.
        self.transition(UpdateState::Staging);
        let task = tokio::spawn(self.clone().staging_task(true));
        inner.track(task);
    }

    /// Launches staging, or waits for a run started by an earlier process,
    /// then refreshes from the status file.
    fn staging_task(self: Arc<Self>, launch: bool) -> BoxFuture<'static, ()> {
        async move {
            let ready_dir = self.dirs.ready_dir();
            if launch {
                if let Some(apply) = &self.host.apply {
                    if let Err(e) = apply.stage(&ready_dir).await {
                        warn!("Staging did not run: {}", e);
                        let inner = self.inner.lock().await;
                        let state = self.best_pending_state(inner.prefs.get());
                        if let Err(e) = inner.store.write_status(state) {
                            warn!("Unable to restore pending status: {}", e);
                        }
                    }
                }
            } else {
                wait_for_staging_end(&ready_dir, &self.config.staging).await;
            }
            self.refresh_update_status().await;
        }
        .boxed()
    }

    async fn refresh_update_status(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.store.ready_update().is_none() {
            warn!("No ready update after staging");
            let next = self.idle_or_pending(&inner);
            self.transition(next);
            return;
        }
        let raw = inner.store.read_status();
        let result = classify_staging_result(&raw, self.service_in_use(inner.prefs.get()));
        info!("Staging finished with {} ({:?})", raw, result);
        inner.store.clean_up_ready_dir(false);

        let state = match result {
            StagingResult::Settled { state, rewrite } => {
                if rewrite {
                    if let Err(e) = inner.store.write_status(state) {
                        warn!("Unable to write status: {}", e);
                    }
                }
                state
            }
            StagingResult::RetryPending { code } => {
                info!("Staging error {} is transient, will retry", code);
                let state = self.best_pending_state(inner.prefs.get());
                if let Err(e) = inner.store.write_status(state) {
                    warn!("Unable to write status: {}", e);
                }
                state
            }
            StagingResult::PendingWithoutService { code } => {
                info!("Update service failed with {}, applying without it", code);
                if let Err(e) = inner.store.write_status(UpdateStatus::Pending) {
                    warn!("Unable to write status: {}", e);
                }
                UpdateStatus::Pending
            }
            StagingResult::Failed { code } => {
                if let Some(ready) = inner.store.ready_update_mut() {
                    ready.mark_failed(code);
                }
                if let Err(e) = inner.store.write_status(StatusToken::failed(code)) {
                    warn!("Unable to write status: {}", e);
                }
                inner.store.save_updates();
                if !self.handle_failure_locked(&mut inner, code) {
                    self.fallback_to_complete_locked(&mut inner).await;
                }
                inner.store.save_updates();
                return;
            }
        };

        let version = match inner.store.ready_update_mut() {
            Some(ready) => {
                ready.set_state(state);
                ready.app_version.clone().unwrap_or_default()
            }
            None => String::new(),
        };
        inner.store.save_updates();
        if state.is_applied() && inner.swapped_this_session {
            info!("A second update was staged, only downloading until restart");
            inner.only_download_updates_this_session = true;
        }
        self.transition(UpdateState::Pending);
        self.emit(UpdateEvent::UpdateStaged { version, state });
    }

    // ---- failures ----

    /// Handles install failures that can be retried from the ready slot.
    /// Returns false when the caller should fall back to the complete patch.
    fn handle_failure_locked(&self, inner: &mut Inner, code: i32) -> bool {
        let tables = &self.config.apply_errors;

        if tables.is_write_error(code) {
            let Some(ready) = inner.store.ready_update_mut() else {
                return false;
            };
            let attempts = ready
                .selected_patch()
                .and_then(|p| p.properties.get(props::TOTAL_INSTALL_ATTEMPTS))
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);
            if attempts >= self.config.apply.max_total_install_attempts {
                info!("Write error {} after {} install attempts, giving up", code, attempts);
                return false;
            }
            if let Some(patch) = ready.selected_patch_mut() {
                patch.properties.set_known(props::TOTAL_INSTALL_ATTEMPTS, (attempts + 1).to_string());
            }
            info!("Write error {}, the install will be retried", code);
            return self.return_to_pending(inner, None);
        }

        if code == codes::SILENT_UPDATE_NEEDED_ELEVATION_ERROR || code == codes::BACKGROUND_TASK_SHARING_VIOLATION {
            return self.return_to_pending(inner, None);
        }

        if code == tables.elevation_canceled {
            let attempts = inner.prefs.update(|p| {
                p.elevate_attempts += 1;
                p.cancelations += 1;
                p.elevate_attempts
            });
            if attempts > self.config.elevation.effective_max_attempts() {
                self.emit(UpdateEvent::ElevationAttemptsExceeded { attempts });
            } else {
                self.emit(UpdateEvent::ElevationAttemptFailed { attempts });
            }
            if self.config.elevation.gate_enabled {
                let gated = inner.prefs.update(|p| {
                    p.cancelations_gated += 1;
                    p.cancelations_gated
                });
                if gated >= self.config.elevation.effective_cancelations_max() {
                    info!("Elevation refused {} times, dropping the ready update", gated);
                    self.cleanup_ready_update_locked(inner);
                    return false;
                }
                return self.return_to_pending(inner, Some(UpdateStatus::PendingElevate));
            }
            return self.return_to_pending(inner, None);
        }

        let prefs = inner.prefs.get();
        if prefs.cancelations > 0 || prefs.cancelations_gated > 0 {
            inner.prefs.update(UpdatePrefs::clear_cancelations);
        }

        if tables.is_service_error(code) {
            let max = self.config.service.effective_max_errors();
            inner.prefs.update(|p| {
                if p.service_errors >= max {
                    warn!("Update service failed {} times, disabling it", p.service_errors + 1);
                    p.service_disabled = true;
                    p.service_errors = 0;
                } else {
                    p.service_errors += 1;
                }
            });
            return self.return_to_pending(inner, Some(UpdateStatus::Pending));
        }

        if inner.prefs.get().service_errors > 0 {
            inner.prefs.update(|p| p.service_errors = 0);
        }
        false
    }

    fn return_to_pending(&self, inner: &mut Inner, state: Option<UpdateStatus>) -> bool {
        let state = state.unwrap_or_else(|| self.best_pending_state(inner.prefs.get()));
        if let Err(e) = inner.store.write_status(state) {
            warn!("Unable to write {} status: {}", state, e);
            return false;
        }
        if let Some(ready) = inner.store.ready_update_mut() {
            ready.set_state(state);
        }
        inner.store.save_updates();
        self.transition(UpdateState::Pending);
        true
    }

    /// After a failed install: download the complete patch when the
    /// partial one failed, otherwise give up on the update.
    async fn fallback_to_complete_locked(self: &Arc<Self>, inner: &mut Inner) {
        let update = inner.store.downloading_update().or(inner.store.ready_update()).cloned();
        let Some(mut update) = update else {
            debug!("No update to fall back from");
            return;
        };
        self.cleanup_active_updates_locked(inner).await;

        if update.selected_patch().is_none() {
            if let Some(partial) = update.patches.iter_mut().find(|p| p.patch_type == PatchType::Partial) {
                partial.selected = true;
            }
        }
        let partial_failed =
            update.selected_patch().map(|p| p.patch_type == PatchType::Partial).unwrap_or(false);
        if partial_failed && update.patch_count() == 2 {
            info!("Partial patch of {} failed, downloading the complete patch", update.describe());
            if self.start_download(inner, Some(update), false).await != DownloadStart::Started {
                self.cleanup_downloading_update_locked(inner).await;
            }
        } else {
            info!("Install of {} failed, giving up", update.describe());
            self.transition(UpdateState::Idle);
            self.emit(UpdateEvent::UpdateError {
                version: update.app_version.clone(),
                reason: ErrorReason::ApplyFailed,
                code: update.error_code(),
            });
        }
    }

    // ---- cleanup ----

    async fn cancel_active_locked(&self, inner: &mut Inner) {
        if let Some(active) = inner.download.take() {
            info!("Cancelling {} transfer {}", active.backend, active.id);
            if let Err(e) = active.canceller.cancel(TransferStatus::Cancelled).await {
                warn!("Unable to cancel transfer: {}", e);
            }
        }
    }

    fn cleanup_ready_update_locked(&self, inner: &mut Inner) {
        let was_downloading = inner.store.read_status() == UpdateStatus::Downloading.as_str();
        if let Some(ready) = inner.store.take_ready() {
            info!("Cleaning up ready update {}", ready.describe());
            inner.store.add_to_history(&ready);
        }
        inner.store.save_updates();
        inner.store.clean_up_ready_dir(true);

        if inner.store.downloading_update().is_some() || was_downloading {
            if let Err(e) = inner.store.write_status(UpdateStatus::Downloading) {
                warn!("Unable to write downloading status: {}", e);
            }
            self.transition(UpdateState::Downloading);
        } else {
            self.transition(UpdateState::Idle);
        }
    }

    async fn cleanup_downloading_update_locked(&self, inner: &mut Inner) {
        self.cancel_active_locked(inner).await;
        if let Some(downloading) = inner.store.take_downloading() {
            info!("Cleaning up downloading update {}", downloading.describe());
            inner.store.add_to_history(&downloading);
        }
        inner.store.save_updates();
        inner.store.clean_up_downloading_dir();

        if self.current_state() == UpdateState::Downloading {
            if inner.store.ready_update().is_none() {
                inner.store.remove_status();
            }
            let next = self.idle_or_pending(inner);
            self.transition(next);
        }
    }

    async fn cleanup_active_updates_locked(&self, inner: &mut Inner) {
        self.cancel_active_locked(inner).await;
        for update in [inner.store.take_ready(), inner.store.take_downloading()].into_iter().flatten() {
            inner.store.add_to_history(&update);
        }
        inner.store.save_updates();
        inner.store.clean_up_ready_dir(true);
        inner.store.clean_up_downloading_dir();
        self.transition(UpdateState::Idle);
    }
}
