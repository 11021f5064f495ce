//! Durable update state.
//!
//! [`UpdateStateStore`] owns the two update slots, the history list, and
//! every file under the update root:
//!
//! ```text
//! <root>/active-update.xml       ready update first, then downloading update
//! <root>/updates.xml             history, newest first
//! <root>/updates/0/              ready dir: update.patch, update.status, update.version, logs
//! <root>/updates/downloading/    partial download
//! <root>/updates/last-update.log, backup-update.log, ...
//! ```
//!
//! Record writes are debounced; status writes are immediate.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::record::{parse_document, to_document, RecordDefaults, UpdateDocument, UpdateRecord};
use crate::status::{self, StatusToken, UpdateState, UpdateStatus};

/// Active records file name.
pub const ACTIVE_UPDATE_FILE: &str = "active-update.xml";
/// History file name.
pub const HISTORY_FILE: &str = "updates.xml";
/// Patch file name in the ready and downloading dirs.
pub const PATCH_FILE: &str = "update.patch";
/// Maximum number of history entries.
pub const HISTORY_LIMIT: usize = 10;

const UPDATE_LOG: &str = "update.log";
const UPDATE_ELEVATED_LOG: &str = "update-elevated.log";
const LAST_UPDATE_LOG: &str = "last-update.log";
const LAST_UPDATE_ELEVATED_LOG: &str = "last-update-elevated.log";
const BACKUP_UPDATE_LOG: &str = "backup-update.log";
const BACKUP_UPDATE_ELEVATED_LOG: &str = "backup-update-elevated.log";

/// Paths under the update root.
#[derive(Debug, Clone)]
pub struct UpdateDirs {
    root: PathBuf,
}

impl UpdateDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    pub fn ready_dir(&self) -> PathBuf {
        self.updates_dir().join("0")
    }

    pub fn downloading_dir(&self) -> PathBuf {
        self.updates_dir().join("downloading")
    }

    pub fn ready_patch(&self) -> PathBuf {
        self.ready_dir().join(PATCH_FILE)
    }

    pub fn downloading_patch(&self) -> PathBuf {
        self.downloading_dir().join(PATCH_FILE)
    }

    pub fn active_file(&self) -> PathBuf {
        self.root.join(ACTIVE_UPDATE_FILE)
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("update.lock")
    }

    pub fn prefs_file(&self) -> PathBuf {
        self.root.join("prefs.json")
    }
}

#[derive(Debug, Default)]
struct PendingWrite {
    active: Option<UpdateDocument>,
    history: Option<UpdateDocument>,
    armed: bool,
}

/// Coalesces record writes that happen within `interval` of each other.
#[derive(Debug, Clone)]
struct DebouncedWriter {
    active_path: PathBuf,
    history_path: PathBuf,
    interval: Duration,
    pending: Arc<Mutex<PendingWrite>>,
}

impl DebouncedWriter {
    fn new(dirs: &UpdateDirs, interval: Duration) -> Self {
        Self {
            active_path: dirs.active_file(),
            history_path: dirs.history_file(),
            interval,
            pending: Arc::new(Mutex::new(PendingWrite::default())),
        }
    }

    fn schedule(&self, active: UpdateDocument, history: Option<UpdateDocument>) {
        let arm = {
            let Ok(mut pending) = self.pending.lock() else {
                warn!("Update writer lock poisoned, dropping save");
                return;
            };
            pending.active = Some(active);
            if history.is_some() {
                pending.history = history;
            }
            !std::mem::replace(&mut pending.armed, true)
        };
        if !arm {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(writer.interval).await;
                    if let Err(e) = writer.flush() {
                        warn!("Failed to save update records: {}", e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = self.flush() {
                    warn!("Failed to save update records: {}", e);
                }
            }
        }
    }

    /// Writes whatever is pending right now.
    fn flush(&self) -> Result<(), UpdateError> {
        let (active, history) = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| UpdateError::ConfigError("update writer lock poisoned".into()))?;
            pending.armed = false;
            (pending.active.take(), pending.history.take())
        };
        if let Some(active) = active {
            write_document(&self.active_path, &active)?;
        }
        if let Some(history) = history {
            write_document(&self.history_path, &history)?;
        }
        Ok(())
    }
}

/// Writes `doc` atomically, or removes the file when `doc` is empty.
fn write_document(path: &Path, doc: &UpdateDocument) -> Result<(), UpdateError> {
    if doc.updates.is_empty() {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed empty record file {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("xml.tmp");
    std::fs::write(&tmp, doc.to_xml()?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Owner of the update slots, history, and on-disk update files.
pub struct UpdateStateStore {
    dirs: UpdateDirs,
    defaults: RecordDefaults,
    ready: Option<UpdateRecord>,
    downloading: Option<UpdateRecord>,
    history: Option<Vec<UpdateRecord>>,
    history_dirty: bool,
    installed_at_startup: Option<UpdateRecord>,
    writer: DebouncedWriter,
}

impl UpdateStateStore {
    pub fn new(dirs: UpdateDirs, defaults: RecordDefaults, save_interval: Duration) -> Self {
        let writer = DebouncedWriter::new(&dirs, save_interval);
        Self {
            dirs,
            defaults,
            ready: None,
            downloading: None,
            history: None,
            history_dirty: false,
            installed_at_startup: None,
            writer,
        }
    }

    pub fn dirs(&self) -> &UpdateDirs {
        &self.dirs
    }

    pub fn defaults(&self) -> &RecordDefaults {
        &self.defaults
    }

    /// Re-reads the active records and the status file.
    ///
    /// With `skip_files` the slots and history are simply cleared. Returns
    /// the global state implied by what was loaded.
    pub fn reload(&mut self, skip_files: bool) -> UpdateState {
        info!("Reloading update data");
        self.ready = None;
        self.downloading = None;
        self.installed_at_startup = None;
        self.history_dirty = skip_files;
        let mut state = UpdateState::Idle;

        if skip_files {
            self.history = Some(Vec::new());
            return state;
        }

        let mut active = self.load_file(&self.dirs.active_file()).into_iter();
        let raw_status = status::read_status(&self.dirs.ready_dir());
        let token = raw_status.parse::<StatusToken>().ok();
        let status = token.map(|t| t.status);

        match (active.next(), active.next()) {
            (Some(first), Some(second)) => {
                if active.next().is_some() {
                    warn!("Ignoring unexpected extra active updates");
                }
                self.ready = Some(first);
                self.downloading = Some(second);
            }
            (Some(only), None) => {
                if status == Some(UpdateStatus::Downloading)
                    || only.state() == UpdateStatus::Downloading
                {
                    self.downloading = Some(only);
                    state = UpdateState::Downloading;
                } else {
                    self.ready = Some(only);
                }
            }
            _ => {}
        }

        if self.ready.is_some() || self.downloading.is_some() {
            debug!("Reloaded status {}", raw_status);
            if status.map(UpdateStatus::is_downloaded).unwrap_or(false) {
                state = UpdateState::Pending;
            }
            if status == Some(UpdateStatus::Succeeded) {
                self.installed_at_startup = self.ready.clone();
            }
        }

        self.history = Some(self.load_file(&self.dirs.history_file()));
        state
    }

    /// Loads a record file. Unreadable files load as empty; files without a
    /// single valid record are removed.
    fn load_file(&self, path: &Path) -> Vec<UpdateRecord> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Record file {:?} does not exist", path);
                return Vec::new();
            }
            Err(e) => {
                warn!("Unable to read record file {:?}: {}", path, e);
                return Vec::new();
            }
        };

        let updates = match parse_document(&bytes, &self.defaults) {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Unable to parse record file {:?}: {}", path, e);
                Vec::new()
            }
        };

        if updates.is_empty() {
            info!("Record file {:?} has no valid updates, removing it", path);
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Unable to remove record file {:?}: {}", path, e);
            }
        }
        updates
    }

    pub fn ready_update(&self) -> Option<&UpdateRecord> {
        self.ready.as_ref()
    }

    pub fn ready_update_mut(&mut self) -> Option<&mut UpdateRecord> {
        self.ready.as_mut()
    }

    pub fn downloading_update(&self) -> Option<&UpdateRecord> {
        self.downloading.as_ref()
    }

    pub fn downloading_update_mut(&mut self) -> Option<&mut UpdateRecord> {
        self.downloading.as_mut()
    }

    pub fn set_ready(&mut self, update: Option<UpdateRecord>) -> Option<UpdateRecord> {
        std::mem::replace(&mut self.ready, update)
    }

    pub fn set_downloading(&mut self, update: Option<UpdateRecord>) -> Option<UpdateRecord> {
        std::mem::replace(&mut self.downloading, update)
    }

    pub fn take_ready(&mut self) -> Option<UpdateRecord> {
        self.ready.take()
    }

    pub fn take_downloading(&mut self) -> Option<UpdateRecord> {
        self.downloading.take()
    }

    /// Moves the downloading update into the ready slot, returning the
    /// update it replaced.
    pub fn promote_downloading(&mut self) -> Option<UpdateRecord> {
        let downloading = self.downloading.take();
        std::mem::replace(&mut self.ready, downloading)
    }

    /// Number of occupied slots, 0 to 2.
    pub fn slot_count(&self) -> usize {
        usize::from(self.ready.is_some()) + usize::from(self.downloading.is_some())
    }

    /// Update found as `succeeded` by the last reload.
    pub fn installed_at_startup(&self) -> Option<&UpdateRecord> {
        self.installed_at_startup.as_ref()
    }

    /// History, newest first.
    pub fn history(&mut self) -> &[UpdateRecord] {
        if self.history.is_none() {
            self.history = Some(self.load_file(&self.dirs.history_file()));
        }
        self.history.as_deref().unwrap_or_default()
    }

    /// Prepends a snapshot of `update` to the history and trims it.
    pub fn add_to_history(&mut self, update: &UpdateRecord) {
        self.history();
        if let Some(history) = self.history.as_mut() {
            history.insert(0, update.clone());
            history.truncate(HISTORY_LIMIT);
        }
        self.history_dirty = true;
    }

    /// Schedules a debounced write of the active records, plus the history
    /// when it changed since the last save.
    pub fn save_updates(&mut self) {
        let active = to_document(self.ready.iter().chain(self.downloading.iter()));
        let history = if self.history_dirty {
            self.history_dirty = false;
            Some(to_document(self.history.iter().flatten()))
        } else {
            None
        };
        self.writer.schedule(active, history);
    }

    /// Writes any pending record changes immediately.
    pub fn flush(&self) -> Result<(), UpdateError> {
        self.writer.flush()
    }

    pub fn read_status(&self) -> String {
        status::read_status(&self.dirs.ready_dir())
    }

    pub fn status_file_exists(&self) -> bool {
        status::status_file_exists(&self.dirs.ready_dir())
    }

    pub fn write_status(&self, token: impl Into<StatusToken>) -> Result<(), UpdateError> {
        let token = token.into();
        debug!("Writing status {}", token);
        status::write_status(&self.dirs.ready_dir(), token)
    }

    pub fn write_version(&self, version: Option<&str>) -> Result<(), UpdateError> {
        status::write_version(&self.dirs.ready_dir(), version)
    }

    pub fn remove_status(&self) {
        let path = self.dirs.ready_dir().join(status::STATUS_FILE);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Unable to remove status file {:?}: {}", path, e);
            }
        }
    }

    pub fn ready_patch_exists(&self) -> bool {
        self.dirs.ready_patch().is_file()
    }

    /// Moves the finished download into the ready dir.
    pub fn move_download_to_ready(&self) -> Result<(), UpdateError> {
        let ready_dir = self.dirs.ready_dir();
        std::fs::create_dir_all(&ready_dir)?;
        std::fs::rename(self.dirs.downloading_patch(), self.dirs.ready_patch())?;
        Ok(())
    }

    /// Rotates apply logs and, with `remove_patch_files`, empties the ready
    /// dir.
    pub fn clean_up_ready_dir(&self, remove_patch_files: bool) {
        let ready_dir = self.dirs.ready_dir();
        let updates_dir = self.dirs.updates_dir();
        rotate_logs(&ready_dir, &updates_dir);

        if remove_patch_files {
            remove_dir_contents(&ready_dir);
        }
    }

    /// Empties the downloading dir.
    pub fn clean_up_downloading_dir(&self) {
        remove_dir_contents(&self.dirs.downloading_dir());
    }
}

/// Keeps the last two generations of apply logs, always moving the plain
/// and elevated logs as a pair.
fn rotate_logs(ready_dir: &Path, updates_dir: &Path) {
    let update_log = ready_dir.join(UPDATE_LOG);
    let elevated_log = ready_dir.join(UPDATE_ELEVATED_LOG);
    if !update_log.exists() && !elevated_log.exists() {
        return;
    }

    let overwrite_or_remove = |log: &Path, overwrite: bool, target: &str| {
        let target = updates_dir.join(target);
        if overwrite {
            if let Err(e) = std::fs::rename(log, &target) {
                debug!("Unable to rename {:?} to {:?}: {}", log, target, e);
            }
        } else if let Err(e) = std::fs::remove_file(&target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Unable to remove {:?}: {}", target, e);
            }
        }
    };

    let last_log = updates_dir.join(LAST_UPDATE_LOG);
    let last_elevated = updates_dir.join(LAST_UPDATE_ELEVATED_LOG);
    let last_exists = last_log.exists();
    let last_elevated_exists = last_elevated.exists();
    if last_exists || last_elevated_exists {
        overwrite_or_remove(&last_log, last_exists, BACKUP_UPDATE_LOG);
        overwrite_or_remove(&last_elevated, last_elevated_exists, BACKUP_UPDATE_ELEVATED_LOG);
    }

    overwrite_or_remove(&update_log, update_log.exists(), LAST_UPDATE_LOG);
    overwrite_or_remove(&elevated_log, elevated_log.exists(), LAST_UPDATE_ELEVATED_LOG);
}

fn remove_dir_contents(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Unable to list {:?}: {}", dir, e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!("Unable to remove {:?}: {}", path, e);
        }
    }
}
