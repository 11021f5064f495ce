//! Scriptable collaborators for driving the coordinator in tests.

#![cfg(test)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};

use crate::checker::{CheckError, ManifestFetcher, ManifestResponse};
use crate::config::UpdaterConfig;
use crate::coordinator::{Collaborators, UpdateCoordinator};
use crate::error::UpdateError;
use crate::events::UpdateEvent;
use crate::host::{AppInfo, ApplyLauncher, HostServices, NetworkMonitor, SingleInstance, StaticPrivileges};
use crate::record::{to_document, PatchRecord, PatchType, UpdateRecord, UpdateType};
use crate::status::{write_status, StatusToken, UpdateState, UpdateStatus};
use crate::transfer::{
    BackendKind, TransferBackend, TransferControl, TransferError, TransferEvent, TransferHandle,
    TransferRequest, TransferStatus,
};
use crate::verify::PatchVerifier;

/// Manifest answers handed out in order.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<Bytes, CheckError>>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn push_updates(&self, updates: &[UpdateRecord]) {
        let body = to_document(updates).to_xml().unwrap();
        self.responses.lock().unwrap().push_back(Ok(Bytes::from(body)));
    }

    pub fn push_error(&self, error: CheckError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManifestFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<ManifestResponse, CheckError> {
        self.urls.lock().unwrap().push(url.to_string());
        let next = self.responses.lock().unwrap().pop_front();
        let body = next.unwrap_or(Err(CheckError::Request("no scripted response".to_string())))?;
        Ok(ManifestResponse { final_url: url.to_string(), body })
    }
}

/// How one scripted transfer behaves.
#[derive(Debug)]
pub enum Script {
    /// Write `bytes` to the destination and succeed
    Complete(Vec<u8>),
    /// Stop right away with the status
    Fail(TransferStatus),
    /// Report progress and wait to be cancelled
    Progress { transferred: u64, total: u64 },
    /// Refuse to start
    Refuse(TransferError),
}

struct ScriptControl {
    cancel: mpsc::UnboundedSender<TransferStatus>,
    completes: Arc<Mutex<u32>>,
    intervals: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl TransferControl for ScriptControl {
    async fn cancel(&self, status: TransferStatus) -> Result<(), TransferError> {
        self.cancel
            .send(status)
            .map_err(|_| TransferError::Cancel("transfer already finished".to_string()))
    }

    fn set_poll_interval(&self, interval: Duration) {
        self.intervals.lock().unwrap().push(interval);
    }

    async fn complete(&self) -> Result<(), TransferError> {
        *self.completes.lock().unwrap() += 1;
        Ok(())
    }
}

/// A transfer backend that plays [`Script`]s in order.
pub struct ScriptedTransfer {
    kind: BackendKind,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<TransferRequest>>,
    resumed: Mutex<Vec<String>>,
    completes: Arc<Mutex<u32>>,
    intervals: Arc<Mutex<Vec<Duration>>>,
}

impl ScriptedTransfer {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
            completes: Arc::new(Mutex::new(0)),
            intervals: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn resumed_jobs(&self) -> Vec<String> {
        self.resumed.lock().unwrap().clone()
    }

    pub fn completes(&self) -> u32 {
        *self.completes.lock().unwrap()
    }

    pub fn poll_intervals(&self) -> Vec<Duration> {
        self.intervals.lock().unwrap().clone()
    }

    fn play(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        let count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Fail(TransferStatus::Failed("no script".to_string())));
        if let Script::Refuse(error) = script {
            return Err(error);
        }

        let (events, rx) = mpsc::channel(16);
        let (cancel, mut cancelled) = mpsc::unbounded_channel();
        let final_url = format!("{}?final", request.url);
        tokio::spawn(async move {
            let _ = events.send(TransferEvent::Started { final_url }).await;
            let status = match script {
                Script::Complete(bytes) => {
                    let len = bytes.len() as u64;
                    match std::fs::write(&request.dest, &bytes) {
                        Ok(()) => {
                            let _ = events.send(TransferEvent::Progress { transferred: len, total: len }).await;
                            TransferStatus::Success
                        }
                        Err(_) => TransferStatus::FileAccessDenied,
                    }
                }
                Script::Fail(status) => status,
                Script::Progress { transferred, total } => {
                    let _ = events.send(TransferEvent::Progress { transferred, total }).await;
                    cancelled.recv().await.unwrap_or(TransferStatus::Cancelled)
                }
                Script::Refuse(_) => unreachable!(),
            };
            let _ = events.send(TransferEvent::Stopped(status)).await;
        });

        let control = Arc::new(ScriptControl {
            cancel,
            completes: self.completes.clone(),
            intervals: self.intervals.clone(),
        });
        let job_id = (self.kind == BackendKind::Native).then(|| format!("job-{}", count));
        Ok(TransferHandle::new(self.kind, job_id, rx, control))
    }
}

#[async_trait]
impl TransferBackend for ScriptedTransfer {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        self.play(request)
    }

    async fn resume(&self, job_id: &str, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        self.resumed.lock().unwrap().push(job_id.to_string());
        self.play(request)
    }
}

/// Network that can be switched on and off.
pub struct SwitchableNetwork {
    online: watch::Sender<bool>,
}

impl SwitchableNetwork {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self { online: watch::channel(online).0 })
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }
}

#[async_trait]
impl NetworkMonitor for SwitchableNetwork {
    fn is_offline(&self) -> bool {
        !*self.online.borrow()
    }

    async fn wait_online(&self) {
        let mut rx = self.online.subscribe();
        let _ = rx.wait_for(|online| *online).await;
    }
}

/// Apply process that writes scripted status tokens, repeating the last.
pub struct ScriptedApply {
    results: Mutex<VecDeque<StatusToken>>,
    runs: Mutex<Vec<PathBuf>>,
    stalled: bool,
}

impl ScriptedApply {
    pub fn new(result: StatusToken) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::from([result])),
            runs: Mutex::new(Vec::new()),
            stalled: false,
        })
    }

    /// Apply process that never finishes, leaving the status at `applying`.
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::from([StatusToken::new(UpdateStatus::Applying)])),
            runs: Mutex::new(Vec::new()),
            stalled: true,
        })
    }

    /// Queues `result` for the run after the ones already queued.
    pub fn then(&self, result: StatusToken) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl ApplyLauncher for ScriptedApply {
    async fn stage(&self, ready_dir: &Path) -> Result<(), UpdateError> {
        self.runs.lock().unwrap().push(ready_dir.to_path_buf());
        if self.stalled {
            std::future::pending::<()>().await;
        }
        let result = {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                *results.front().unwrap()
            }
        };
        write_status(ready_dir, result)
    }
}

pub fn app() -> AppInfo {
    let mut app = AppInfo::new("Test App", "1.0", "20240101000000");
    app.os_version = "linux".to_string();
    app
}

/// Update with a complete patch of `size` bytes and, optionally, a partial
/// one.
pub fn update(version: &str, complete: u64, partial: Option<u64>) -> UpdateRecord {
    let mut patches = vec![PatchRecord::new(PatchType::Complete, format!("http://u/{}/complete", version), complete)];
    if let Some(size) = partial {
        patches.push(PatchRecord::new(PatchType::Partial, format!("http://u/{}/partial", version), size));
    }
    let mut update = UpdateRecord::new(version, UpdateType::Minor, patches);
    update.build_id = Some("20300101000000".to_string());
    update
}

/// Everything a scenario needs, rooted in a temp dir.
pub struct Rig {
    pub dir: TempDir,
    pub config: UpdaterConfig,
    pub privileges: StaticPrivileges,
    pub fetcher: Arc<ScriptedFetcher>,
    pub chunked: Arc<ScriptedTransfer>,
    pub native: Option<Arc<ScriptedTransfer>>,
    pub network: Arc<SwitchableNetwork>,
    pub apply: Option<Arc<ScriptedApply>>,
}

impl Rig {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = UpdaterConfig::default();
        config.update_url = Some("http://updates.test/%PRODUCT%/%VERSION%/update.xml".to_string());
        config.storage.root_dir = dir.path().to_path_buf();
        config.storage.save_interval_ms = 0;
        config.staging_enabled = false;
        config.instances.check_enabled = false;
        Self {
            dir,
            config,
            privileges: StaticPrivileges::default(),
            fetcher: Arc::new(ScriptedFetcher::default()),
            chunked: ScriptedTransfer::new(BackendKind::Chunked),
            native: None,
            network: SwitchableNetwork::new(true),
            apply: None,
        }
    }

    pub fn with_native(mut self) -> Self {
        self.config.download.native_enabled = true;
        self.native = Some(ScriptedTransfer::new(BackendKind::Native));
        self
    }

    pub fn with_staging(mut self, result: StatusToken) -> Self {
        self.config.staging_enabled = true;
        self.apply = Some(ScriptedApply::new(result));
        self
    }

    pub fn with_stalled_staging(mut self) -> Self {
        self.config.staging_enabled = true;
        self.apply = Some(ScriptedApply::stalled());
        self
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn ready_dir(&self) -> PathBuf {
        self.dir.path().join("updates").join("0")
    }

    pub fn coordinator(&self) -> UpdateCoordinator {
        let host = HostServices {
            app: app(),
            privileges: Arc::new(self.privileges),
            instances: Arc::new(SingleInstance),
            network: self.network.clone(),
            apply: self.apply.clone().map(|a| a as Arc<dyn ApplyLauncher>),
            native: None,
            verifier: PatchVerifier::new(),
        };
        let parts = Collaborators {
            fetcher: self.fetcher.clone(),
            chunked: self.chunked.clone(),
            native: self.native.clone().map(|n| n as Arc<dyn TransferBackend>),
        };
        UpdateCoordinator::with_collaborators(self.config.clone(), host, parts)
    }
}

/// Waits until the coordinator reports `state`.
pub async fn wait_for_state(coordinator: &UpdateCoordinator, state: UpdateState) {
    let mut rx = coordinator.watch_state();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Waits for the first event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<UpdateEvent>,
    pred: impl Fn(&UpdateEvent) -> bool,
) -> UpdateEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
