//! Native background transfer.
//!
//! The OS download queue is reached through [`NativeTransferService`], which
//! the host injects. Jobs survive the process, so a later session can
//! reconnect to one by id.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    BackendKind, TransferBackend, TransferControl, TransferError, TransferEvent, TransferHandle,
    TransferRequest,
};

/// Poll interval while someone is watching progress.
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Poll interval with no progress listeners.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// No-progress timeout for foreground jobs.
pub const FOREGROUND_NO_PROGRESS_TIMEOUT: Duration = Duration::from_secs(5);
/// No-progress timeout for background jobs.
pub const BACKGROUND_NO_PROGRESS_TIMEOUT: Duration = Duration::from_secs(3600);

/// Options for a new OS transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeJobOptions {
    pub foreground: bool,
    pub no_progress_timeout: Duration,
    pub poll_interval: Duration,
}

impl NativeJobOptions {
    pub fn for_request(request: &TransferRequest) -> Self {
        let no_progress_timeout = if request.foreground {
            FOREGROUND_NO_PROGRESS_TIMEOUT
        } else {
            BACKGROUND_NO_PROGRESS_TIMEOUT
        };
        Self { foreground: request.foreground, no_progress_timeout, poll_interval: IDLE_POLL_INTERVAL }
    }
}

/// A job handed out by the OS service.
pub struct NativeJob {
    pub job_id: String,
    pub events: mpsc::Receiver<TransferEvent>,
    pub control: Arc<dyn TransferControl>,
}

/// OS download queue.
///
/// Implementations return [`TransferError::AccessDenied`] when the job
/// exists but belongs to another OS user.
#[async_trait]
pub trait NativeTransferService: Send + Sync {
    async fn create_job(
        &self,
        url: &str,
        dest: &Path,
        options: NativeJobOptions,
    ) -> Result<NativeJob, TransferError>;

    async fn connect_job(&self, job_id: &str) -> Result<NativeJob, TransferError>;
}

/// Backend that delegates to a [`NativeTransferService`].
pub struct NativeTransfer {
    service: Arc<dyn NativeTransferService>,
    in_use_by_other_user: Arc<AtomicBool>,
}

impl NativeTransfer {
    /// `in_use_by_other_user` is set when the service reports access denied,
    /// and is checked by the capability probe for the rest of the session.
    pub fn new(service: Arc<dyn NativeTransferService>, in_use_by_other_user: Arc<AtomicBool>) -> Self {
        Self { service, in_use_by_other_user }
    }

    fn wrap(&self, job: NativeJob) -> TransferHandle {
        TransferHandle::new(BackendKind::Native, Some(job.job_id), job.events, job.control)
    }

    fn note_error(&self, err: &TransferError) {
        if matches!(err, TransferError::AccessDenied) {
            warn!("Native transfer job is owned by another user, disabling native transfers");
            self.in_use_by_other_user.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransferBackend for NativeTransfer {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        info!("Starting native transfer: {} -> {:?}", request.url, request.dest);
        let options = NativeJobOptions::for_request(&request);
        match self.service.create_job(&request.url, &request.dest, options).await {
            Ok(job) => {
                job.control.set_poll_interval(options.poll_interval);
                Ok(self.wrap(job))
            }
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    async fn resume(
        &self,
        job_id: &str,
        request: TransferRequest,
    ) -> Result<TransferHandle, TransferError> {
        info!("Reconnecting to native transfer job {}", job_id);
        match self.service.connect_job(job_id).await {
            Ok(job) => Ok(self.wrap(job)),
            Err(TransferError::AccessDenied) => {
                self.note_error(&TransferError::AccessDenied);
                Err(TransferError::AccessDenied)
            }
            Err(e) => {
                warn!("Could not reconnect to job {}: {}, starting a new one", job_id, e);
                self.start(request).await
            }
        }
    }
}
