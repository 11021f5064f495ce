//! Patch transfer backends.
//!
//! A backend turns a [`TransferRequest`] into a [`TransferHandle`]. The
//! handle carries a per-download event channel that yields
//! [`TransferEvent::Started`], any number of [`TransferEvent::Progress`]
//! events, and exactly one [`TransferEvent::Stopped`].
//!
//! Two backends exist: [`native::NativeTransfer`], which hands the job to
//! an OS download queue, and [`chunked::ChunkedTransfer`], which fetches
//! byte ranges itself.

pub mod chunked;
pub mod native;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tracing::debug;

use crate::config::UpdaterConfig;
use crate::error::ErrorClass;
use crate::record::{props, PatchRecord, UpdateRecord};

pub use chunked::ChunkedTransfer;
pub use native::{NativeJob, NativeJobOptions, NativeTransfer, NativeTransferService};

/// Capacity of the per-download event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which backend moved the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Native,
    Chunked,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::Chunked => f.write_str("chunked"),
        }
    }
}

/// Terminal result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// Cancelled on request
    Cancelled,
    /// Cancelled because the byte counts did not add up
    Unexpected,
    Offline,
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    /// A proxy or cache could not serve the range
    NotCached,
    FileAccessDenied,
    ReadOnly,
    /// Server answered with a non-success status
    Http(u16),
    Failed(String),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Success)
    }

    /// Socket-level failures that are retried after a short delay.
    pub fn is_retryable_network(&self) -> bool {
        matches!(
            self,
            TransferStatus::Timeout
                | TransferStatus::ConnectionReset
                | TransferStatus::ConnectionRefused
                | TransferStatus::NotCached
        )
    }

    /// Failures that mean the destination cannot be written.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TransferStatus::FileAccessDenied | TransferStatus::ReadOnly)
    }

    /// Returns true when the transfer was stopped by a cancel request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferStatus::Cancelled | TransferStatus::Unexpected)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Success => f.write_str("success"),
            TransferStatus::Cancelled => f.write_str("cancelled"),
            TransferStatus::Unexpected => f.write_str("unexpected"),
            TransferStatus::Offline => f.write_str("offline"),
            TransferStatus::Timeout => f.write_str("timeout"),
            TransferStatus::ConnectionReset => f.write_str("connection-reset"),
            TransferStatus::ConnectionRefused => f.write_str("connection-refused"),
            TransferStatus::NotCached => f.write_str("not-cached"),
            TransferStatus::FileAccessDenied => f.write_str("file-access-denied"),
            TransferStatus::ReadOnly => f.write_str("read-only"),
            TransferStatus::Http(code) => write!(f, "http-{}", code),
            TransferStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Events reported by a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The first response arrived; `final_url` is the URL after redirects
    Started { final_url: String },
    Progress { transferred: u64, total: u64 },
    Stopped(TransferStatus),
}

/// Errors starting or controlling a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The native job belongs to another OS user
    #[error("transfer job is owned by another user")]
    AccessDenied,

    /// The backend cannot be used here
    #[error("transfer backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request in the current mode
    #[error("transfer refused: {0}")]
    Refused(String),

    /// The job could not be created or reconnected
    #[error("failed to start transfer: {0}")]
    Start(String),

    /// Cancelling the job failed; it may be retried
    #[error("failed to cancel transfer: {0}")]
    Cancel(String),

    /// IO error on the destination file
    #[error("transfer IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::AccessDenied
            | TransferError::Unavailable(_)
            | TransferError::Start(_) => ErrorClass::BackendFallback,
            TransferError::Cancel(_) => ErrorClass::Transient,
            TransferError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorClass::Fatal
            }
            TransferError::Io(_) => ErrorClass::Transient,
            TransferError::Refused(_) => ErrorClass::Fatal,
        }
    }
}

/// What to transfer and where to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub dest: PathBuf,
    pub size: u64,
    /// Foreground transfers run at a higher priority
    pub foreground: bool,
}

/// Control surface of a running transfer.
#[async_trait]
pub trait TransferControl: Send + Sync {
    /// Stops the transfer; the event stream ends with `Stopped(status)`.
    async fn cancel(&self, status: TransferStatus) -> Result<(), TransferError>;

    /// How often progress is reported.
    fn set_poll_interval(&self, interval: Duration);

    /// Finalizes a successful transfer. Backends that write the destination
    /// directly have nothing to do.
    async fn complete(&self) -> Result<(), TransferError> {
        Ok(())
    }
}

/// A running transfer.
pub struct TransferHandle {
    kind: BackendKind,
    job_id: Option<String>,
    events: mpsc::Receiver<TransferEvent>,
    control: Arc<dyn TransferControl>,
    cancelled: Arc<OnceCell<TransferStatus>>,
}

impl TransferHandle {
    pub fn new(
        kind: BackendKind,
        job_id: Option<String>,
        events: mpsc::Receiver<TransferEvent>,
        control: Arc<dyn TransferControl>,
    ) -> Self {
        Self { kind, job_id, events, control, cancelled: Arc::new(OnceCell::new()) }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Job id to reconnect to after a restart, if the backend has one.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Next event, or `None` once the backend has dropped its sender.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Cancel handle usable while the event stream is being consumed.
    pub fn canceller(&self) -> TransferCanceller {
        TransferCanceller { control: self.control.clone(), cancelled: self.cancelled.clone() }
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.control.set_poll_interval(interval);
    }

    pub async fn complete(&self) -> Result<(), TransferError> {
        self.control.complete().await
    }

    /// Splits the handle into its event stream and control surface.
    pub fn into_parts(self) -> (mpsc::Receiver<TransferEvent>, TransferCanceller) {
        let canceller =
            TransferCanceller { control: self.control, cancelled: self.cancelled };
        (self.events, canceller)
    }
}

/// Idempotent cancel. The first successful cancel wins; concurrent callers
/// wait for the one in flight, and a failed cancel leaves the handle
/// cancellable.
#[derive(Clone)]
pub struct TransferCanceller {
    control: Arc<dyn TransferControl>,
    cancelled: Arc<OnceCell<TransferStatus>>,
}

impl TransferCanceller {
    /// Cancels with `status`, returning the status the transfer was
    /// actually cancelled with.
    pub async fn cancel(&self, status: TransferStatus) -> Result<TransferStatus, TransferError> {
        let control = self.control.clone();
        let applied = self
            .cancelled
            .get_or_try_init(|| async move {
                debug!("Cancelling transfer with {}", status);
                control.cancel(status.clone()).await?;
                Ok::<_, TransferError>(status)
            })
            .await?;
        Ok(applied.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.initialized()
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.control.set_poll_interval(interval);
    }

    pub async fn complete(&self) -> Result<(), TransferError> {
        self.control.complete().await
    }
}

/// A way of moving a patch onto disk.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Starts a new transfer.
    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError>;

    /// Reconnects to a transfer started by an earlier process. Backends
    /// without persistent jobs start over, resuming from the partial file.
    async fn resume(
        &self,
        job_id: &str,
        request: TransferRequest,
    ) -> Result<TransferHandle, TransferError>;
}

/// Why the native backend can or cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeAvailability {
    Available,
    /// No OS transfer service on this platform
    UnsupportedPlatform,
    /// Built without the `native-transfer` feature
    NotCompiledIn,
    DisabledByConfig,
    /// A proxy is configured that the OS service would not honour
    ProxyOverride,
    /// An earlier job was owned by another OS user
    InUseByOtherUser,
}

/// Works out whether the native backend may be used at all this session.
pub fn probe_native(
    config: &UpdaterConfig,
    service_present: bool,
    in_use_by_other_user: bool,
) -> NativeAvailability {
    if !cfg!(feature = "native-transfer") {
        return NativeAvailability::NotCompiledIn;
    }
    if !service_present {
        return NativeAvailability::UnsupportedPlatform;
    }
    if !config.download.native_enabled {
        return NativeAvailability::DisabledByConfig;
    }
    if config.network.proxy.is_some() {
        return NativeAvailability::ProxyOverride;
    }
    if in_use_by_other_user {
        return NativeAvailability::InUseByOtherUser;
    }
    NativeAvailability::Available
}

/// Per-patch backend choice: native only when it is available, the patch
/// has never failed with it, and the update does not opt out.
pub fn choose_backend(
    availability: NativeAvailability,
    update: &UpdateRecord,
    patch: &PatchRecord,
) -> BackendKind {
    let opted_out = update.properties.get(props::DISABLE_NATIVE_TRANSFER) == Some("true");
    if availability == NativeAvailability::Available
        && !opted_out
        && !patch.properties.contains(props::NATIVE_RESULT)
    {
        BackendKind::Native
    } else {
        BackendKind::Chunked
    }
}
