//! Chunked resumable transfer.
//!
//! Fetches the remaining bytes of a patch in bounded `Range` requests and
//! appends them to the partial file, so an interrupted download resumes
//! from the length already on disk.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    BackendKind, TransferBackend, TransferControl, TransferError, TransferEvent, TransferHandle,
    TransferRequest, TransferStatus, EVENT_CHANNEL_CAPACITY,
};
use crate::config::UpdaterConfig;

/// Default size of one range request in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 300_000;

/// Default progress reporting interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Transfer backend built on `reqwest` range requests.
pub struct ChunkedTransfer {
    client: reqwest::Client,
    chunk_size: u64,
    /// Refuse to run from a headless background task
    refuse_in_background: bool,
}

impl ChunkedTransfer {
    /// Create a chunked backend from the network and download settings.
    pub fn new(config: &UpdaterConfig) -> Result<Self, TransferError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.network.timeout_seconds))
            .read_timeout(Duration::from_secs(config.network.read_timeout_seconds))
            .user_agent(&config.network.user_agent);
        if let Some(proxy) = &config.network.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransferError::Unavailable(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransferError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chunk_size: config.download.chunk_size.max(1),
            refuse_in_background: config.background_task
                && !config.download.allow_chunked_in_background,
        })
    }

    fn spawn(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        if self.refuse_in_background {
            return Err(TransferError::Refused(
                "chunked transfer is not allowed from a background task".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let control = Arc::new(ChunkedControl {
            cancel: cancel_tx,
            poll_interval_ms: Arc::new(AtomicU64::new(DEFAULT_POLL_INTERVAL.as_millis() as u64)),
        });

        let job = ChunkedJob {
            client: self.client.clone(),
            chunk_size: self.chunk_size,
            request,
            events: events_tx,
            cancel: cancel_rx,
            poll_interval_ms: control.poll_interval_ms.clone(),
        };
        tokio::spawn(job.run());

        Ok(TransferHandle::new(BackendKind::Chunked, None, events_rx, control))
    }
}

#[async_trait]
impl TransferBackend for ChunkedTransfer {
    fn kind(&self) -> BackendKind {
        BackendKind::Chunked
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        info!("Starting chunked transfer: {} -> {:?}", request.url, request.dest);
        self.spawn(request)
    }

    async fn resume(
        &self,
        _job_id: &str,
        request: TransferRequest,
    ) -> Result<TransferHandle, TransferError> {
        info!("Resuming chunked transfer: {} -> {:?}", request.url, request.dest);
        self.spawn(request)
    }
}

struct ChunkedControl {
    cancel: watch::Sender<Option<TransferStatus>>,
    poll_interval_ms: Arc<AtomicU64>,
}

#[async_trait]
impl TransferControl for ChunkedControl {
    async fn cancel(&self, status: TransferStatus) -> Result<(), TransferError> {
        // The job may already have finished; that still counts as cancelled.
        self.cancel.send_replace(Some(status));
        Ok(())
    }

    fn set_poll_interval(&self, interval: Duration) {
        self.poll_interval_ms.store(interval.as_millis() as u64, Ordering::Relaxed);
    }
}

struct ChunkedJob {
    client: reqwest::Client,
    chunk_size: u64,
    request: TransferRequest,
    events: mpsc::Sender<TransferEvent>,
    cancel: watch::Receiver<Option<TransferStatus>>,
    poll_interval_ms: Arc<AtomicU64>,
}

/// Outcome of one range request.
enum ChunkResult {
    /// Bytes were appended; continue from the new offset
    Advanced(u64),
    Stopped(TransferStatus),
}

impl ChunkedJob {
    async fn run(mut self) {
        let status = self.transfer().await;
        debug!("Chunked transfer of {} stopped: {}", self.request.url, status);
        let _ = self.events.send(TransferEvent::Stopped(status)).await;
    }

    async fn transfer(&mut self) -> TransferStatus {
        let dest = self.request.dest.clone();
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return io_status(&e);
            }
        }

        let mut offset = match tokio::fs::metadata(&dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if offset > 0 {
            debug!("Resuming download from byte {}", offset);
        }

        let mut started = false;
        let mut last_report = None;
        loop {
            let cancelled = self.cancel.borrow().clone();
            if let Some(status) = cancelled {
                return status;
            }
            if offset >= self.request.size {
                self.report(offset, self.request.size, &mut last_report, true).await;
                return TransferStatus::Success;
            }

            match self.fetch_chunk(&dest, offset, &mut started, &mut last_report).await {
                ChunkResult::Advanced(next) => offset = next,
                ChunkResult::Stopped(status) => return status,
            }
        }
    }

    async fn fetch_chunk(
        &mut self,
        dest: &Path,
        offset: u64,
        started: &mut bool,
        last_report: &mut Option<Instant>,
    ) -> ChunkResult {
        let end = (offset + self.chunk_size).min(self.request.size) - 1;
        let request = self
            .client
            .get(&self.request.url)
            .header(RANGE, format!("bytes={}-{}", offset, end));

        let response = tokio::select! {
            result = request.send() => match result {
                Ok(response) => response,
                Err(e) => return ChunkResult::Stopped(reqwest_status(&e)),
            },
            status = wait_cancelled(&mut self.cancel) => return ChunkResult::Stopped(status),
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Range request for {} failed with {}", self.request.url, status);
            return ChunkResult::Stopped(TransferStatus::Http(status.as_u16()));
        }

        if !*started {
            *started = true;
            let final_url = response.url().to_string();
            let _ = self.events.send(TransferEvent::Started { final_url }).await;
        }

        // A server without range support sends the whole body; start over.
        let (mut position, total) = if status == StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total)
                .unwrap_or(self.request.size);
            (offset, total)
        } else {
            if offset > 0 {
                warn!("Server does not support range requests, restarting download");
            }
            (0, response.content_length().unwrap_or(self.request.size))
        };

        let file = if position == 0 {
            tokio::fs::File::create(dest).await
        } else {
            tokio::fs::OpenOptions::new().append(true).open(dest).await
        };
        let mut file = match file {
            Ok(file) => file,
            Err(e) => return ChunkResult::Stopped(io_status(&e)),
        };

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                status = wait_cancelled(&mut self.cancel) => {
                    let _ = file.flush().await;
                    return ChunkResult::Stopped(status);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = file.flush().await;
                    return ChunkResult::Stopped(reqwest_status(&e));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                return ChunkResult::Stopped(io_status(&e));
            }
            position += chunk.len() as u64;
            self.report(position, total, last_report, false).await;
        }

        if let Err(e) = file.sync_all().await {
            return ChunkResult::Stopped(io_status(&e));
        }
        if position == offset {
            return ChunkResult::Stopped(TransferStatus::Failed("empty range response".to_string()));
        }
        ChunkResult::Advanced(position)
    }

    /// Sends progress at most once per poll interval, or always when `force`.
    async fn report(&self, transferred: u64, total: u64, last: &mut Option<Instant>, force: bool) {
        let interval = Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed));
        let due = last.map(|at| at.elapsed() >= interval).unwrap_or(true);
        if force || due || transferred > self.request.size {
            *last = Some(Instant::now());
            let _ = self.events.send(TransferEvent::Progress { transferred, total }).await;
        }
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<Option<TransferStatus>>) -> TransferStatus {
    loop {
        let cancelled = cancel.borrow_and_update().clone();
        if let Some(status) = cancelled {
            return status;
        }
        if cancel.changed().await.is_err() {
            // Control dropped without cancelling; keep waiting forever.
            std::future::pending::<()>().await;
        }
    }
}

/// Parses the total from `bytes <start>-<end>/<total>`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn reqwest_status(err: &reqwest::Error) -> TransferStatus {
    if err.is_timeout() {
        TransferStatus::Timeout
    } else if err.is_connect() {
        TransferStatus::ConnectionRefused
    } else if err.is_body() || err.is_request() {
        TransferStatus::ConnectionReset
    } else {
        TransferStatus::Failed(err.to_string())
    }
}

fn io_status(err: &std::io::Error) -> TransferStatus {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => TransferStatus::FileAccessDenied,
        _ => TransferStatus::Failed(err.to_string()),
    }
}
