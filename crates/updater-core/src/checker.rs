//! Remote manifest checks.
//!
//! Concurrent checks of the same kind share one request. Each caller gets a
//! [`CheckHandle`] with its own id; stopping a handle aborts the request
//! only when no other handle is waiting on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::codes;
use crate::config::{InstancesConfig, NetworkConfig, UpdaterConfig};
use crate::error::ErrorClass;
use crate::host::{AppInfo, InstanceProbe, NetworkMonitor};
use crate::record::{parse_document, RecordDefaults, UpdateRecord};

/// Background checks run unattended; foreground checks were asked for by
/// the user and bypass server-side throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Background,
    Foreground,
}

/// Why a check failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("network is offline")]
    Offline,

    #[error("server returned HTTP {0}")]
    Http(u16),

    #[error("manifest request failed: {0}")]
    Request(String),

    #[error("invalid manifest: {0}")]
    Parse(String),

    #[error("no update URL configured")]
    NoUrl,

    #[error("invalid update URL: {0}")]
    InvalidUrl(String),

    #[error("update check cancelled")]
    Cancelled,
}

impl CheckError {
    /// Code recorded on the synthesized failed update.
    pub fn code(&self) -> i32 {
        match self {
            CheckError::Offline => codes::NETWORK_ERROR_OFFLINE,
            CheckError::Http(status) => codes::http_error_code(*status),
            // A document that loaded but did not parse counts as HTTP 200.
            CheckError::Parse(_) => codes::http_error_code(200),
            CheckError::Request(_) => codes::CHECK_REQUEST_FAILED,
            CheckError::NoUrl | CheckError::InvalidUrl(_) => codes::CHECK_URL_NOT_AVAILABLE,
            CheckError::Cancelled => codes::CHECK_CANCELLED,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CheckError::Offline | CheckError::Http(_) | CheckError::Request(_) => ErrorClass::Transient,
            CheckError::Cancelled => ErrorClass::Transient,
            CheckError::Parse(_) | CheckError::NoUrl | CheckError::InvalidUrl(_) => ErrorClass::Fatal,
        }
    }
}

/// A loaded manifest.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    /// URL after redirects
    pub final_url: String,
    pub body: Bytes,
}

/// Fetches the manifest document.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// GETs `url`. Non-success HTTP statuses are returned as
    /// [`CheckError::Http`].
    async fn fetch(&self, url: &str) -> Result<ManifestResponse, CheckError>;
}

/// [`ManifestFetcher`] over `reqwest`, bypassing caches.
pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self, CheckError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| CheckError::Request(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CheckError::Request(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<ManifestResponse, CheckError> {
        debug!("Fetching manifest: {}", url);

        let response = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| CheckError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CheckError::Http(response.status().as_u16()));
        }

        let final_url = response.url().to_string();
        let body = response.bytes().await.map_err(|e| CheckError::Request(e.to_string()))?;
        debug!("Fetched {} manifest bytes from {}", body.len(), final_url);
        Ok(ManifestResponse { final_url, body })
    }
}

/// Outcome of one check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// False when checking is disabled
    pub checks_allowed: bool,
    pub succeeded: bool,
    /// Parsed updates; on failure a single failed placeholder
    pub updates: Vec<UpdateRecord>,
    pub error: Option<CheckError>,
}

impl CheckResult {
    fn success(updates: Vec<UpdateRecord>) -> Self {
        Self { checks_allowed: true, succeeded: true, updates, error: None }
    }

    fn failed(error: CheckError) -> Self {
        let mut update = UpdateRecord::placeholder();
        update.mark_failed(error.code());
        Self { checks_allowed: true, succeeded: false, updates: vec![update], error: Some(error) }
    }

    fn not_allowed() -> Self {
        Self { checks_allowed: false, succeeded: false, updates: Vec::new(), error: None }
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(CheckError::code)
    }
}

type SharedCheck = Shared<BoxFuture<'static, CheckResult>>;

/// A caller's view of a (possibly shared) check.
#[derive(Clone)]
pub struct CheckHandle {
    id: u64,
    kind: CheckKind,
    result: SharedCheck,
}

impl CheckHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CheckKind {
        self.kind
    }

    /// Waits for the check to finish.
    pub async fn result(self) -> CheckResult {
        self.result.await
    }
}

struct InFlight {
    generation: u64,
    result: SharedCheck,
    abort: tokio::task::AbortHandle,
}

#[derive(Default)]
struct Checks {
    by_kind: HashMap<CheckKind, InFlight>,
    kind_by_id: HashMap<u64, CheckKind>,
}

struct CheckerInner {
    fetcher: Arc<dyn ManifestFetcher>,
    network: Arc<dyn NetworkMonitor>,
    waiter: Option<InstanceWaiter>,
    app: AppInfo,
    update_url: Option<String>,
    pin: Option<String>,
    allow_migration: bool,
    disabled: bool,
    defaults: RecordDefaults,
    next_id: AtomicU64,
    checks: Mutex<Checks>,
}

/// Issues and coalesces manifest checks.
#[derive(Clone)]
pub struct UpdateChecker {
    inner: Arc<CheckerInner>,
}

impl UpdateChecker {
    pub fn new(
        config: &UpdaterConfig,
        app: AppInfo,
        fetcher: Arc<dyn ManifestFetcher>,
        network: Arc<dyn NetworkMonitor>,
        instances: Arc<dyn InstanceProbe>,
    ) -> Self {
        let waiter = config
            .instances
            .check_enabled
            .then(|| InstanceWaiter::new(instances, config.instances.clone()));
        Self {
            inner: Arc::new(CheckerInner {
                fetcher,
                network,
                waiter,
                defaults: app.record_defaults(),
                app,
                update_url: config.update_url.clone(),
                pin: config.pin.clone(),
                allow_migration: config.allow_migration,
                disabled: config.disabled_by_policy,
                next_id: AtomicU64::new(1),
                checks: Mutex::new(Checks::default()),
            }),
        }
    }

    /// Starts a check of `kind`, or joins the one already running.
    pub async fn check(&self, kind: CheckKind) -> CheckHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if self.inner.disabled {
            info!("Update check {} refused, updates are disabled by policy", id);
            let result = futures_util::future::ready(CheckResult::not_allowed()).boxed().shared();
            return CheckHandle { id, kind, result };
        }

        let mut checks = self.inner.checks.lock().await;
        let result = match checks.by_kind.get(&kind) {
            Some(in_flight) => {
                debug!("Connecting check {} to the running {:?} check", id, kind);
                in_flight.result.clone()
            }
            None => {
                debug!("Starting new {:?} check for id {}", kind, id);
                let inner = self.inner.clone();
                let generation = id;
                let task = tokio::spawn(async move {
                    let result = inner.run_check(kind).await;
                    inner.finish(kind, generation).await;
                    result
                });
                let abort = task.abort_handle();
                let result = task
                    .map(|joined| joined.unwrap_or_else(|_| CheckResult::failed(CheckError::Cancelled)))
                    .boxed()
                    .shared();
                checks.by_kind.insert(kind, InFlight { generation, result: result.clone(), abort });
                result
            }
        };
        checks.kind_by_id.insert(id, kind);
        CheckHandle { id, kind, result }
    }

    /// Detaches `id` from its check, aborting the request if it was the
    /// last caller waiting on it.
    pub async fn stop_check(&self, id: u64) {
        let mut checks = self.inner.checks.lock().await;
        let Some(kind) = checks.kind_by_id.remove(&id) else {
            debug!("No running check with id {}", id);
            return;
        };
        if checks.kind_by_id.values().any(|k| *k == kind) {
            debug!("Check {} stopped, request kept for other callers", id);
            return;
        }
        if let Some(in_flight) = checks.by_kind.remove(&kind) {
            info!("Aborting {:?} check, last caller {} stopped", kind, id);
            in_flight.abort.abort();
        }
    }

    /// Stops every running check.
    pub async fn stop_all(&self) {
        let ids: Vec<u64> = self.inner.checks.lock().await.kind_by_id.keys().copied().collect();
        for id in ids {
            self.stop_check(id).await;
        }
    }

    /// Manifest URL for `kind`.
    pub fn update_url(&self, kind: CheckKind) -> Result<String, CheckError> {
        let template = self.inner.update_url.as_deref().ok_or(CheckError::NoUrl)?;
        build_update_url(template, &self.inner.app, kind, self.inner.allow_migration, self.inner.pin.as_deref())
    }
}

impl CheckerInner {
    async fn run_check(&self, kind: CheckKind) -> CheckResult {
        if let Some(waiter) = &self.waiter {
            waiter.wait().await;
        }

        let url = match self.update_url.as_deref().ok_or(CheckError::NoUrl).and_then(|template| {
            build_update_url(template, &self.app, kind, self.allow_migration, self.pin.as_deref())
        }) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot build update URL: {}", e);
                return CheckResult::failed(e);
            }
        };

        let response = match self.fetcher.fetch(&url).await {
            Ok(response) => response,
            Err(CheckError::Request(reason)) if self.network.is_offline() => {
                info!("Update check failed while offline: {}", reason);
                return CheckResult::failed(CheckError::Offline);
            }
            Err(e) => {
                warn!("Update check failed: {}", e);
                return CheckResult::failed(e);
            }
        };

        let mut updates = match parse_document(&response.body, &self.defaults) {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Problem parsing the manifest: {}", e);
                return CheckResult::failed(CheckError::Parse(e.to_string()));
            }
        };
        for update in &mut updates {
            update.service_url = Some(response.final_url.clone());
            update.channel = self.app.channel.clone();
        }
        info!("Update check found {} updates", updates.len());
        CheckResult::success(updates)
    }

    /// Drops the bookkeeping of a finished check.
    async fn finish(&self, kind: CheckKind, generation: u64) {
        let mut checks = self.checks.lock().await;
        if checks.by_kind.get(&kind).map(|c| c.generation) == Some(generation) {
            checks.by_kind.remove(&kind);
            checks.kind_by_id.retain(|_, k| *k != kind);
        }
    }
}

/// Substitutes the template variables and appends the query parameters.
pub fn build_update_url(
    template: &str,
    app: &AppInfo,
    kind: CheckKind,
    allow_migration: bool,
    pin: Option<&str>,
) -> Result<String, CheckError> {
    let formatted = template
        .replace("%PRODUCT%", &app.product)
        .replace("%VERSION%", &app.version)
        .replace("%BUILD_ID%", &app.build_id)
        .replace("%BUILD_TARGET%", &app.build_target)
        .replace("%CHANNEL%", &app.channel)
        .replace("%OS_VERSION%", &app.os_version)
        .replace("%PLATFORM_VERSION%", &app.platform_version);

    let mut url = Url::parse(&formatted).map_err(|e| CheckError::InvalidUrl(format!("{}: {}", formatted, e)))?;
    {
        let mut query = url.query_pairs_mut();
        if kind == CheckKind::Foreground {
            query.append_pair("force", "1");
        }
        if allow_migration {
            query.append_pair("mig64", "1");
        }
        if let Some(pin) = pin {
            query.append_pair("pin", pin);
        }
    }
    // An empty query serializer still leaves a trailing `?`.
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url.to_string())
}

/// Waits until no other instance of the application is running.
///
/// Concurrent waiters share one polling loop.
pub struct InstanceWaiter {
    probe: Arc<dyn InstanceProbe>,
    config: InstancesConfig,
    in_flight: Mutex<Option<Shared<BoxFuture<'static, bool>>>>,
}

impl InstanceWaiter {
    pub fn new(probe: Arc<dyn InstanceProbe>, config: InstancesConfig) -> Self {
        Self { probe, config, in_flight: Mutex::new(None) }
    }

    /// Returns true once no other instance runs, false if the timeout
    /// elapsed first.
    pub async fn wait(&self) -> bool {
        let wait = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(wait) => wait.clone(),
                None => {
                    let wait = poll_instances(
                        self.probe.clone(),
                        self.config.poll_interval(),
                        self.config.effective_timeout(),
                    )
                    .boxed()
                    .shared();
                    *in_flight = Some(wait.clone());
                    wait
                }
            }
        };

        let done = wait.clone().await;
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.as_ref().is_some_and(|current| current.ptr_eq(&wait)) {
            *in_flight = None;
        }
        done
    }
}

async fn poll_instances(probe: Arc<dyn InstanceProbe>, interval: Duration, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if !probe.other_instances_running() {
            return true;
        }
        if started.elapsed() >= timeout {
            warn!("Other instances still running after {:?}, checking anyway", timeout);
            return false;
        }
        debug!("Other instances running, waiting {:?}", interval);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{AlwaysOnline, SingleInstance};
    use std::sync::atomic::AtomicUsize;

    const MANIFEST: &str = r#"<?xml version="1.0"?>
<updates>
  <update appVersion="129.0" type="minor">
    <patch type="complete" URL="https://cdn/c.patch" size="1000"/>
  </update>
</updates>"#;

    struct CountingFetcher {
        calls: AtomicUsize,
        response: Result<&'static str, CheckError>,
        hang: bool,
    }

    impl CountingFetcher {
        fn ok() -> Self {
            Self { calls: AtomicUsize::new(0), response: Ok(MANIFEST), hang: false }
        }
    }

    #[async_trait]
    impl ManifestFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<ManifestResponse, CheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures_util::future::pending::<()>().await;
            }
            let body = self.response.clone()?;
            Ok(ManifestResponse { final_url: url.to_string(), body: Bytes::from_static(body.as_bytes()) })
        }
    }

    struct Offline;

    #[async_trait]
    impl NetworkMonitor for Offline {
        fn is_offline(&self) -> bool {
            true
        }

        async fn wait_online(&self) {}
    }

    fn app() -> AppInfo {
        let mut app = AppInfo::new("Viewer", "128.0", "20240101").with_channel("beta");
        app.build_target = "linux-x86_64".into();
        app.os_version = "linux".into();
        app
    }

    fn checker(fetcher: Arc<CountingFetcher>) -> UpdateChecker {
        let mut config = UpdaterConfig::default();
        config.update_url = Some("https://aus.example.com/%PRODUCT%/%VERSION%/%CHANNEL%/update.xml".into());
        config.instances.check_enabled = false;
        UpdateChecker::new(&config, app(), fetcher, Arc::new(AlwaysOnline), Arc::new(SingleInstance))
    }

    #[test]
    fn test_url_template_and_parameters() {
        let url = build_update_url(
            "https://aus.example.com/%PRODUCT%/%VERSION%/%BUILD_ID%/%BUILD_TARGET%/%CHANNEL%/update.xml",
            &app(),
            CheckKind::Background,
            false,
            None,
        )
        .unwrap();
        assert_eq!(url, "https://aus.example.com/Viewer/128.0/20240101/linux-x86_64/beta/update.xml");

        let url = build_update_url(
            "https://aus.example.com/update.xml?os=%OS_VERSION%",
            &app(),
            CheckKind::Foreground,
            true,
            Some("128."),
        )
        .unwrap();
        assert!(url.ends_with("?os=linux&force=1&mig64=1&pin=128."), "{}", url);
    }

    #[test]
    fn test_invalid_url() {
        let err = build_update_url("not a url", &app(), CheckKind::Background, false, None).unwrap_err();
        assert!(matches!(err, CheckError::InvalidUrl(_)));
        assert_eq!(err.code(), codes::CHECK_URL_NOT_AVAILABLE);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CheckError::Http(404).code(), 1404);
        assert_eq!(CheckError::Offline.code(), 111);
        assert_eq!(CheckError::Parse("x".into()).code(), 1200);
    }

    #[tokio::test]
    async fn test_parsed_updates_get_service_url_and_channel() {
        let fetcher = Arc::new(CountingFetcher::ok());
        let result = checker(fetcher).check(CheckKind::Foreground).await.result().await;
        assert!(result.succeeded);
        let update = &result.updates[0];
        assert_eq!(update.channel, "beta");
        assert_eq!(
            update.service_url.as_deref(),
            Some("https://aus.example.com/Viewer/128.0/beta/update.xml?force=1")
        );
    }

    #[tokio::test]
    async fn test_same_kind_checks_share_one_request() {
        let fetcher = Arc::new(CountingFetcher::ok());
        let checker = checker(fetcher.clone());

        let a = checker.check(CheckKind::Background).await;
        let b = checker.check(CheckKind::Background).await;
        let c = checker.check(CheckKind::Foreground).await;
        assert_ne!(a.id(), b.id());

        assert!(a.result().await.succeeded);
        assert!(b.result().await.succeeded);
        assert!(c.result().await.succeeded);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stopping_last_handle_aborts() {
        let fetcher = Arc::new(CountingFetcher { hang: true, ..CountingFetcher::ok() });
        let checker = checker(fetcher);

        let a = checker.check(CheckKind::Background).await;
        let b = checker.check(CheckKind::Background).await;

        checker.stop_check(a.id()).await;
        checker.stop_check(b.id()).await;
        let result = b.result().await;
        assert!(!result.succeeded);
        assert_eq!(result.error, Some(CheckError::Cancelled));
    }

    #[tokio::test]
    async fn test_http_failure_synthesizes_failed_update() {
        let fetcher = Arc::new(CountingFetcher { response: Err(CheckError::Http(503)), ..CountingFetcher::ok() });
        let result = checker(fetcher).check(CheckKind::Background).await.result().await;
        assert!(!result.succeeded);
        assert_eq!(result.error_code(), Some(1503));
        assert_eq!(result.updates.len(), 1);
        assert_eq!(result.updates[0].error_code(), 1503);
        assert_eq!(result.updates[0].status_text.as_deref(), Some("Server returned HTTP 503"));
    }

    #[tokio::test]
    async fn test_request_failure_while_offline() {
        let mut config = UpdaterConfig::default();
        config.update_url = Some("https://aus.example.com/update.xml".into());
        config.instances.check_enabled = false;
        let fetcher = Arc::new(CountingFetcher {
            response: Err(CheckError::Request("dns".into())),
            ..CountingFetcher::ok()
        });
        let checker = UpdateChecker::new(&config, app(), fetcher, Arc::new(Offline), Arc::new(SingleInstance));
        let result = checker.check(CheckKind::Background).await.result().await;
        assert_eq!(result.error_code(), Some(codes::NETWORK_ERROR_OFFLINE));
    }

    #[tokio::test]
    async fn test_disabled_by_policy() {
        let mut config = UpdaterConfig::default();
        config.disabled_by_policy = true;
        let fetcher = Arc::new(CountingFetcher::ok());
        let checker =
            UpdateChecker::new(&config, app(), fetcher.clone(), Arc::new(AlwaysOnline), Arc::new(SingleInstance));
        let result = checker.check(CheckKind::Foreground).await.result().await;
        assert!(!result.checks_allowed);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    struct BusyFor(AtomicUsize);

    impl InstanceProbe for BusyFor {
        fn other_instances_running(&self) -> bool {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_wait_polls_until_alone() {
        let probe = Arc::new(BusyFor(AtomicUsize::new(2)));
        let waiter = InstanceWaiter::new(probe.clone(), InstancesConfig::default());
        let (a, b) = tokio::join!(waiter.wait(), waiter.wait());
        assert!(a && b);
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_wait_times_out() {
        let probe = Arc::new(BusyFor(AtomicUsize::new(usize::MAX)));
        let config = InstancesConfig { timeout_seconds: 600, ..InstancesConfig::default() };
        let waiter = InstanceWaiter::new(probe, config);
        assert!(!waiter.wait().await);
    }
}
