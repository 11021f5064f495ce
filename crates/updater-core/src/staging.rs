//! Watching the external apply process while it stages an update.
//!
//! Staging runs out of process and may already be running when we start.
//! The only signal is the status file, so it is polled: quickly at first,
//! then less often, and not beyond a fixed ceiling since a crashed apply
//! process never rewrites it.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codes;
use crate::config::StagingConfig;
use crate::status::{read_status, StatusToken, UpdateStatus};

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Staging ended or the ceiling was reached
    Refresh,
    WaitFor(Duration),
}

/// Backoff for the staging poll.
#[derive(Debug, Clone)]
pub struct StagingPollSchedule {
    interval: Duration,
    max_interval: Duration,
    max_duration: Duration,
    attempts_per_interval: u32,
    attempts_remaining: u32,
    elapsed: Duration,
}

impl StagingPollSchedule {
    pub fn new(config: &StagingConfig) -> Self {
        let attempts = config.attempts_per_interval.max(1);
        Self {
            interval: Duration::from_secs(config.min_interval_seconds.max(1)),
            max_interval: Duration::from_secs(config.max_interval_seconds.max(1)),
            max_duration: Duration::from_secs(config.max_duration_seconds),
            attempts_per_interval: attempts,
            attempts_remaining: attempts,
            elapsed: Duration::ZERO,
        }
    }

    /// Delay before the next poll.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Accounts for one poll made after waiting [`Self::interval`].
    ///
    /// Elapsed time is the sum of the intervals waited, not wall-clock
    /// time, so suspend and clock changes do not cut staging short.
    pub fn poll(&mut self, still_applying: bool) -> PollDecision {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.elapsed += self.interval;

        if self.elapsed >= self.max_duration {
            warn!("Staging still running after {:?}, giving up on polling", self.elapsed);
            return PollDecision::Refresh;
        }
        if !still_applying {
            return PollDecision::Refresh;
        }
        if self.attempts_remaining == 0 {
            self.interval = (self.interval * 2).min(self.max_interval);
            self.attempts_remaining = self.attempts_per_interval;
            debug!("Staging poll interval raised to {:?}", self.interval);
        }
        PollDecision::WaitFor(self.interval)
    }
}

/// Polls the status file in `ready_dir` until it no longer says
/// `applying` or the schedule runs out.
pub async fn wait_for_staging_end(ready_dir: &Path, config: &StagingConfig) {
    let mut schedule = StagingPollSchedule::new(config);
    let mut delay = schedule.interval();
    loop {
        tokio::time::sleep(delay).await;
        let still_applying = read_status(ready_dir) == UpdateStatus::Applying.as_str();
        match schedule.poll(still_applying) {
            PollDecision::Refresh => return,
            PollDecision::WaitFor(next) => delay = next,
        }
    }
}

/// What the status file says once staging is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingResult {
    /// Keep `state`; with `rewrite` the status file must be updated to it
    Settled { state: UpdateStatus, rewrite: bool },
    /// Transient staging error; go back to the best pending state
    RetryPending { code: i32 },
    /// The privileged service failed; apply without it
    PendingWithoutService { code: i32 },
    /// Anything else; run failure handling
    Failed { code: i32 },
}

/// Interprets the status file content read after staging.
///
/// A file still saying `applying` means the apply process crashed.
pub fn classify_staging_result(raw_status: &str, service_in_use: bool) -> StagingResult {
    let token: StatusToken = match raw_status.parse() {
        Ok(token) => token,
        Err(e) => {
            warn!("Unreadable status after staging: {}", e);
            StatusToken::failed(codes::INVALID_UPDATER_STATUS_CODE)
        }
    };

    let (state, code) = match token.status {
        UpdateStatus::Applying => {
            info!("Staging appears to have crashed");
            (UpdateStatus::Failed, codes::ERR_UPDATER_CRASHED)
        }
        UpdateStatus::Failed => (
            UpdateStatus::Failed,
            token.error_code.unwrap_or(codes::INVALID_UPDATER_STATUS_CODE),
        ),
        other => (other, 0),
    };

    if state == UpdateStatus::Failed {
        if codes::is_staging_retry_code(code) {
            return StagingResult::RetryPending { code };
        }
        if codes::is_service_specific(code) {
            return StagingResult::PendingWithoutService { code };
        }
        return StagingResult::Failed { code };
    }

    if state == UpdateStatus::Applied && service_in_use {
        return StagingResult::Settled { state: UpdateStatus::AppliedService, rewrite: true };
    }
    StagingResult::Settled { state, rewrite: false }
}
