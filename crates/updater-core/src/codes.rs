//! Numeric error codes shared with the external apply process and the
//! manifest checker.
//!
//! Codes below 100 are written by the apply process into the status file.
//! Codes from 89 upwards are produced by this crate. HTTP failures from a
//! manifest check are reported as `HTTP_ERROR_OFFSET + status`.

/// The apply process was still `applying` when control came back to us.
pub const ERR_UPDATER_CRASHED: i32 = 89;
/// The ready update is older than, or the same build as, the running one.
pub const ERR_OLDER_VERSION_OR_SAME_BUILD: i32 = 90;
/// The status file and the update records disagree.
pub const ERR_UPDATE_STATE_NONE: i32 = 91;
/// The ready update belongs to a different channel.
pub const ERR_CHANNEL_CHANGE: i32 = 92;
/// A status token that could not be interpreted.
pub const INVALID_UPDATER_STATUS_CODE: i32 = 99;

/// Background apply needed elevation it could not get silently.
pub const SILENT_UPDATE_NEEDED_ELEVATION_ERROR: i32 = 105;
/// Background apply hit a sharing violation.
pub const BACKGROUND_TASK_SHARING_VIOLATION: i32 = 106;

/// Too many background check failures in a row.
pub const BACKGROUNDCHECK_MULTIPLE_FAILURES: i32 = 110;
/// The manifest request failed because the network is offline.
pub const NETWORK_ERROR_OFFLINE: i32 = 111;
/// The manifest request failed below the HTTP layer.
pub const CHECK_REQUEST_FAILED: i32 = 112;
/// No manifest URL is configured.
pub const CHECK_URL_NOT_AVAILABLE: i32 = 113;
/// The check was stopped before it finished.
pub const CHECK_CANCELLED: i32 = 114;
/// A download was abandoned after failing.
pub const DOWNLOAD_FAILED: i32 = 115;
/// The download destination could not be written.
pub const DOWNLOAD_ACCESS_DENIED: i32 = 116;

/// Offset added to HTTP statuses so they never collide with apply codes.
pub const HTTP_ERROR_OFFSET: i32 = 1000;

/// Staging failed in an unexpected way.
pub const UNEXPECTED_STAGING_ERROR: i32 = 43;
/// The staging lock file could not be removed.
pub const DELETE_ERROR_STAGING_LOCK_FILE: i32 = 44;

/// Memory allocation failures reported by the apply process.
pub const MEMORY_ERRORS: std::ops::RangeInclusive<i32> = 10..=14;

/// Returns true for codes the privileged service reports about itself.
pub fn is_service_specific(code: i32) -> bool {
    (24..=33).contains(&code) || (49..=58).contains(&code)
}

/// Returns true when the apply process failed while staging and the update
/// should simply be retried at the next restart.
pub fn is_staging_retry_code(code: i32) -> bool {
    code == UNEXPECTED_STAGING_ERROR
        || code == DELETE_ERROR_STAGING_LOCK_FILE
        || MEMORY_ERRORS.contains(&code)
}

/// Maps an HTTP status to the code reported for a failed check.
pub fn http_error_code(status: u16) -> i32 {
    HTTP_ERROR_OFFSET + i32::from(status)
}

/// Returns true if `code` was produced by [`http_error_code`].
pub fn is_http_error_code(code: i32) -> bool {
    (HTTP_ERROR_OFFSET + 100..HTTP_ERROR_OFFSET + 600).contains(&code)
}

/// Short human-readable text for a check or apply code.
pub fn status_text(code: i32) -> String {
    match code {
        NETWORK_ERROR_OFFLINE => "Network is offline".to_string(),
        BACKGROUNDCHECK_MULTIPLE_FAILURES => "Repeated background check failures".to_string(),
        CHECK_REQUEST_FAILED => "Update check failed".to_string(),
        CHECK_URL_NOT_AVAILABLE => "No update URL is configured".to_string(),
        CHECK_CANCELLED => "Update check was cancelled".to_string(),
        DOWNLOAD_FAILED => "Download failed".to_string(),
        DOWNLOAD_ACCESS_DENIED => "Download location is not writable".to_string(),
        ERR_UPDATER_CRASHED => "Updater crashed while applying".to_string(),
        ERR_OLDER_VERSION_OR_SAME_BUILD => "Update is not newer than the installed version".to_string(),
        ERR_UPDATE_STATE_NONE => "Update state was lost".to_string(),
        ERR_CHANNEL_CHANGE => "Update channel changed".to_string(),
        c if is_http_error_code(c) => format!("Server returned HTTP {}", c - HTTP_ERROR_OFFSET),
        c if MEMORY_ERRORS.contains(&c) => "Out of memory while applying".to_string(),
        c if is_service_specific(c) => format!("Update service failed ({})", c),
        c => format!("Update failed ({})", c),
    }
}
