//! Output formatting for CLI results
//!
//! Three output formats are supported:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting
//! - Quiet: Exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use updater_core::{CheckOutcome, UpdateEvent, UpdatePrefs, UpdateRecord, UpdateState, UpdateStatus};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub command: String,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: command.to_string(),
        }
    }
}

/// Serializable view of an update record.
#[derive(Debug, Serialize)]
pub struct UpdateSummary {
    pub version: String,
    pub build_id: Option<String>,
    pub channel: String,
    pub state: UpdateStatus,
    pub error_code: i32,
    pub patch: Option<String>,
    pub size: Option<u64>,
    pub status_text: Option<String>,
    pub install_date: String,
}

impl From<&UpdateRecord> for UpdateSummary {
    fn from(update: &UpdateRecord) -> Self {
        let patch = update.selected_patch();
        Self {
            version: update.app_version.clone().unwrap_or_default(),
            build_id: update.build_id.clone(),
            channel: update.channel.clone(),
            state: update.state(),
            error_code: update.error_code(),
            patch: patch.map(|p| p.patch_type.as_str().to_string()),
            size: patch.map(|p| p.size),
            status_text: update.status_text.clone(),
            install_date: format_time(update.install_date),
        }
    }
}

/// Everything `status` reports.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub state: UpdateState,
    pub has_lock: bool,
    pub ready: Option<UpdateSummary>,
    pub downloading: Option<UpdateSummary>,
    pub prefs: UpdatePrefs,
}

/// Result of `check`.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CheckOutput {
    NotAllowed,
    Failed { code: i32, message: String },
    NoUpdate,
    Available { update: UpdateSummary, reason: updater_core::AvailableReason },
    Downloading { version: String },
    AlreadyDownloaded { version: String },
}

impl From<&CheckOutcome> for CheckOutput {
    fn from(outcome: &CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::NotAllowed => CheckOutput::NotAllowed,
            CheckOutcome::Failed { code } => {
                CheckOutput::Failed { code: *code, message: updater_core::codes::status_text(*code) }
            }
            CheckOutcome::NoUpdate => CheckOutput::NoUpdate,
            CheckOutcome::Available { update, reason } => {
                CheckOutput::Available { update: update.into(), reason: *reason }
            }
            CheckOutcome::Downloading { version } => CheckOutput::Downloading { version: version.clone() },
            CheckOutcome::AlreadyDownloaded { version } => {
                CheckOutput::AlreadyDownloaded { version: version.clone() }
            }
        }
    }
}

/// Formats output for the selected mode
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    pub fn format_status(&self, status: &StatusOutput) -> String {
        match self.format {
            OutputFormat::Table => self.status_table(status),
            OutputFormat::Json => self.to_json_response(status, "status"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_history(&self, history: &[UpdateRecord]) -> String {
        match self.format {
            OutputFormat::Table => self.history_table(history),
            OutputFormat::Json => {
                let rows: Vec<UpdateSummary> = history.iter().map(UpdateSummary::from).collect();
                self.to_json_response(&rows, "history")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_check(&self, outcome: &CheckOutcome) -> String {
        let output = CheckOutput::from(outcome);
        match self.format {
            OutputFormat::Table => check_line(&output),
            OutputFormat::Json => self.to_json_response(&output, "check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// One line per event; JSON mode prints one object per line.
    pub fn format_event(&self, event: &UpdateEvent) -> Option<String> {
        match self.format {
            OutputFormat::Table => {
                if !self.verbose && matches!(event, UpdateEvent::DownloadProgress { .. }) {
                    return None;
                }
                Some(format!("{}: {}", event.name(), serde_json::to_string(event).ok()?))
            }
            OutputFormat::Json => serde_json::to_string(event).ok(),
            OutputFormat::Quiet => None,
        }
    }

    /// Progress message, shown only in verbose table mode
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        let response = JsonResponse::success(value, command);
        serde_json::to_string_pretty(&response).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn status_table(&self, status: &StatusOutput) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["State".to_string(), status.state.to_string()]);
        table.add_row(vec!["Update lock".to_string(), if status.has_lock { "held" } else { "busy" }.to_string()]);
        table.add_row(vec!["Ready".to_string(), summary_cell(status.ready.as_ref())]);
        table.add_row(vec!["Downloading".to_string(), summary_cell(status.downloading.as_ref())]);
        table.add_row(vec!["Download attempts".to_string(), status.prefs.download_attempts.to_string()]);
        table.add_row(vec!["Background errors".to_string(), status.prefs.background_errors.to_string()]);
        table.add_row(vec!["Elevation attempts".to_string(), status.prefs.elevate_attempts.to_string()]);
        table.add_row(vec![
            "Service".to_string(),
            if status.prefs.service_disabled { "disabled" } else { "enabled" }.to_string(),
        ]);
        table.to_string()
    }

    fn history_table(&self, history: &[UpdateRecord]) -> String {
        if history.is_empty() {
            return "No update history.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Version", "Build", "State", "Code", "Installed", "Status"]);
        for update in history {
            let row = UpdateSummary::from(update);
            table.add_row(vec![
                row.version,
                row.build_id.unwrap_or_else(|| "-".to_string()),
                row.state.to_string(),
                if row.error_code == 0 { "-".to_string() } else { row.error_code.to_string() },
                row.install_date,
                row.status_text.unwrap_or_else(|| "-".to_string()),
            ]);
        }
        table.to_string()
    }
}

fn summary_cell(summary: Option<&UpdateSummary>) -> String {
    match summary {
        Some(s) => format!(
            "{} ({}, {} patch)",
            s.version,
            s.state,
            s.patch.as_deref().unwrap_or("no")
        ),
        None => "-".to_string(),
    }
}

fn check_line(output: &CheckOutput) -> String {
    match output {
        CheckOutput::NotAllowed => "Update checks are disabled.".to_string(),
        CheckOutput::Failed { code, message } => format!("Check failed: {message} ({code})"),
        CheckOutput::NoUpdate => "No update available.".to_string(),
        CheckOutput::Available { update, reason } => {
            format!("Update {} available ({:?}).", update.version, reason)
        }
        CheckOutput::Downloading { version } => format!("Downloading update {version}."),
        CheckOutput::AlreadyDownloaded { version } => format!("Update {version} is already downloaded."),
    }
}

/// Formats milliseconds since the epoch as RFC 3339.
fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}
