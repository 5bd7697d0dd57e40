//! Output formatting for CLI results
//!
//! This module provides consistent output formatting across all CLI commands.
//! It supports three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use serde::Serialize;

use modhost_core::{DiscoveryReport, Module};
use modhost_updater::{
    AvailableUpdate, BackupInfo, DownloadProgress, UpdateOutcome, UpdatePreview, UpdateRecord, UpdateStatus,
};

use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for scripting
    Json,
    /// Minimal output - exit codes only
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

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    /// Whether the operation was successful
    pub success: bool,
    /// The response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Command that was executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
            command: None,
        }
    }

    /// Create a successful response with command context
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::success(data)
        }
    }
}

impl JsonResponse<()> {
    /// Create an error response
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
    colors: bool,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self {
            format,
            verbose,
            colors: true,
        }
    }

    /// Enable or disable coloured status cells
    pub fn with_colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    /// Get the current output format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Format the module list
    pub fn format_modules(&self, modules: &[Module]) -> String {
        match self.format {
            OutputFormat::Table => self.modules_table(modules),
            OutputFormat::Json => {
                let output: Vec<ModuleOutput> = modules.iter().map(ModuleOutput::from).collect();
                self.to_json_response(&output, "module list")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a discovery report
    pub fn format_discovery(&self, report: &DiscoveryReport) -> String {
        match self.format {
            OutputFormat::Table => self.discovery_table(report),
            OutputFormat::Json => self.to_json_response(report, "module discover"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format an update preview
    pub fn format_preview(&self, preview: &UpdatePreview) -> String {
        match self.format {
            OutputFormat::Table => self.preview_table(preview),
            OutputFormat::Json => self.to_json_response(preview, "module update --preview"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a completed update
    pub fn format_update(&self, outcome: &UpdateOutcome) -> String {
        match self.format {
            OutputFormat::Table => self.update_table(outcome),
            OutputFormat::Json => self.to_json_response(&UpdateOutput::from(outcome), "module update"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format the backups of a module
    pub fn format_backups(&self, backups: &[BackupInfo]) -> String {
        match self.format {
            OutputFormat::Table => self.backups_table(backups),
            OutputFormat::Json => self.to_json_response(&backups, "module backups"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format update history, newest first
    pub fn format_history(&self, records: &[UpdateRecord]) -> String {
        match self.format {
            OutputFormat::Table => self.history_table(records),
            OutputFormat::Json => {
                let output: Vec<RecordOutput> = records.iter().map(RecordOutput::from).collect();
                self.to_json_response(&output, "module history")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format the modules that have a newer release
    pub fn format_available(&self, updates: &[AvailableUpdate]) -> String {
        match self.format {
            OutputFormat::Table => self.available_table(updates),
            OutputFormat::Json => self.to_json_response(&updates, "module check-updates"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a generic success result
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Table => String::new(),
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, error: &anyhow::Error, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error:#}"),
            OutputFormat::Json => self.to_json(&ErrorOutput {
                success: false,
                error: format!("{error:#}"),
                exit_code: code as i32,
                exit_code_name: code.name(),
                timestamp: Utc::now().to_rfc3339(),
            }),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Print an error to the channel that fits the format
    pub fn report_error(&self, error: &anyhow::Error, code: ExitCode) {
        let message = self.format_error_with_code(error, code);
        match self.format {
            OutputFormat::Table => eprintln!("{message}"),
            OutputFormat::Json => println!("{message}"),
            OutputFormat::Quiet => {}
        }
    }

    /// Format progress message (only shown in verbose mode)
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    /// Report artifact download progress (only shown in verbose mode)
    pub fn download_progress(&self, progress: DownloadProgress) {
        if progress.total > 0 {
            self.progress(&format!(
                "Downloaded {} of {} bytes ({:.0}%)",
                progress.downloaded,
                progress.total,
                progress.percentage()
            ));
        } else {
            self.progress(&format!("Downloaded {} bytes", progress.downloaded));
        }
    }

    /// Format success message
    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    /// Format warning message
    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        } else if self.format == OutputFormat::Json {
            eprintln!(
                "{}",
                self.to_json(&WarningOutput {
                    warning: message.to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                })
            );
        }
    }

    /// Format info message (only in verbose mode)
    pub fn info(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            println!("ℹ {message}");
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    /// Format data with consistent JSON response wrapper
    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        let response = JsonResponse::success_with_command(value, command);
        serde_json::to_string_pretty(&response).unwrap_or_else(|e| {
            let err_response = JsonResponse::<()>::error(&format!("Serialization error: {e}"));
            self.to_json(&err_response)
        })
    }

    fn status_cell(&self, status: UpdateStatus) -> Cell {
        let style = status.style();
        let cell = Cell::new(style.label);
        match colour(style.colour) {
            Some(color) if self.colors => cell.fg(color),
            _ => cell,
        }
    }

    fn modules_table(&self, modules: &[Module]) -> String {
        if modules.is_empty() {
            return "No modules registered. Run `modhost module discover` first.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Name", "Version", "Status", "Dependencies", "Repository"]);

        for m in modules {
            let status = Cell::new(m.status().to_string());
            let status = match (self.colors, m.is_enabled()) {
                (true, true) => status.fg(Color::Green),
                (true, false) => status.fg(Color::DarkGrey),
                (false, _) => status,
            };
            table.add_row(vec![
                Cell::new(&m.name),
                Cell::new(m.version.to_string()),
                status,
                Cell::new(or_dash(m.dependencies.join(", "))),
                Cell::new(m.repository.as_ref().map_or_else(|| "-".to_string(), |r| r.to_string())),
            ]);
        }

        table.to_string()
    }

    fn discovery_table(&self, report: &DiscoveryReport) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Result", "Modules"]);
        table.add_row(vec!["Discovered", &or_dash(report.discovered.join(", "))]);
        table.add_row(vec!["Refreshed", &or_dash(report.refreshed.join(", "))]);
        table.add_row(vec!["Missing", &or_dash(report.missing.join(", "))]);
        table.add_row(vec!["Invalid", &or_dash(report.invalid.join("\n"))]);
        table.to_string()
    }

    fn preview_table(&self, preview: &UpdatePreview) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Module", &preview.module]);
        table.add_row(vec![
            "Version",
            &format!("{} -> {}", preview.from_version, preview.to_version),
        ]);
        table.add_row(vec!["Release", &preview.tag]);
        table.add_row(vec!["Major Upgrade", yes_no(preview.is_major)]);
        table.add_row(vec![
            "Requires Core",
            &preview
                .requires_core
                .as_ref()
                .map_or_else(|| "any".to_string(), |c| c.to_string()),
        ]);
        table.add_row(vec!["Core Compatible", yes_no(preview.core_compatible)]);
        table.add_row(vec!["Checksum Published", yes_no(preview.has_checksum)]);
        table.add_row(vec![
            "Pending Migrations (installed)",
            &or_dash(preview.installed_pending_migrations.join("\n")),
        ]);
        table.add_row(vec![
            "Pending Seeders (installed)",
            &or_dash(preview.installed_pending_seeders.join("\n")),
        ]);
        table.add_row(vec![
            "Published At",
            &preview.published_at.map(format_time).unwrap_or_else(|| "-".to_string()),
        ]);
        table.add_row(vec!["Changelog", &or_dash(preview.changelog.trim().to_string())]);
        table.to_string()
    }

    fn update_table(&self, outcome: &UpdateOutcome) -> String {
        let record = &outcome.record;
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec![Cell::new("Module"), Cell::new(&record.module)]);
        table.add_row(vec![Cell::new("Status"), self.status_cell(record.status())]);
        table.add_row(vec![
            Cell::new("Version"),
            Cell::new(format!("{} -> {}", record.from_version, target_version(record))),
        ]);
        table.add_row(vec![
            Cell::new("Migrations Run"),
            Cell::new(or_dash(record.migrations_run.join("\n"))),
        ]);
        table.add_row(vec![Cell::new("Seeders Run"), Cell::new(or_dash(record.seeders_run.join("\n")))]);
        table.add_row(vec![
            Cell::new("Backup"),
            Cell::new(outcome.backup.path.display().to_string()),
        ]);
        if let Some(duration) = record.duration() {
            table.add_row(vec![
                Cell::new("Duration"),
                Cell::new(format!("{:.1}s", duration.num_milliseconds() as f64 / 1000.0)),
            ]);
        }
        table.to_string()
    }

    fn backups_table(&self, backups: &[BackupInfo]) -> String {
        if backups.is_empty() {
            return "No backups found.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Version", "Created At", "Size", "Path"]);

        for b in backups {
            table.add_row(vec![
                b.version.to_string(),
                format_time(b.created_at),
                format_size(b.size),
                b.path.display().to_string(),
            ]);
        }

        table.to_string()
    }

    fn history_table(&self, records: &[UpdateRecord]) -> String {
        if records.is_empty() {
            return "No updates recorded.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Started At", "From", "To", "Status", "Error"]);

        for r in records {
            table.add_row(vec![
                Cell::new(format_time(r.started_at)),
                Cell::new(r.from_version.to_string()),
                Cell::new(target_version(r)),
                self.status_cell(r.status()),
                Cell::new(r.error.as_deref().unwrap_or("-")),
            ]);
        }

        table.to_string()
    }

    fn available_table(&self, updates: &[AvailableUpdate]) -> String {
        if updates.is_empty() {
            return "All modules are up to date.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Module", "Installed", "Available", "Major", "Core Compatible"]);

        for u in updates {
            let compatible = Cell::new(yes_no(u.core_compatible));
            let compatible = if self.colors && !u.core_compatible {
                compatible.fg(Color::Red)
            } else {
                compatible
            };
            table.add_row(vec![
                Cell::new(&u.module),
                Cell::new(u.installed.to_string()),
                Cell::new(u.release.version.to_string()),
                Cell::new(yes_no(u.is_major)),
                compatible,
            ]);
        }

        table.to_string()
    }
}

/// Map a status colour name to a terminal colour.
fn colour(name: &str) -> Option<Color> {
    match name {
        "grey" => Some(Color::DarkGrey),
        "blue" => Some(Color::Blue),
        "cyan" => Some(Color::Cyan),
        "magenta" => Some(Color::Magenta),
        "green" => Some(Color::Green),
        "red" => Some(Color::Red),
        "yellow" => Some(Color::Yellow),
        _ => None,
    }
}

fn target_version(record: &UpdateRecord) -> String {
    record
        .to_version
        .as_ref()
        .map_or_else(|| "?".to_string(), |v| v.to_string())
}

fn or_dash(value: String) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

// JSON output structures

#[derive(Serialize)]
struct ErrorOutput {
    success: bool,
    error: String,
    exit_code: i32,
    exit_code_name: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct WarningOutput {
    warning: String,
    timestamp: String,
}

#[derive(Serialize)]
struct ModuleOutput {
    name: String,
    display_name: String,
    version: String,
    status: String,
    dependencies: Vec<String>,
    repository: Option<String>,
    path: String,
    enabled_at: Option<String>,
    updated_at: String,
}

impl From<&Module> for ModuleOutput {
    fn from(m: &Module) -> Self {
        Self {
            name: m.name.clone(),
            display_name: m.display_name.clone(),
            version: m.version.to_string(),
            status: m.status().to_string(),
            dependencies: m.dependencies.clone(),
            repository: m.repository.as_ref().map(|r| r.to_string()),
            path: m.path.display().to_string(),
            enabled_at: m.enabled_at().map(|t| t.to_rfc3339()),
            updated_at: m.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct RecordOutput<'a> {
    #[serde(flatten)]
    record: &'a UpdateRecord,
    label: &'static str,
}

impl<'a> From<&'a UpdateRecord> for RecordOutput<'a> {
    fn from(record: &'a UpdateRecord) -> Self {
        Self {
            record,
            label: record.status().style().label,
        }
    }
}

#[derive(Serialize)]
struct UpdateOutput<'a> {
    #[serde(flatten)]
    record: RecordOutput<'a>,
    backup: &'a BackupInfo,
    warnings: &'a [String],
}

impl<'a> From<&'a UpdateOutcome> for UpdateOutput<'a> {
    fn from(outcome: &'a UpdateOutcome) -> Self {
        Self {
            record: RecordOutput::from(&outcome.record),
            backup: &outcome.backup,
            warnings: &outcome.warnings,
        }
    }
}

/// Simple success message for JSON output
#[derive(Serialize)]
pub struct SuccessMessage {
    pub message: String,
}

impl SuccessMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
