//! Output formatting for run progress and results.
//!
//! Provides multiple output formats:
//! - Clean: Human-readable table format with colors
//! - Json: NDJSON format for machine parsing
//! - Quiet: Minimal single-line output

mod clean;
pub mod format;
mod json;
mod quiet;

pub use clean::CleanFormatter;
pub use json::JsonFormatter;
pub use quiet::QuietFormatter;

use crate::config::Config;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Output format selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Clean table format with colors (default).
    #[default]
    Clean,
    /// NDJSON format for machine parsing.
    Json,
    /// Minimal single-line output.
    Quiet,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean" => Ok(OutputFormat::Clean),
            "json" => Ok(OutputFormat::Json),
            "quiet" => Ok(OutputFormat::Quiet),
            _ => Err(format!(
                "invalid format '{}', expected: clean, json, quiet",
                s
            )),
        }
    }
}

/// Color mode selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// Auto-detect based on TTY and NO_COLOR env var (default).
    #[default]
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

impl std::str::FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ColorMode::Auto),
            "always" => Ok(ColorMode::Always),
            "never" => Ok(ColorMode::Never),
            _ => Err(format!(
                "invalid color mode '{}', expected: auto, always, never",
                s
            )),
        }
    }
}

/// A periodic sample of client metrics.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub req_per_sec: f64,
    pub rsp_per_sec: f64,
    pub err_per_sec: f64,
    pub in_flight: i64,
    pub p50_us: f64,
    pub p90_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub max_us: f64,
}

/// Latency percentiles over the whole run.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub p50_us: f64,
    pub p90_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub max_us: f64,
}

/// Final results.
#[derive(Debug, Clone)]
pub struct Results {
    pub duration_secs: f64,
    /// How the worker ended ("completed", "failed: ...", "panicked").
    pub status: String,
    pub loop_entered: bool,
    pub requests: u64,
    pub responses: u64,
    pub resends: u64,
    pub send_errors: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub session_events: u64,
    pub slots_released: usize,
    pub latency: LatencyStats,
}

/// Trait for output formatters.
pub trait OutputFormatter: Send + Sync {
    /// Print the configuration summary at startup.
    fn print_config(&self, config: &Config);

    /// Print the running phase indicator. `None` runs until stopped.
    fn print_running(&self, duration: Option<Duration>);

    /// Print the table header (for formats that use one).
    fn print_header(&self);

    /// Print a periodic sample.
    fn print_sample(&self, sample: &Sample);

    /// Print the final results.
    fn print_results(&self, results: &Results);
}

/// Create a formatter based on the output format and color mode.
pub fn create_formatter(format: OutputFormat, color: ColorMode) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Clean => Box::new(CleanFormatter::new(color)),
        OutputFormat::Json => Box::new(JsonFormatter::new()),
        OutputFormat::Quiet => Box::new(QuietFormatter::new()),
    }
}
