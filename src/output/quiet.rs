//! Quiet formatter with minimal single-line output.

use super::format::{format_count, format_latency_us};
use super::{OutputFormatter, Results, Sample};
use crate::config::Config;
use std::time::Duration;

/// Quiet formatter that only outputs final results on a single line.
pub struct QuietFormatter;

impl QuietFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuietFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFormatter for QuietFormatter {
    fn print_config(&self, _config: &Config) {}

    fn print_running(&self, _duration: Option<Duration>) {}

    fn print_header(&self) {}

    fn print_sample(&self, _sample: &Sample) {}

    fn print_results(&self, results: &Results) {
        let throughput = if results.duration_secs > 0.0 {
            results.responses as f64 / results.duration_secs
        } else {
            0.0
        };

        println!(
            "{}  {} rsp/s  p50={} p99={} max={}  errors={}",
            results.status,
            format_count(throughput as u64),
            format_latency_us(results.latency.p50_us),
            format_latency_us(results.latency.p99_us),
            format_latency_us(results.latency.max_us),
            results.send_errors,
        );
    }
}
