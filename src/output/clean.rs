//! Clean table formatter with optional color output.

use super::format::{format_count, format_latency_padded, format_rate_padded};
use super::{ColorMode, LatencyStats, OutputFormatter, Results, Sample};
use crate::config::{Config, TransportKind};
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of sample rows between header reprints.
const HEADER_REPEAT_INTERVAL: u64 = 25;

const RULE: &str = "─────────┼───────┼───────┼───────┼────────┼────────┼────────┼────────┼────────┼───────";

/// ANSI escape codes for colors.
mod ansi {
    pub const RED: &str = "\x1b[31m";
    pub const RESET: &str = "\x1b[0m";
}

/// Clean table formatter with optional color support.
pub struct CleanFormatter {
    use_color: bool,
    sample_count: AtomicU64,
}

impl CleanFormatter {
    pub fn new(color_mode: ColorMode) -> Self {
        let use_color = match color_mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
        };
        Self {
            use_color,
            sample_count: AtomicU64::new(0),
        }
    }

    fn red(&self, s: &str) -> String {
        if self.use_color {
            format!("{}{}{}", ansi::RED, s, ansi::RESET)
        } else {
            s.to_string()
        }
    }

    fn maybe_red(&self, s: &str, condition: bool) -> String {
        if condition {
            self.red(s)
        } else {
            s.to_string()
        }
    }
}

impl OutputFormatter for CleanFormatter {
    fn print_config(&self, config: &Config) {
        println!("slotpipe");
        println!("──────────────────");

        let target = match config.peer() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unset>".to_string(),
        };
        let transport = match config.target.transport {
            TransportKind::Tcp => "tcp",
            TransportKind::Loopback => "loopback",
        };
        println!("target     {} ({})", target, transport);

        let payload = config.template().payload_len();
        println!(
            "requests   {}B header, {}B payload",
            config.session.header.len(),
            payload
        );
        println!("pipeline   {}", config.session.pipeline_depth);

        if let Some(ref cpu_list) = config.general.cpu_list {
            println!("pinned     {}", cpu_list);
        }
        if config.session.sample_every > 0 {
            println!(
                "sampling   every {} responses",
                format_count(config.session.sample_every)
            );
        }

        println!();
    }

    fn print_running(&self, duration: Option<Duration>) {
        match duration {
            Some(d) => println!("[running {}s]", d.as_secs()),
            None => println!("[running until stopped]"),
        }
        println!();
    }

    fn print_header(&self) {
        println!(
            "time UTC │ req/s │ rsp/s │ err/s │ flight │    p50 │    p90 │    p99 │  p99.9 │    max"
        );
        println!("{}", RULE);
        let _ = io::stdout().flush();
    }

    fn print_sample(&self, sample: &Sample) {
        let count = self.sample_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count.is_multiple_of(HEADER_REPEAT_INTERVAL) {
            println!("{}", RULE);
            self.print_header();
        }

        let time = sample.timestamp.format("%H:%M:%S");
        let req = format_rate_padded(sample.req_per_sec, 5);
        let rsp = format_rate_padded(sample.rsp_per_sec, 5);
        let err = format_rate_padded(sample.err_per_sec, 5);
        let err = self.maybe_red(&err, sample.err_per_sec > 0.0);

        println!(
            "{} │ {} │ {} │ {} │{:>7} │{} │{} │{} │{} │{}",
            time,
            req,
            rsp,
            err,
            sample.in_flight,
            format_latency_padded(sample.p50_us, 7),
            format_latency_padded(sample.p90_us, 7),
            format_latency_padded(sample.p99_us, 7),
            format_latency_padded(sample.p999_us, 7),
            format_latency_padded(sample.max_us, 7),
        );
        let _ = io::stdout().flush();
    }

    fn print_results(&self, results: &Results) {
        let rule = "─────────────────────────────────────────────────────────────────────";
        println!();
        println!("{}", rule);
        println!("RESULTS ({:.0}s)", results.duration_secs);
        println!("{}", rule);

        let status = self.maybe_red(&results.status, results.status != "completed");
        println!("status       {}", status);
        if !results.loop_entered {
            println!("             stopped before the event loop started");
        }

        let throughput = if results.duration_secs > 0.0 {
            results.responses as f64 / results.duration_secs
        } else {
            0.0
        };
        println!("throughput   {} rsp/s", format_count(throughput as u64));
        println!(
            "requests     {} sent, {} resent, {} responses",
            format_count(results.requests),
            format_count(results.resends),
            format_count(results.responses)
        );

        let anomalies = format!(
            "{} send errors, {} dropped, {} skipped",
            results.send_errors, results.dropped, results.skipped
        );
        let bad = results.send_errors > 0 || results.dropped > 0;
        println!("anomalies    {}", self.maybe_red(&anomalies, bad));
        println!();

        println!(
            "latency      {:>6}  {:>6}  {:>6}  {:>6}  {:>6}",
            "p50", "p90", "p99", "p99.9", "max"
        );
        println!("{}", format_latency_row("response", &results.latency));
        println!();

        println!(
            "session      {} events, {} slots released",
            results.session_events, results.slots_released
        );
    }
}

fn format_latency_row(name: &str, stats: &LatencyStats) -> String {
    format!(
        "{:<12} {}  {}  {}  {}  {}",
        name,
        format_latency_padded(stats.p50_us, 6),
        format_latency_padded(stats.p90_us, 6),
        format_latency_padded(stats.p99_us, 6),
        format_latency_padded(stats.p999_us, 6),
        format_latency_padded(stats.max_us, 6),
    )
}
