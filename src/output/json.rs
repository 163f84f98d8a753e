//! JSON (NDJSON) formatter for machine-readable output.

use super::{LatencyStats, OutputFormatter, Results, Sample};
use crate::config::{Config, TransportKind};
use serde::Serialize;
use std::time::Duration;

/// JSON formatter outputting NDJSON (newline-delimited JSON).
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ConfigOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    transport: &'static str,
    pipeline: usize,
    header_bytes: usize,
    payload_bytes: usize,
    sample_every: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_list: Option<String>,
}

#[derive(Serialize)]
struct SampleOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    ts: String,
    req_s: u64,
    rsp_s: u64,
    err_s: f64,
    in_flight: i64,
    p50_us: u64,
    p90_us: u64,
    p99_us: u64,
    p999_us: u64,
    max_us: u64,
}

#[derive(Serialize)]
struct LatencyOutput {
    p50_us: u64,
    p90_us: u64,
    p99_us: u64,
    p999_us: u64,
    max_us: u64,
}

impl From<&LatencyStats> for LatencyOutput {
    fn from(stats: &LatencyStats) -> Self {
        Self {
            p50_us: stats.p50_us as u64,
            p90_us: stats.p90_us as u64,
            p99_us: stats.p99_us as u64,
            p999_us: stats.p999_us as u64,
            max_us: stats.max_us as u64,
        }
    }
}

#[derive(Serialize)]
struct ResultsOutput<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    status: &'a str,
    loop_entered: bool,
    duration_secs: f64,
    requests: u64,
    responses: u64,
    resends: u64,
    send_errors: u64,
    dropped: u64,
    skipped: u64,
    throughput: u64,
    session_events: u64,
    slots_released: usize,
    latency: LatencyOutput,
}

fn config_json(config: &Config) -> serde_json::Result<String> {
    let output = ConfigOutput {
        msg_type: "config",
        target: config.peer().ok().map(|addr| addr.to_string()),
        transport: match config.target.transport {
            TransportKind::Tcp => "tcp",
            TransportKind::Loopback => "loopback",
        },
        pipeline: config.session.pipeline_depth,
        header_bytes: config.session.header.len(),
        payload_bytes: config.template().payload_len(),
        sample_every: config.session.sample_every,
        duration_secs: config.general.duration.map(|d| d.as_secs()),
        cpu_list: config.general.cpu_list.clone(),
    };
    serde_json::to_string(&output)
}

fn sample_json(sample: &Sample) -> serde_json::Result<String> {
    let output = SampleOutput {
        msg_type: "sample",
        ts: sample.timestamp.to_rfc3339(),
        req_s: sample.req_per_sec as u64,
        rsp_s: sample.rsp_per_sec as u64,
        err_s: sample.err_per_sec,
        in_flight: sample.in_flight,
        p50_us: sample.p50_us as u64,
        p90_us: sample.p90_us as u64,
        p99_us: sample.p99_us as u64,
        p999_us: sample.p999_us as u64,
        max_us: sample.max_us as u64,
    };
    serde_json::to_string(&output)
}

fn results_json(results: &Results) -> serde_json::Result<String> {
    let throughput = if results.duration_secs > 0.0 {
        (results.responses as f64 / results.duration_secs) as u64
    } else {
        0
    };
    let output = ResultsOutput {
        msg_type: "results",
        status: &results.status,
        loop_entered: results.loop_entered,
        duration_secs: results.duration_secs,
        requests: results.requests,
        responses: results.responses,
        resends: results.resends,
        send_errors: results.send_errors,
        dropped: results.dropped,
        skipped: results.skipped,
        throughput,
        session_events: results.session_events,
        slots_released: results.slots_released,
        latency: LatencyOutput::from(&results.latency),
    };
    serde_json::to_string(&output)
}

impl OutputFormatter for JsonFormatter {
    fn print_config(&self, config: &Config) {
        if let Ok(json) = config_json(config) {
            println!("{}", json);
        }
    }

    fn print_running(&self, _duration: Option<Duration>) {
        // JSON format doesn't print running indicator
    }

    fn print_header(&self) {
        // JSON format doesn't have a header
    }

    fn print_sample(&self, sample: &Sample) {
        if let Ok(json) = sample_json(sample) {
            println!("{}", json);
        }
    }

    fn print_results(&self, results: &Results) {
        if let Ok(json) = results_json(results) {
            println!("{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sample_line() {
        let sample = Sample {
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            req_per_sec: 1500.7,
            rsp_per_sec: 1499.2,
            err_per_sec: 0.0,
            in_flight: 512,
            p50_us: 10.4,
            p90_us: 20.0,
            p99_us: 30.0,
            p999_us: 40.0,
            max_us: 50.9,
        };
        let value: serde_json::Value = serde_json::from_str(&sample_json(&sample).unwrap()).unwrap();
        assert_eq!(value["type"], "sample");
        assert_eq!(value["ts"], "2024-01-02T03:04:05+00:00");
        assert_eq!(value["req_s"], 1500);
        assert_eq!(value["in_flight"], 512);
        assert_eq!(value["max_us"], 50);
    }

    #[test]
    fn test_config_line_omits_unset_target() {
        let config = Config::default();
        let value: serde_json::Value = serde_json::from_str(&config_json(&config).unwrap()).unwrap();
        assert_eq!(value["type"], "config");
        assert!(value.get("target").is_none());
        assert_eq!(value["pipeline"], 512);
        assert_eq!(value["transport"], "tcp");
    }

    #[test]
    fn test_results_line() {
        let results = Results {
            duration_secs: 2.0,
            status: "completed".to_string(),
            loop_entered: true,
            requests: 100,
            responses: 96,
            resends: 92,
            send_errors: 0,
            dropped: 0,
            skipped: 0,
            session_events: 2,
            slots_released: 4,
            latency: LatencyStats::default(),
        };
        let value: serde_json::Value = serde_json::from_str(&results_json(&results).unwrap()).unwrap();
        assert_eq!(value["throughput"], 48);
        assert_eq!(value["slots_released"], 4);
        assert_eq!(value["latency"]["p50_us"], 0);
    }
}
