use crate::output::{ColorMode, OutputFormat};
use crate::pipeline::DEFAULT_SAMPLE_EVERY;
use crate::pool::SlotTemplate;
use crate::transport::SessionParams;

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Process exit status for configuration errors (`-EINVAL`).
pub const CONFIG_ERROR_EXIT: i32 = -libc::EINVAL;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub output: Output,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Stop after this long. Unset runs until interrupted or the peer ends
    /// the session.
    #[serde(default, with = "humantime_serde_option")]
    pub duration: Option<Duration>,
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
    /// CPU list for pinning the worker thread (Linux style: "0-3,8-11,13").
    /// The first CPU in the list is used.
    #[serde(default)]
    pub cpu_list: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            duration: None,
            report_interval: default_report_interval(),
            cpu_list: None,
        }
    }
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    /// Peer address. Required.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Peer port. Required.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            ip: None,
            port: None,
            transport: TransportKind::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    /// In-process peer that answers every request immediately.
    Loopback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default = "default_header")]
    pub header: String,
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Pad each request payload with zeros up to this many bytes.
    #[serde(default)]
    pub payload_size: Option<usize>,
    /// Log every n-th response; 0 disables sampling.
    #[serde(default = "default_sample_every")]
    pub sample_every: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            pipeline_depth: default_pipeline_depth(),
            header: default_header(),
            payload: default_payload(),
            payload_size: None,
            sample_every: default_sample_every(),
        }
    }
}

fn default_pipeline_depth() -> usize {
    512
}

fn default_header() -> String {
    "hello world header request".to_string()
}

fn default_payload() -> String {
    "hello world iovec request".to_string()
}

fn default_sample_every() -> u64 {
    DEFAULT_SAMPLE_EVERY
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Output {
    /// Output format (clean, json, quiet).
    #[serde(default, with = "output_format_serde")]
    pub format: OutputFormat,
    /// Color mode (auto, always, never).
    #[serde(default, with = "color_mode_serde")]
    pub color: ColorMode,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check everything a run needs before any resource is acquired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.peer()?;
        if self.session.pipeline_depth == 0 {
            return Err(ConfigError::Invalid(
                "session.pipeline_depth must be at least 1".to_string(),
            ));
        }
        if self.general.report_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "general.report_interval must be non-zero".to_string(),
            ));
        }
        self.cpu()?;
        Ok(())
    }

    /// Peer address from `target.ip` and `target.port`.
    pub fn peer(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.target.ip.ok_or(ConfigError::Missing("target.ip"))?;
        let port = self.target.port.ok_or(ConfigError::Missing("target.port"))?;
        if port == 0 {
            return Err(ConfigError::Invalid("target.port must be non-zero".to_string()));
        }
        Ok(SocketAddr::new(ip, port))
    }

    pub fn session_params(&self) -> Result<SessionParams, ConfigError> {
        let peer = self.peer()?;
        Ok(SessionParams {
            uri: format!("tcp://{peer}"),
            peer,
            connect_timeout: self.target.connect_timeout,
        })
    }

    pub fn template(&self) -> SlotTemplate {
        let template = SlotTemplate::new(
            self.session.header.as_bytes(),
            self.session.payload.as_bytes(),
        );
        match self.session.payload_size {
            Some(size) => template.with_payload_size(size),
            None => template,
        }
    }

    /// CPU to pin the worker to, if any.
    pub fn cpu(&self) -> Result<Option<usize>, ConfigError> {
        let Some(list) = &self.general.cpu_list else {
            return Ok(None);
        };
        let cpus = parse_cpu_list(list).map_err(ConfigError::Invalid)?;
        Ok(cpus.first().copied())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Exit status for the process.
    pub fn exit_code(&self) -> i32 {
        CONFIG_ERROR_EXIT
    }
}

/// Parse a Linux-style CPU list string into a vector of CPU IDs.
///
/// Examples:
/// - "0-3" -> [0, 1, 2, 3]
/// - "0,2,4" -> [0, 2, 4]
/// - "0-3,8-11,13" -> [0, 1, 2, 3, 8, 9, 10, 11, 13]
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|_| format!("invalid CPU number: {}", start))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|_| format!("invalid CPU number: {}", end))?;

            if start > end {
                return Err(format!("invalid range: {} > {}", start, end));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|_| format!("invalid CPU number: {}", part))?;
            cpus.push(cpu);
        }
    }

    if cpus.is_empty() {
        return Err("empty CPU list".to_string());
    }
    cpus.sort_unstable();
    cpus.dedup();

    Ok(cpus)
}

/// Parse durations like "60s", "10m", "1h" or "250ms". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (num, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));

    let value: u64 = num.parse().map_err(|e| format!("invalid number: {e}"))?;

    let multiplier = match suffix.trim() {
        "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        "ms" => return Ok(Duration::from_millis(value)),
        "us" => return Ok(Duration::from_micros(value)),
        "ns" => return Ok(Duration::from_nanos(value)),
        "" => 1,
        other => return Err(format!("unknown time unit: {other}")),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| "duration too large".to_string())
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_option {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

mod output_format_serde {
    use crate::output::OutputFormat;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod color_mode_serde {
    use crate::output::ColorMode;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ColorMode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[general]
duration = "30s"
report_interval = "500ms"
cpu_list = "2-3"

[target]
ip = "10.0.0.1"
port = 1234
transport = "tcp"
connect_timeout = "2s"

[session]
pipeline_depth = 64
header = "hdr"
payload = "body"
payload_size = 4096
sample_every = 1000

[output]
format = "json"
color = "never"
"#;

    #[test]
    fn test_parse_full() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.general.duration, Some(Duration::from_secs(30)));
        assert_eq!(config.general.report_interval, Duration::from_millis(500));
        assert_eq!(config.cpu().unwrap(), Some(2));
        assert_eq!(config.peer().unwrap(), "10.0.0.1:1234".parse().unwrap());
        assert_eq!(config.target.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.session.pipeline_depth, 64);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.output.color, ColorMode::Never);

        let template = config.template();
        assert_eq!(template.header_len(), 3);
        assert_eq!(template.payload_len(), 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("[target]\nip = \"127.0.0.1\"\nport = 9000\n").unwrap();
        assert_eq!(config.general.duration, None);
        assert_eq!(config.session.pipeline_depth, 512);
        assert_eq!(config.session.sample_every, 4_000_000);
        assert_eq!(config.target.transport, TransportKind::Tcp);
        assert_eq!(config.template(), SlotTemplate::default());

        let params = config.session_params().unwrap();
        assert_eq!(params.uri, "tcp://127.0.0.1:9000");
    }

    #[test]
    fn test_missing_address_is_config_error() {
        let config = Config::parse("[target]\nport = 9000\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("target.ip")));
        assert_eq!(err.exit_code(), -22);

        let config = Config::parse("[target]\nip = \"127.0.0.1\"\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("target.port"))
        ));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut config = Config::parse(FULL).unwrap();
        config.session.pipeline_depth = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_transport_fails_to_parse() {
        assert!(matches!(
            Config::parse("[target]\ntransport = \"carrier-pigeon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(
            parse_duration("5124095576030432h"),
            Err("duration too large".to_string())
        );
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }
}

#[cfg(test)]
mod cpu_list_tests {
    use super::*;

    #[test]
    fn test_single_cpu() {
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
    }

    #[test]
    fn test_mixed() {
        assert_eq!(
            parse_cpu_list("0-3, 8-11, 13").unwrap(),
            vec![0, 1, 2, 3, 8, 9, 10, 11, 13]
        );
    }

    #[test]
    fn test_duplicates_removed() {
        assert_eq!(parse_cpu_list("1,0,0,1").unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_invalid() {
        assert!(parse_cpu_list("3-0").is_err());
        assert!(parse_cpu_list("x").is_err());
        assert!(parse_cpu_list(" , ").is_err());
    }
}
