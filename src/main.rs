use slotpipe::config::parse_duration;
use slotpipe::metrics;
use slotpipe::pipeline::DEFAULT_SAMPLE_EVERY;
use slotpipe::server::{Server, ServerConfig};
use slotpipe::transport::mem::MemTransport;
use slotpipe::transport::tcp::TcpTransport;
use slotpipe::{
    Config, ConfigError, LatencyStats, OutputFormatter, Results, Sample, Transport,
    TransportKind, Worker, WorkerConfig, WorkerReport, WorkerStatus, create_formatter,
};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use metriken::{AtomicHistogram, histogram::Histogram};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "slotpipe")]
#[command(about = "Session-pipelined request/response client")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Peer address (overrides target.ip)
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Peer port (overrides target.port)
    #[arg(long)]
    port: Option<u16>,

    /// Pipeline depth (overrides session.pipeline_depth)
    #[arg(long)]
    depth: Option<usize>,

    /// Stop after this long, e.g. "30s" (overrides general.duration)
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Use the in-process loopback peer instead of TCP
    #[arg(long)]
    loopback: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer requests from slotpipe clients over TCP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:1234")]
    listen: SocketAddr,

    /// Close each connection after this many requests
    #[arg(long)]
    close_after: Option<u64>,

    /// Log every n-th request (0 disables)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_EVERY)]
    sample_every: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    if let Some(Command::Serve(args)) = cli.command {
        return serve(args);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };
    run(config)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(ip) = cli.ip {
        config.target.ip = Some(ip);
    }
    if let Some(port) = cli.port {
        config.target.port = Some(port);
    }
    if let Some(depth) = cli.depth {
        config.session.pipeline_depth = depth;
    }
    if let Some(duration) = cli.duration {
        config.general.duration = Some(duration);
    }
    if cli.loopback {
        config.target.transport = TransportKind::Loopback;
    }

    config.validate()?;
    Ok(config)
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(ServerConfig {
        listen: args.listen,
        close_after: args.close_after,
        sample_every: args.sample_every,
    })?;
    server.serve()?;
    Ok(())
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let worker_config = WorkerConfig::from_config(&config)?;

    let formatter = create_formatter(config.output.format, config.output.color);
    formatter.print_config(&config);

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let (report, elapsed) = match config.target.transport {
        TransportKind::Tcp => {
            let worker = Worker::start(worker_config, TcpTransport::new())?;
            drive(worker, &config, formatter.as_ref(), &running)
        }
        TransportKind::Loopback => {
            let (transport, _peer) = MemTransport::loopback();
            let worker = Worker::start(worker_config, transport)?;
            drive(worker, &config, formatter.as_ref(), &running)
        }
    };

    let results = results(&report, elapsed);
    formatter.print_results(&results);

    if report.is_success() {
        Ok(())
    } else {
        Err(format!("worker {}", results.status).into())
    }
}

/// Sample metrics until the run ends, then stop the worker.
fn drive<T: Transport>(
    mut worker: Worker<T>,
    config: &Config,
    formatter: &dyn OutputFormatter,
    running: &AtomicBool,
) -> (WorkerReport, Duration) {
    let duration = config.general.duration;
    let interval = config.general.report_interval;

    formatter.print_running(duration);
    formatter.print_header();

    let start = Instant::now();
    let mut last_report = Instant::now();
    let mut last_requests = metrics::REQUESTS_SENT.value();
    let mut last_responses = metrics::RESPONSES_RECEIVED.value();
    let mut last_errors = metrics::SEND_ERRORS.value();
    let mut last_histogram: Option<Histogram> = metrics::RESPONSE_LATENCY.load();

    loop {
        std::thread::sleep(Duration::from_millis(100));

        if !running.load(Ordering::SeqCst) {
            tracing::info!("interrupted");
            break;
        }
        if worker.is_finished() {
            tracing::info!("worker finished on its own");
            break;
        }
        if let Some(d) = duration
            && start.elapsed() >= d
        {
            break;
        }

        if last_report.elapsed() >= interval {
            let elapsed_secs = last_report.elapsed().as_secs_f64();
            last_report = Instant::now();

            let requests = metrics::REQUESTS_SENT.value();
            let responses = metrics::RESPONSES_RECEIVED.value();
            let errors = metrics::SEND_ERRORS.value();

            let current_histogram = metrics::RESPONSE_LATENCY.load();
            let latency = match (&current_histogram, &last_histogram) {
                (Some(current), Some(previous)) => current
                    .wrapping_sub(previous)
                    .map(|delta| latency_from_histogram(&delta))
                    .unwrap_or_default(),
                (Some(current), None) => latency_from_histogram(current),
                _ => LatencyStats::default(),
            };
            last_histogram = current_histogram;

            let sample = Sample {
                timestamp: Utc::now(),
                req_per_sec: (requests - last_requests) as f64 / elapsed_secs,
                rsp_per_sec: (responses - last_responses) as f64 / elapsed_secs,
                err_per_sec: (errors - last_errors) as f64 / elapsed_secs,
                in_flight: metrics::IN_FLIGHT.value(),
                p50_us: latency.p50_us,
                p90_us: latency.p90_us,
                p99_us: latency.p99_us,
                p999_us: latency.p999_us,
                max_us: latency.max_us,
            };
            last_requests = requests;
            last_responses = responses;
            last_errors = errors;

            formatter.print_sample(&sample);
        }
    }

    let report = worker.stop();
    (report, start.elapsed())
}

fn results(report: &WorkerReport, elapsed: Duration) -> Results {
    let stats = report.client.stats;
    let status = match &report.status {
        WorkerStatus::Completed => "completed".to_string(),
        WorkerStatus::Failed(e) => format!("failed: {e}"),
        WorkerStatus::Panicked => "panicked".to_string(),
    };
    Results {
        duration_secs: elapsed.as_secs_f64(),
        status,
        loop_entered: report.loop_entered,
        requests: stats.sent,
        responses: stats.responses,
        resends: stats.resends,
        send_errors: stats.send_errors,
        dropped: stats.dropped,
        skipped: stats.skipped,
        session_events: report.client.session_events,
        slots_released: report.client.slots_released,
        latency: cumulative_latency(&metrics::RESPONSE_LATENCY),
    }
}

fn cumulative_latency(hist: &AtomicHistogram) -> LatencyStats {
    match hist.load() {
        Some(snapshot) => latency_from_histogram(&snapshot),
        None => LatencyStats::default(),
    }
}

/// Percentiles of a nanosecond histogram, in microseconds.
fn latency_from_histogram(hist: &Histogram) -> LatencyStats {
    LatencyStats {
        p50_us: percentile_from_histogram(hist, 50.0) / 1000.0,
        p90_us: percentile_from_histogram(hist, 90.0) / 1000.0,
        p99_us: percentile_from_histogram(hist, 99.0) / 1000.0,
        p999_us: percentile_from_histogram(hist, 99.9) / 1000.0,
        max_us: percentile_from_histogram(hist, 100.0) / 1000.0,
    }
}

/// Get a percentile from a histogram snapshot.
fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}
