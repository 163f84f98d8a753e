pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use client::{Client, ClientConfig, ClientReport};
pub use config::{Config, ConfigError, TransportKind, parse_cpu_list};
pub use context::{Context, ContextHandle, LoopCtx, SessionHandler};
pub use output::{
    ColorMode, LatencyStats, OutputFormat, OutputFormatter, Results, Sample, create_formatter,
};
pub use pipeline::{Pipeline, PipelineError, PipelineStats};
pub use pool::{PoolError, SlotPool, SlotTemplate};
pub use session::{SessionMachine, SessionState};
pub use shutdown::{StopOutcome, WorkerState};
pub use transport::{Transport, TransportError};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerReport, WorkerStatus};
