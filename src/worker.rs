//! Worker lifecycle.
//!
//! A [`Worker`] owns the one thread that runs the event loop. The thread
//! builds the client, primes the pipeline, publishes its loop handle and only
//! then asks the shared [`StateCell`] for permission to enter the loop. A stop
//! request either wins that race (the loop is never entered) or loses it and
//! injects a teardown onto the running loop.
//!
//! Completion is signalled exactly once per worker through a one-shot channel,
//! from a guard that also fires if the thread panics.

use crate::client::{Client, ClientConfig, ClientReport};
use crate::config::{Config, ConfigError};
use crate::context::{Context, ContextHandle, LoopCtx};
use crate::pipeline::PipelineError;
use crate::pool::PoolError;
use crate::shutdown::{self, StateCell, StopOutcome, WorkerState};
use crate::transport::{Transport, TransportError};

use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("slot pool: {0}")]
    Pool(#[from] PoolError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("no connection to send on")]
    NotConnected,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub client: ClientConfig,
    /// Pin the worker thread to this CPU (Linux only).
    pub cpu: Option<usize>,
    pub thread_name: String,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client: ClientConfig {
                params: config.session_params()?,
                depth: config.session.pipeline_depth,
                template: config.template(),
                sample_every: config.session.sample_every,
            },
            cpu: config.cpu()?,
            thread_name: "slotpipe-worker".to_string(),
        })
    }
}

/// How the worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Completed,
    /// Startup failed; the loop was never entered.
    Failed(String),
    Panicked,
}

/// Sent once when the worker thread finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    pub loop_entered: bool,
    pub client: ClientReport,
}

impl WorkerReport {
    fn panicked() -> Self {
        Self {
            status: WorkerStatus::Panicked,
            loop_entered: false,
            client: ClientReport::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Completed
    }
}

struct Shared<T: Transport> {
    state: StateCell,
    handle: OnceLock<ContextHandle<Client<T>>>,
}

/// Signals completion when dropped. Starts out reporting a panic so an
/// unwinding thread still reports something.
struct CompletionGuard<T: Transport> {
    tx: Sender<WorkerReport>,
    shared: Arc<Shared<T>>,
    report: WorkerReport,
}

impl<T: Transport> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.shared.state.mark_exited();
        // the owner may already be gone
        let _ = self.tx.send(self.report.clone());
    }
}

pub struct Worker<T: Transport> {
    shared: Arc<Shared<T>>,
    done_rx: Receiver<WorkerReport>,
    thread: Option<JoinHandle<()>>,
    report: Option<WorkerReport>,
}

impl<T: Transport> Worker<T> {
    /// Spawn the worker thread.
    pub fn start(config: WorkerConfig, transport: T) -> Result<Self, WorkerError> {
        let shared = Arc::new(Shared {
            state: StateCell::new(),
            handle: OnceLock::new(),
        });
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || {
                    let mut guard = CompletionGuard {
                        tx: done_tx,
                        shared: shared.clone(),
                        report: WorkerReport::panicked(),
                    };
                    let status = match run(config, transport, &shared, &mut guard.report) {
                        Ok(()) => WorkerStatus::Completed,
                        Err(e) => {
                            tracing::error!(error = %e, "worker failed to start");
                            WorkerStatus::Failed(e.to_string())
                        }
                    };
                    guard.report.status = status;
                    tracing::info!("good bye");
                })
                .map_err(WorkerError::Spawn)?
        };

        Ok(Self {
            shared,
            done_rx,
            thread: Some(thread),
            report: None,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.load()
    }

    /// True once the worker thread has signalled completion.
    pub fn is_finished(&self) -> bool {
        self.state() == WorkerState::Exited
    }

    /// Ask the worker to shut down. Callable any number of times; only the
    /// first call has an effect.
    pub fn request_stop(&self) -> StopOutcome {
        let outcome = self.shared.state.request_stop();
        match outcome {
            StopOutcome::PreventedEntry => {
                tracing::info!("exit signaled");
            }
            StopOutcome::InjectTeardown => {
                tracing::info!("exit signaled");
                // published before the loop could be entered
                match self.shared.handle.get() {
                    Some(handle) => {
                        let injected = handle.inject(|client: &mut Client<T>, ctx: &mut LoopCtx| {
                            shutdown::teardown(client, ctx);
                        });
                        if injected.is_err() {
                            tracing::debug!("loop already gone, nothing to tear down");
                        }
                    }
                    None => tracing::warn!("loop running without a published handle"),
                }
            }
            StopOutcome::AlreadyRequested | StopOutcome::AlreadyExited => {
                tracing::debug!(?outcome, "stop already in progress");
            }
        }
        outcome
    }

    /// Block until the worker thread has finished. Never times out.
    pub fn wait(&mut self) -> WorkerReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let report = self
            .done_rx
            .recv()
            .unwrap_or_else(|_| WorkerReport::panicked());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("worker thread panicked");
        }
        self.report = Some(report.clone());
        report
    }

    /// Request a stop and wait for completion.
    pub fn stop(&mut self) -> WorkerReport {
        self.request_stop();
        self.wait()
    }
}

impl<T: Transport> Drop for Worker<T> {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.stop();
        }
    }
}

fn run<T: Transport>(
    config: WorkerConfig,
    transport: T,
    shared: &Shared<T>,
    report: &mut WorkerReport,
) -> Result<(), WorkerError> {
    #[cfg(target_os = "linux")]
    if let Some(cpu) = config.cpu {
        if let Err(e) = pin_to_cpu(cpu) {
            tracing::warn!("failed to pin worker to CPU {}: {}", cpu, e);
        } else {
            tracing::debug!("pinned worker to CPU {}", cpu);
        }
    }

    let mut context = Context::<Client<T>>::new();
    let mut client = Client::open(transport, &config.client, context.sink())?;

    if let Err(e) = client.prime() {
        client.close_now();
        report.client = client.finish();
        return Err(e);
    }

    // The handle must be visible before a stop can observe Running.
    let _ = shared.handle.set(context.handle());

    if !shared.state.try_enter_loop() {
        tracing::info!("stop requested before the event loop started");
        client.close_now();
        report.client = client.finish();
        return Ok(());
    }

    report.loop_entered = true;
    tracing::debug!(depth = config.client.depth, "entering event loop");
    context.run_loop(&mut client);
    drop(context);

    report.client = client.finish();
    Ok(())
}

/// Pin the current thread to a specific CPU core.
#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) -> io::Result<()> {
    use std::mem;

    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu_id, &mut cpuset);

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset);

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
