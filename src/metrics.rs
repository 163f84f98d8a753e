//! Client metrics.
//!
//! Process-wide counters sampled by the reporting loop in `main`. Tests that
//! need exact numbers use the per-pipeline [`crate::pipeline::PipelineStats`]
//! instead, since these are shared by every client in the process.

use metriken::{AtomicHistogram, Counter, Gauge, metric};

#[metric(name = "requests_sent", description = "Total requests sent")]
pub static REQUESTS_SENT: Counter = Counter::new();

#[metric(name = "responses_received", description = "Total responses received")]
pub static RESPONSES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "responses_dropped",
    description = "Responses for slots that were not in flight"
)]
pub static RESPONSES_DROPPED: Counter = Counter::new();

#[metric(name = "send_errors", description = "Requests the transport refused")]
pub static SEND_ERRORS: Counter = Counter::new();

#[metric(
    name = "resends_skipped",
    description = "Slots left idle because the connection was gone"
)]
pub static RESENDS_SKIPPED: Counter = Counter::new();

#[metric(name = "session_events", description = "Session notifications handled")]
pub static SESSION_EVENTS: Counter = Counter::new();

#[metric(name = "in_flight", description = "Requests currently outstanding")]
pub static IN_FLIGHT: Gauge = Gauge::new();

#[metric(
    name = "response_latency",
    description = "Request to response latency histogram (nanoseconds)"
)]
pub static RESPONSE_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);
