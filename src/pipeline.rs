//! Pipeline engine.
//!
//! Keeps every slot of the pool in flight: [`Pipeline::prime`] sends the
//! initial burst and [`Pipeline::on_response`] resends a slot as soon as its
//! response has been consumed.

use crate::metrics;
use crate::pool::{Slot, SlotPool};
use crate::transport::{ConnectionId, Response, Transport, TransportError};

use std::time::Instant;

/// Default interval between sampled response logs.
pub const DEFAULT_SAMPLE_EVERY: u64 = 4_000_000;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline already primed")]
    AlreadyPrimed,
    #[error("initial send of slot {slot} failed: {source}")]
    Prime {
        slot: usize,
        #[source]
        source: TransportError,
    },
}

/// Per-pipeline counters. Unlike the process-wide metrics these belong to a
/// single client, so they are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Every request handed to the transport, including the initial burst.
    pub sent: u64,
    pub responses: u64,
    pub resends: u64,
    /// Responses that arrived after the connection was gone.
    pub skipped: u64,
    pub send_errors: u64,
    /// Responses that matched no in-flight slot.
    pub dropped: u64,
}

/// What happened to a slot after its response was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Resent,
    /// No connection; the slot stays idle.
    Skipped,
    /// The transport refused the resend; the slot stays idle.
    SendFailed,
    /// Not a response to an in-flight request.
    Dropped,
}

#[derive(Debug)]
pub struct Pipeline {
    depth: usize,
    sample_every: u64,
    since_sample: u64,
    primed: bool,
    stats: PipelineStats,
}

impl Pipeline {
    /// `sample_every == 0` turns sampling off.
    pub fn new(depth: usize, sample_every: u64) -> Self {
        Self {
            depth,
            sample_every,
            since_sample: 0,
            primed: false,
            stats: PipelineStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Slot that owns sequence number `sn`.
    pub fn slot_for(&self, sn: u64) -> usize {
        (sn % self.depth as u64) as usize
    }

    /// Send every slot once, in index order.
    pub fn prime<T: Transport + ?Sized>(
        &mut self,
        pool: &mut SlotPool,
        transport: &mut T,
        connection: ConnectionId,
    ) -> Result<usize, PipelineError> {
        if self.primed {
            return Err(PipelineError::AlreadyPrimed);
        }
        self.primed = true;

        let mut sent = 0;
        for slot in pool.iter_mut() {
            let index = slot.index();
            if let Err(source) = self.send(slot, transport, connection) {
                self.stats.send_errors += 1;
                metrics::SEND_ERRORS.increment();
                return Err(PipelineError::Prime {
                    slot: index,
                    source,
                });
            }
            sent += 1;
        }
        tracing::debug!(depth = self.depth, sent, "pipeline primed");
        Ok(sent)
    }

    /// Consume `response` and reissue its slot.
    ///
    /// The response's buffers always go back to the transport, whatever the
    /// outcome.
    pub fn on_response<T: Transport + ?Sized>(
        &mut self,
        pool: &mut SlotPool,
        transport: &mut T,
        connection: Option<ConnectionId>,
        response: Response,
    ) -> ResponseOutcome {
        let now = Instant::now();
        self.stats.responses += 1;
        metrics::RESPONSES_RECEIVED.increment();

        let index = self.slot_for(response.sn);
        let Some(slot) = pool.get_mut(index) else {
            return self.drop_response(transport, response, "no such slot");
        };
        if !slot.is_in_flight() || slot.sn() != response.sn {
            return self.drop_response(transport, response, "slot not awaiting this response");
        }

        self.since_sample += 1;
        if self.sample_every > 0 && self.since_sample >= self.sample_every {
            tracing::info!(
                "message: [{}] - {}",
                response.sn + 1,
                String::from_utf8_lossy(&response.header)
            );
            self.since_sample = 0;
        }

        if let Some(latency) = slot.complete(&response, now) {
            let _ = metrics::RESPONSE_LATENCY.increment(latency.as_nanos() as u64);
        }
        metrics::IN_FLIGHT.decrement();

        transport.release_response(response);
        slot.clear_inbound();

        let Some(connection) = connection else {
            self.stats.skipped += 1;
            metrics::RESENDS_SKIPPED.increment();
            tracing::debug!(slot = index, "connection gone, slot left idle");
            return ResponseOutcome::Skipped;
        };

        match self.send(slot, transport, connection) {
            Ok(()) => {
                self.stats.resends += 1;
                ResponseOutcome::Resent
            }
            Err(e) => {
                self.stats.send_errors += 1;
                metrics::SEND_ERRORS.increment();
                tracing::warn!(slot = index, error = %e, "resend failed");
                ResponseOutcome::SendFailed
            }
        }
    }

    /// Mark every outstanding slot idle. Used once the loop has stopped and
    /// no more responses can arrive. Returns the number of slots abandoned.
    pub fn abandon_in_flight(&mut self, pool: &mut SlotPool) -> usize {
        let mut abandoned = 0;
        for slot in pool.iter_mut() {
            if slot.abandon() {
                metrics::IN_FLIGHT.decrement();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::debug!(abandoned, "in-flight requests abandoned");
        }
        abandoned
    }

    fn send<T: Transport + ?Sized>(
        &mut self,
        slot: &mut Slot,
        transport: &mut T,
        connection: ConnectionId,
    ) -> Result<(), TransportError> {
        slot.advance(self.depth);
        transport.send_request(connection, slot.outbound())?;
        slot.mark_sent(Instant::now());
        self.stats.sent += 1;
        metrics::REQUESTS_SENT.increment();
        metrics::IN_FLIGHT.increment();
        Ok(())
    }

    fn drop_response<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        response: Response,
        why: &'static str,
    ) -> ResponseOutcome {
        tracing::warn!(sn = response.sn, reason = why, "dropping response");
        self.stats.dropped += 1;
        metrics::RESPONSES_DROPPED.increment();
        transport.release_response(response);
        ResponseOutcome::Dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, LoopCtx, SessionHandler};
    use crate::pool::SlotTemplate;
    use crate::transport::mem::{MemPeer, MemTransport, RespondMode, TeardownMode};
    use crate::transport::{SessionEvent, SessionParams};

    use std::time::Duration;

    /// Minimal handler that feeds responses straight into a pipeline.
    struct Harness {
        pipeline: Pipeline,
        pool: SlotPool,
        transport: MemTransport,
        connection: Option<ConnectionId>,
        outcomes: Vec<(u64, ResponseOutcome)>,
    }

    impl SessionHandler for Harness {
        fn on_session_event(&mut self, _event: SessionEvent, _ctx: &mut LoopCtx) {}

        fn on_response(&mut self, response: Response, _ctx: &mut LoopCtx) {
            let sn = response.sn;
            let outcome = self.pipeline.on_response(
                &mut self.pool,
                &mut self.transport,
                self.connection,
                response,
            );
            self.outcomes.push((sn, outcome));
        }
    }

    fn harness(depth: usize, sample_every: u64) -> (Harness, Context<Harness>, MemPeer) {
        let (mut transport, peer) = MemTransport::new(RespondMode::Manual, TeardownMode::Immediate);
        let context = Context::new();
        let params = SessionParams {
            uri: "tcp://127.0.0.1:1".to_string(),
            peer: "127.0.0.1:1".parse().unwrap(),
            connect_timeout: Duration::from_secs(1),
        };
        let session = transport.session_create(&params).unwrap();
        let connection = transport.connect(session, context.sink()).unwrap();
        let harness = Harness {
            pipeline: Pipeline::new(depth, sample_every),
            pool: SlotPool::allocate(depth, &SlotTemplate::default()).unwrap(),
            transport,
            connection: Some(connection),
            outcomes: Vec::new(),
        };
        (harness, context, peer)
    }

    fn prime(h: &mut Harness) -> usize {
        let connection = h.connection.unwrap();
        h.pipeline
            .prime(&mut h.pool, &mut h.transport, connection)
            .unwrap()
    }

    #[test]
    fn test_prime_sends_each_slot_in_order() {
        let (mut h, _context, peer) = harness(4, 0);
        assert_eq!(prime(&mut h), 4);
        assert_eq!(peer.sent(), vec![0, 1, 2, 3]);
        assert_eq!(h.pool.in_flight(), 4);
        assert_eq!(h.pipeline.stats().sent, 4);
    }

    #[test]
    fn test_prime_only_once() {
        let (mut h, _context, peer) = harness(2, 0);
        prime(&mut h);
        let connection = h.connection.unwrap();
        assert!(matches!(
            h.pipeline.prime(&mut h.pool, &mut h.transport, connection),
            Err(PipelineError::AlreadyPrimed)
        ));
        assert_eq!(peer.sent().len(), 2);
    }

    #[test]
    fn test_out_of_order_responses_resend_own_slot() {
        let (mut h, mut context, peer) = harness(4, 0);
        prime(&mut h);

        for sn in [2, 0, 3, 1] {
            assert!(peer.respond(sn));
            context.poll(&mut h);
            assert_eq!(h.pool.in_flight(), 4);
        }

        assert_eq!(
            h.outcomes,
            vec![
                (2, ResponseOutcome::Resent),
                (0, ResponseOutcome::Resent),
                (3, ResponseOutcome::Resent),
                (1, ResponseOutcome::Resent),
            ]
        );
        // each resend reuses its slot: next sequence numbers stay congruent
        assert_eq!(peer.sent(), vec![0, 1, 2, 3, 6, 4, 7, 5]);
        for (i, slot) in h.pool.iter().enumerate() {
            assert_eq!(slot.sends(), 2);
            assert_eq!(slot.sn() % 4, i as u64);
        }
        assert_eq!(peer.responses_released(), 4);
    }

    #[test]
    fn test_resend_reuses_slot_buffers() {
        let (mut h, mut context, peer) = harness(1, 0);
        prime(&mut h);
        let header = h.pool.get(0).unwrap().header().as_ptr();

        peer.respond(0);
        context.poll(&mut h);
        assert_eq!(h.pool.get(0).unwrap().header().as_ptr(), header);
        assert_eq!(h.pool.get(0).unwrap().sn(), 1);
    }

    #[test]
    fn test_duplicate_response_is_dropped_and_released() {
        let (mut h, mut context, peer) = harness(2, 0);
        prime(&mut h);

        peer.respond(0);
        context.poll(&mut h);
        // slot 0 now waits for sn 2; a repeat of sn 0 is stale
        assert!(peer.respond_unsolicited(0));
        context.poll(&mut h);

        assert_eq!(h.outcomes.last(), Some(&(0, ResponseOutcome::Dropped)));
        assert_eq!(h.pipeline.stats().dropped, 1);
        assert_eq!(peer.responses_released(), peer.responses_leased());
        assert_eq!(h.pool.in_flight(), 2);
    }

    #[test]
    fn test_no_connection_leaves_slot_idle() {
        let (mut h, mut context, peer) = harness(2, 0);
        prime(&mut h);
        h.connection = None;

        peer.respond(1);
        context.poll(&mut h);
        assert_eq!(h.outcomes, vec![(1, ResponseOutcome::Skipped)]);
        assert_eq!(h.pool.in_flight(), 1);
        assert!(h.pool.get(1).unwrap().inbound().sn.is_none());
        assert_eq!(peer.sent().len(), 2);
    }

    #[test]
    fn test_failed_resend_counts_error() {
        let (mut h, mut context, peer) = harness(2, 0);
        prime(&mut h);
        peer.respond(0);
        // the transport closes the connection before the resend
        h.transport.connection_destroy(h.connection.unwrap());
        context.poll(&mut h);

        assert_eq!(h.outcomes, vec![(0, ResponseOutcome::SendFailed)]);
        assert_eq!(h.pipeline.stats().send_errors, 1);
    }

    #[test]
    fn test_sampling_counter_resets() {
        let (mut h, mut context, peer) = harness(1, 3);
        prime(&mut h);
        for sn in 0..7 {
            peer.respond(sn);
            context.poll(&mut h);
        }
        assert_eq!(h.pipeline.since_sample, 1);
        assert_eq!(h.pipeline.stats().resends, 7);
    }

    #[test]
    fn test_abandon_in_flight() {
        let (mut h, _context, _peer) = harness(3, 0);
        prime(&mut h);
        assert_eq!(h.pipeline.abandon_in_flight(&mut h.pool), 3);
        assert_eq!(h.pool.in_flight(), 0);
        assert_eq!(h.pipeline.abandon_in_flight(&mut h.pool), 0);
    }
}
