//! Session client.
//!
//! A [`Client`] owns everything the loop thread touches: the transport, the
//! session state machine, the slot pool and the pipeline. It is the loop's
//! [`SessionHandler`], so notifications and responses reach it one at a time
//! on the loop thread and it needs no locking.

use crate::context::{LoopCtx, SessionHandler};
use crate::metrics;
use crate::pipeline::{Pipeline, PipelineStats};
use crate::pool::{SlotPool, SlotTemplate};
use crate::session::{SessionMachine, SessionState, Transition};
use crate::transport::{
    ConnectionId, EventSink, Response, SessionEvent, SessionParams, Transport,
};
use crate::worker::WorkerError;

/// Everything needed to open a session and fill its pipeline.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub params: SessionParams,
    pub depth: usize,
    pub template: SlotTemplate,
    /// Log every n-th response; 0 disables sampling.
    pub sample_every: u64,
}

/// Summary handed back once the client is finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientReport {
    pub stats: PipelineStats,
    pub session_events: u64,
    pub slots_released: usize,
}

pub struct Client<T: Transport> {
    transport: T,
    session: SessionMachine,
    pool: Option<SlotPool>,
    pipeline: Pipeline,
    session_events: u64,
}

impl<T: Transport> Client<T> {
    /// Create the session, connect it to the loop behind `sink` and allocate
    /// the slot pool.
    ///
    /// Whatever was acquired before a failure is released before returning.
    pub fn open(mut transport: T, config: &ClientConfig, sink: EventSink) -> Result<Self, WorkerError> {
        let mut session = SessionMachine::new();

        let id = transport.session_create(&config.params)?;
        session.begin(id);

        let connection = match transport.connect(id, sink) {
            Ok(connection) => connection,
            Err(e) => {
                transport.session_destroy(id);
                return Err(e.into());
            }
        };
        session.connected(connection);
        tracing::debug!(
            transport = transport.name(),
            session = %id,
            %connection,
            uri = %config.params.uri,
            "session established"
        );

        let mut client = Self {
            transport,
            session,
            pool: None,
            pipeline: Pipeline::new(config.depth, config.sample_every),
            session_events: 0,
        };

        match SlotPool::allocate(config.depth, &config.template) {
            Ok(pool) => client.pool = Some(pool),
            Err(e) => {
                client.close_now();
                return Err(e.into());
            }
        }
        Ok(client)
    }

    /// Send the initial burst.
    pub fn prime(&mut self) -> Result<usize, WorkerError> {
        let connection = self
            .session
            .connection()
            .ok_or(WorkerError::NotConnected)?;
        let pool = self.pool.as_mut().ok_or(WorkerError::NotConnected)?;
        Ok(self.pipeline.prime(pool, &mut self.transport, connection)?)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.session.connection()
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.as_ref().map_or(0, SlotPool::in_flight)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn has_session(&self) -> bool {
        self.session.session().is_some()
    }

    /// Start a local close of the connection. Returns `false` if there was
    /// none to close.
    pub(crate) fn destroy_connection(&mut self) -> bool {
        let Some(connection) = self.session.take_connection() else {
            return false;
        };
        self.release_connection(connection);
        true
    }

    /// Release the session (and a connection still held). Returns `false`
    /// if it was already gone.
    pub(crate) fn destroy_session(&mut self) -> bool {
        let Some((session, connection)) = self.session.take_session() else {
            return false;
        };
        if let Some(connection) = connection {
            self.release_connection(connection);
        }
        self.transport.session_destroy(session);
        tracing::debug!(%session, "session released");
        true
    }

    /// Release every handle without waiting for notifications. Used when no
    /// loop will run to deliver them.
    pub fn close_now(&mut self) {
        self.destroy_connection();
        self.destroy_session();
    }

    /// Free the slot pool. Must only be called once the loop has stopped.
    pub fn finish(mut self) -> ClientReport {
        let slots_released = match self.pool.take() {
            Some(mut pool) => {
                self.pipeline.abandon_in_flight(&mut pool);
                pool.release_all()
            }
            None => 0,
        };
        if self.session.session().is_some() {
            tracing::warn!(state = %self.session.state(), "client finished with a live session");
        }
        ClientReport {
            stats: self.pipeline.stats(),
            session_events: self.session_events,
            slots_released,
        }
    }

    /// Slots stay marked in flight; responses already queued for the loop
    /// still arrive and leave their slot idle.
    fn release_connection(&mut self, connection: ConnectionId) {
        self.transport.connection_destroy(connection);
        tracing::debug!(%connection, "connection released");
    }
}

impl<T: Transport> SessionHandler for Client<T> {
    fn on_session_event(&mut self, event: SessionEvent, ctx: &mut LoopCtx) {
        tracing::info!("session event: {}. reason: {}", event.kind, event.reason);
        self.session_events += 1;
        metrics::SESSION_EVENTS.increment();

        match self.session.on_event(&event) {
            Transition::None => {}
            Transition::ReleaseConnection(connection) => self.release_connection(connection),
            Transition::ReleaseSession {
                session,
                connection,
            } => {
                if let Some(connection) = connection {
                    self.release_connection(connection);
                }
                self.transport.session_destroy(session);
                tracing::debug!(%session, "session released");
                ctx.stop_loop();
            }
        }
    }

    fn on_response(&mut self, response: Response, _ctx: &mut LoopCtx) {
        let connection = self.session.connection();
        match self.pool.as_mut() {
            Some(pool) => {
                self.pipeline
                    .on_response(pool, &mut self.transport, connection, response);
            }
            None => self.transport.release_response(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::pool::PoolError;
    use crate::transport::Reason;
    use crate::transport::mem::{MemPeer, MemTransport, RespondMode, TeardownMode};

    use std::time::Duration;

    fn config(depth: usize) -> ClientConfig {
        ClientConfig {
            params: SessionParams {
                uri: "tcp://127.0.0.1:7000".to_string(),
                peer: "127.0.0.1:7000".parse().unwrap(),
                connect_timeout: Duration::from_secs(1),
            },
            depth,
            template: SlotTemplate::default(),
            sample_every: 0,
        }
    }

    fn open(depth: usize) -> (Client<MemTransport>, Context<Client<MemTransport>>, MemPeer) {
        let (transport, peer) = MemTransport::new(RespondMode::Manual, TeardownMode::Immediate);
        let context = Context::new();
        let client = Client::open(transport, &config(depth), context.sink()).unwrap();
        (client, context, peer)
    }

    #[test]
    fn test_open_and_prime() {
        let (mut client, _context, peer) = open(3);
        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(client.prime().unwrap(), 3);
        assert_eq!(peer.outstanding(), vec![0, 1, 2]);
        assert_eq!(client.in_flight(), 3);
    }

    #[test]
    fn test_session_create_failure() {
        let (transport, peer) = MemTransport::loopback();
        peer.fail_next_session("refused");
        let context = Context::<Client<MemTransport>>::new();
        let err = Client::open(transport, &config(1), context.sink()).err().unwrap();
        assert!(matches!(err, WorkerError::Transport(_)));
        assert_eq!(peer.sessions_created(), 0);
    }

    #[test]
    fn test_pool_failure_releases_session() {
        let (transport, peer) = MemTransport::loopback();
        let context = Context::<Client<MemTransport>>::new();
        let mut cfg = config(2);
        cfg.template = SlotTemplate::default().with_payload_size(usize::MAX);

        let err = Client::open(transport, &cfg, context.sink()).err().unwrap();
        assert!(matches!(
            err,
            WorkerError::Pool(PoolError::OutOfMemory { .. })
        ));
        assert_eq!(peer.connections_destroyed(), 1);
        assert_eq!(peer.sessions_destroyed(), 1);
    }

    #[test]
    fn test_peer_teardown_stops_loop_and_releases_once() {
        let (mut client, mut context, peer) = open(2);
        client.prime().unwrap();

        peer.disconnect();
        assert!(context.poll(&mut client));
        assert_eq!(client.state(), SessionState::SessionTornDown);
        // unanswered requests are only given up once the loop is done
        assert_eq!(client.in_flight(), 2);
        assert_eq!(peer.connections_destroyed(), 1);
        assert_eq!(peer.sessions_destroyed(), 1);

        // a repeated pair changes nothing
        peer.notify(SessionEvent::connection_teardown(
            ConnectionId(2),
            Reason::PeerClose,
        ));
        peer.notify(SessionEvent::session_teardown(Reason::PeerClose));
        assert!(!context.poll(&mut client));
        assert_eq!(peer.connections_destroyed(), 1);
        assert_eq!(peer.sessions_destroyed(), 1);

        let report = client.finish();
        assert_eq!(report.slots_released, 2);
        assert_eq!(report.session_events, 4);
    }

    #[test]
    fn test_response_after_connection_teardown_is_released() {
        let (mut client, mut context, peer) = open(2);
        client.prime().unwrap();
        peer.respond(0);
        client.destroy_connection();

        context.poll(&mut client);
        assert_eq!(peer.responses_released(), 1);
        assert_eq!(client.stats().resends, 0);
        assert_eq!(client.stats().skipped, 1);
        assert_eq!(client.stats().dropped, 0);
        assert_eq!(peer.sent().len(), 2);
    }

    #[test]
    fn test_queued_responses_skip_after_local_close() {
        let (transport, peer) = MemTransport::new(RespondMode::Manual, TeardownMode::Deferred);
        let mut context = Context::<Client<MemTransport>>::new();
        let mut client = Client::open(transport, &config(2), context.sink()).unwrap();
        client.prime().unwrap();

        peer.respond(0);
        peer.respond(1);
        assert!(client.destroy_connection());
        assert!(!context.poll(&mut client));

        let stats = client.stats();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.resends, 0);
        assert_eq!(client.in_flight(), 0);
        assert_eq!(peer.responses_released(), 2);

        peer.complete_teardown();
        assert!(context.poll(&mut client));
        let report = client.finish();
        assert_eq!(report.slots_released, 2);
    }
}
