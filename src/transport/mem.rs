//! In-process transport.
//!
//! [`MemTransport`] is the client side; [`MemPeer`] is a handle to the fake
//! remote end sharing the same state. The peer either answers every request
//! immediately ([`RespondMode::Auto`], used by `--loopback`) or queues them
//! until a test answers explicitly ([`RespondMode::Manual`]).

use super::*;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

const RESPONSE_HEADER: &[u8] = b"hello world header response";
const RESPONSE_PAYLOAD: &[u8] = b"hello world iovec response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondMode {
    /// Answer each request as it is sent.
    Auto,
    /// Queue requests until [`MemPeer::respond`] is called.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// `connection_destroy` reports both teardown notifications at once.
    Immediate,
    /// Notifications wait for [`MemPeer::complete_teardown`].
    Deferred,
}

#[derive(Debug)]
struct MemConnection {
    session: SessionId,
    sink: EventSink,
    open: bool,
}

#[derive(Debug)]
struct MemState {
    respond: RespondMode,
    teardown: TeardownMode,
    next_id: u64,
    connections: HashMap<ConnectionId, MemConnection>,
    outstanding: VecDeque<(ConnectionId, u64)>,
    /// Connections closed locally whose notifications are still held back.
    pending_teardown: Vec<ConnectionId>,
    /// Sequence numbers in send order. Only kept in manual mode.
    sent: Vec<u64>,
    requests: u64,
    sessions_created: u64,
    sessions_destroyed: u64,
    connections_destroyed: u64,
    responses_leased: u64,
    responses_released: u64,
    fail_next_session: Option<String>,
    connect_held: bool,
    connect_waiting: bool,
}

impl MemState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn answer(&mut self, connection: ConnectionId, sn: u64) -> bool {
        let Some(conn) = self.connections.get(&connection) else {
            return false;
        };
        if !conn.open {
            return false;
        }
        let delivered = conn.sink.deliver_response(Response {
            sn,
            header: RESPONSE_HEADER.to_vec(),
            payload: RESPONSE_PAYLOAD.to_vec(),
        });
        if delivered {
            self.responses_leased += 1;
        }
        delivered
    }

    /// Close `connection` and report the teardown pair for it.
    fn close(&mut self, connection: ConnectionId, reason: Reason) {
        self.outstanding.retain(|(c, _)| *c != connection);
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        conn.open = false;
        conn.sink
            .deliver_session(SessionEvent::connection_teardown(connection, reason.clone()));
        conn.sink
            .deliver_session(SessionEvent::session_teardown(reason));
        tracing::debug!(%connection, session = %conn.session, "loopback connection closed");
    }
}

struct Shared {
    state: Mutex<MemState>,
    gate: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client half of the in-process transport.
pub struct MemTransport {
    shared: Arc<Shared>,
}

impl MemTransport {
    /// Create a transport and the peer handle that controls it.
    pub fn new(respond: RespondMode, teardown: TeardownMode) -> (Self, MemPeer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(MemState {
                respond,
                teardown,
                next_id: 0,
                connections: HashMap::new(),
                outstanding: VecDeque::new(),
                pending_teardown: Vec::new(),
                sent: Vec::new(),
                requests: 0,
                sessions_created: 0,
                sessions_destroyed: 0,
                connections_destroyed: 0,
                responses_leased: 0,
                responses_released: 0,
                fail_next_session: None,
                connect_held: false,
                connect_waiting: false,
            }),
            gate: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MemPeer { shared },
        )
    }

    /// Auto-responding loopback with immediate teardown.
    pub fn loopback() -> (Self, MemPeer) {
        Self::new(RespondMode::Auto, TeardownMode::Immediate)
    }
}

impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn session_create(&mut self, params: &SessionParams) -> Result<SessionId, TransportError> {
        let mut state = self.shared.lock();
        if let Some(reason) = state.fail_next_session.take() {
            return Err(TransportError::SessionCreate(reason));
        }
        state.sessions_created += 1;
        let session = SessionId(state.next_id());
        tracing::debug!(%session, uri = %params.uri, "loopback session created");
        Ok(session)
    }

    fn session_destroy(&mut self, session: SessionId) {
        let mut state = self.shared.lock();
        state.sessions_destroyed += 1;
        tracing::debug!(%session, "loopback session destroyed");
    }

    fn connect(
        &mut self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<ConnectionId, TransportError> {
        let mut state = self.shared.lock();
        if state.connect_held {
            state.connect_waiting = true;
            self.shared.gate.notify_all();
            while state.connect_held {
                state = self
                    .shared
                    .gate
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.connect_waiting = false;
        }
        let connection = ConnectionId(state.next_id());
        state.connections.insert(
            connection,
            MemConnection {
                session,
                sink,
                open: true,
            },
        );
        Ok(connection)
    }

    fn connection_destroy(&mut self, connection: ConnectionId) {
        let mut state = self.shared.lock();
        state.connections_destroyed += 1;
        let open = state
            .connections
            .get(&connection)
            .is_some_and(|conn| conn.open);
        if !open {
            // already torn down; this only releases the handle
            return;
        }
        match state.teardown {
            TeardownMode::Immediate => state.close(connection, Reason::LocalClose),
            TeardownMode::Deferred => {
                state.outstanding.retain(|(c, _)| *c != connection);
                if let Some(conn) = state.connections.get_mut(&connection) {
                    conn.open = false;
                }
                state.pending_teardown.push(connection);
            }
        }
    }

    fn send_request(
        &mut self,
        connection: ConnectionId,
        request: Outbound<'_>,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        let open = state
            .connections
            .get(&connection)
            .is_some_and(|conn| conn.open);
        if !open {
            return Err(TransportError::NotConnected(connection));
        }
        state.requests += 1;
        match state.respond {
            RespondMode::Auto => {
                state.answer(connection, request.sn);
            }
            RespondMode::Manual => {
                state.sent.push(request.sn);
                state.outstanding.push_back((connection, request.sn));
            }
        }
        Ok(())
    }

    fn release_response(&mut self, response: Response) {
        let mut state = self.shared.lock();
        state.responses_released += 1;
        drop(response);
    }
}

/// Remote end of a [`MemTransport`]. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct MemPeer {
    shared: Arc<Shared>,
}

impl MemPeer {
    /// Answer the outstanding request with sequence number `sn`.
    pub fn respond(&self, sn: u64) -> bool {
        let mut state = self.shared.lock();
        let Some(pos) = state.outstanding.iter().position(|(_, s)| *s == sn) else {
            return false;
        };
        let Some((connection, sn)) = state.outstanding.remove(pos) else {
            return false;
        };
        state.answer(connection, sn)
    }

    /// Answer every outstanding request in the order it was sent.
    pub fn respond_all(&self) -> usize {
        let mut state = self.shared.lock();
        let pending: Vec<_> = state.outstanding.drain(..).collect();
        pending
            .into_iter()
            .filter(|(connection, sn)| state.answer(*connection, *sn))
            .count()
    }

    /// Deliver a response the client never asked for.
    pub fn respond_unsolicited(&self, sn: u64) -> bool {
        let mut state = self.shared.lock();
        let Some(connection) = state
            .connections
            .iter()
            .find(|(_, conn)| conn.open)
            .map(|(id, _)| *id)
        else {
            return false;
        };
        state.answer(connection, sn)
    }

    /// Sequence numbers sent but not yet answered.
    pub fn outstanding(&self) -> Vec<u64> {
        self.shared.lock().outstanding.iter().map(|(_, sn)| *sn).collect()
    }

    /// Every sequence number sent, in order. Empty in [`RespondMode::Auto`],
    /// which runs unbounded; use [`MemPeer::requests`] there.
    pub fn sent(&self) -> Vec<u64> {
        self.shared.lock().sent.clone()
    }

    /// Number of requests accepted, in either mode.
    pub fn requests(&self) -> u64 {
        self.shared.lock().requests
    }

    /// Close every open connection from the peer side.
    pub fn disconnect(&self) {
        let mut state = self.shared.lock();
        let open: Vec<_> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.open)
            .map(|(id, _)| *id)
            .collect();
        for connection in open {
            state.close(connection, Reason::PeerClose);
        }
    }

    /// Deliver the notifications held back by [`TeardownMode::Deferred`].
    pub fn complete_teardown(&self) -> usize {
        let mut state = self.shared.lock();
        let pending = std::mem::take(&mut state.pending_teardown);
        let count = pending.len();
        for connection in pending {
            state.close(connection, Reason::LocalClose);
        }
        count
    }

    /// Push an arbitrary notification to the loop of the first connection
    /// ever made, open or not. Returns `false` if there is none.
    pub fn notify(&self, event: SessionEvent) -> bool {
        let state = self.shared.lock();
        match state.connections.iter().min_by_key(|(id, _)| id.0) {
            Some((_, conn)) => conn.sink.deliver_session(event),
            None => false,
        }
    }

    /// Make the next `session_create` fail.
    pub fn fail_next_session(&self, reason: impl Into<String>) {
        self.shared.lock().fail_next_session = Some(reason.into());
    }

    /// Block `connect` calls until [`MemPeer::release_connect`].
    pub fn hold_connect(&self) {
        self.shared.lock().connect_held = true;
    }

    /// Wait until a `connect` call is parked on the gate.
    pub fn wait_for_connect(&self) {
        let mut state = self.shared.lock();
        while !state.connect_waiting {
            state = self
                .shared
                .gate
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn release_connect(&self) {
        self.shared.lock().connect_held = false;
        self.shared.gate.notify_all();
    }

    pub fn sessions_created(&self) -> u64 {
        self.shared.lock().sessions_created
    }

    pub fn sessions_destroyed(&self) -> u64 {
        self.shared.lock().sessions_destroyed
    }

    pub fn connections_destroyed(&self) -> u64 {
        self.shared.lock().connections_destroyed
    }

    pub fn responses_leased(&self) -> u64 {
        self.shared.lock().responses_leased
    }

    pub fn responses_released(&self) -> u64 {
        self.shared.lock().responses_released
    }
}
