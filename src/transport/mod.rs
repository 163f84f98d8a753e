//! Transport boundary.
//!
//! The client never talks to a socket directly. Everything below the session
//! abstraction (connection establishment, framing, response buffers) lives
//! behind the [`Transport`] trait. A transport is owned by the loop thread and
//! reports everything asynchronous (responses, teardown notifications) through
//! the [`EventSink`] it is handed at connect time.
//!
//! Two implementations ship with the crate:
//! - [`mem::MemTransport`]: an in-process peer, used for loopback runs and tests
//! - [`tcp::TcpTransport`]: length-prefixed frames over a TCP stream

pub mod mem;
pub mod tcp;

use crossbeam_channel::Sender;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Opaque session handle issued by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

/// Opaque connection handle issued by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parameters for opening a client session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Session URI, e.g. `tcp://10.0.0.1:1234`. Informational for most transports.
    pub uri: String,
    /// Peer address to connect to.
    pub peer: SocketAddr,
    /// Upper bound on connection establishment.
    pub connect_timeout: Duration,
}

/// A request as seen by the transport: borrowed views of a slot's buffers.
#[derive(Debug, Clone, Copy)]
pub struct Outbound<'a> {
    pub sn: u64,
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

/// A completed request delivered by the transport.
///
/// The header and payload buffers belong to the transport. They must be handed
/// back with [`Transport::release_response`]; the client never frees them.
#[derive(Debug)]
pub struct Response {
    /// Sequence number of the request this answers.
    pub sn: u64,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Kind of a session-level notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionDisconnected,
    ConnectionRefused,
    ConnectionError,
    /// The connection is gone; its handle may be released.
    ConnectionTeardown,
    /// The session is gone; no further events will arrive for it.
    SessionTeardown,
    SessionReject,
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionEventKind::ConnectionEstablished => "connection established",
            SessionEventKind::ConnectionClosed => "connection closed",
            SessionEventKind::ConnectionDisconnected => "connection disconnected",
            SessionEventKind::ConnectionRefused => "connection refused",
            SessionEventKind::ConnectionError => "connection error",
            SessionEventKind::ConnectionTeardown => "connection teardown",
            SessionEventKind::SessionTeardown => "session teardown",
            SessionEventKind::SessionReject => "session reject",
        };
        f.write_str(s)
    }
}

/// Why a notification was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Success,
    /// Closed by a local destroy call.
    LocalClose,
    /// Closed by the peer.
    PeerClose,
    Refused,
    Timeout,
    Io(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Success => f.write_str("success"),
            Reason::LocalClose => f.write_str("closed locally"),
            Reason::PeerClose => f.write_str("closed by peer"),
            Reason::Refused => f.write_str("connection refused"),
            Reason::Timeout => f.write_str("timed out"),
            Reason::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

/// A session-level notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub reason: Reason,
    /// Connection the event refers to, if any.
    pub connection: Option<ConnectionId>,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, reason: Reason, connection: Option<ConnectionId>) -> Self {
        Self {
            kind,
            reason,
            connection,
        }
    }

    pub fn connection_teardown(connection: ConnectionId, reason: Reason) -> Self {
        Self::new(SessionEventKind::ConnectionTeardown, reason, Some(connection))
    }

    pub fn session_teardown(reason: Reason) -> Self {
        Self::new(SessionEventKind::SessionTeardown, reason, None)
    }
}

/// Everything a transport can report to the loop.
#[derive(Debug)]
pub enum TransportEvent {
    Response(Response),
    Session(SessionEvent),
}

/// Delivery end of a loop's transport event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<TransportEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event for the loop. Returns `false` once the loop's context
    /// has been destroyed; the event is dropped in that case.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn deliver_response(&self, response: Response) -> bool {
        self.deliver(TransportEvent::Response(response))
    }

    pub fn deliver_session(&self, event: SessionEvent) -> bool {
        self.deliver(TransportEvent::Session(event))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session could not be created: {0}")]
    SessionCreate(String),
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },
    #[error("unknown or closed connection {0}")]
    NotConnected(ConnectionId),
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Session/connection transport used by the client.
///
/// All methods are called from the loop thread only. Destroy calls are fire
/// and forget: a transport reports their completion through teardown
/// notifications. Destroying a connection must eventually produce a
/// `ConnectionTeardown` followed by a `SessionTeardown` for its session.
pub trait Transport: Send + 'static {
    /// Short name for logs and output.
    fn name(&self) -> &'static str;

    fn session_create(&mut self, params: &SessionParams) -> Result<SessionId, TransportError>;

    /// Release a session handle. Produces no further notifications.
    fn session_destroy(&mut self, session: SessionId);

    /// Bind a connection for `session` to the loop that owns `sink`.
    fn connect(
        &mut self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<ConnectionId, TransportError>;

    /// Start closing a connection; teardown notifications follow on the sink.
    fn connection_destroy(&mut self, connection: ConnectionId);

    fn send_request(
        &mut self,
        connection: ConnectionId,
        request: Outbound<'_>,
    ) -> Result<(), TransportError>;

    /// Return a response's buffers to the transport.
    fn release_response(&mut self, response: Response);
}
