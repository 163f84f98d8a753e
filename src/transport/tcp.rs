//! Length-prefixed framing over TCP.
//!
//! Every message, in both directions, is one frame:
//!
//! ```text
//! [u32 body_len][u64 sn][u32 header_len][header][payload]
//! ```
//!
//! All integers are little endian. `body_len` counts everything after itself.
//! Each connection gets a reader thread that decodes response frames and
//! delivers them to the owning loop through its [`EventSink`]; when the
//! stream ends it reports the teardown pair for the connection.

use super::*;
use crate::buffer::Buffer;

use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
const FIXED_BODY: usize = 8 + 4;

/// Response buffers kept for reuse.
const FREE_LIST: usize = 1024;

/// A decoded frame borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub sn: u64,
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

/// Append one frame to `buf`.
pub fn encode_frame(
    buf: &mut Buffer,
    sn: u64,
    header: &[u8],
    payload: &[u8],
) -> Result<(), TransportError> {
    let body = FIXED_BODY + header.len() + payload.len();
    if body > MAX_FRAME {
        return Err(TransportError::TooLarge(body));
    }
    buf.reserve(LEN_PREFIX + body);
    buf.put_u32_le(body as u32);
    buf.put_u64_le(sn);
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(header);
    buf.put_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `data`.
///
/// Returns the frame and the number of bytes it occupies, or `None` if
/// `data` does not hold a complete frame yet.
pub fn decode_frame(data: &[u8]) -> Result<Option<(Frame<'_>, usize)>, io::Error> {
    if data.len() < LEN_PREFIX {
        return Ok(None);
    }
    let body = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if !(FIXED_BODY..=MAX_FRAME).contains(&body) {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("bad frame length {body}"),
        ));
    }
    let total = LEN_PREFIX + body;
    if data.len() < total {
        return Ok(None);
    }

    let body = &data[LEN_PREFIX..total];
    let mut sn = [0u8; 8];
    sn.copy_from_slice(&body[..8]);
    let sn = u64::from_le_bytes(sn);
    let header_len = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
    let rest = &body[FIXED_BODY..];
    if header_len > rest.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("header length {header_len} exceeds frame"),
        ));
    }
    let (header, payload) = rest.split_at(header_len);
    Ok(Some((
        Frame {
            sn,
            header,
            payload,
        },
        total,
    )))
}

struct TcpConnection {
    session: SessionId,
    stream: TcpStream,
    write_buf: Buffer,
    local_close: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

/// Client side of the framed TCP transport.
pub struct TcpTransport {
    next_id: u64,
    sessions: HashMap<SessionId, SessionParams>,
    connections: HashMap<ConnectionId, TcpConnection>,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(FREE_LIST);
        Self {
            next_id: 0,
            sessions: HashMap::new(),
            connections: HashMap::new(),
            free_tx,
            free_rx,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn session_create(&mut self, params: &SessionParams) -> Result<SessionId, TransportError> {
        let session = SessionId(self.next_id());
        self.sessions.insert(session, params.clone());
        tracing::debug!(%session, uri = %params.uri, "tcp session created");
        Ok(session)
    }

    fn session_destroy(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_none() {
            tracing::debug!(%session, "destroy for unknown session");
        }
    }

    fn connect(
        &mut self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<ConnectionId, TransportError> {
        let params = self
            .sessions
            .get(&session)
            .ok_or_else(|| TransportError::SessionCreate(format!("unknown {session}")))?;
        let addr = params.peer;
        let connect_err = |e: io::Error| TransportError::Connect {
            addr,
            reason: e.to_string(),
        };

        let stream = TcpStream::connect_timeout(&addr, params.connect_timeout).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        let read_half = stream.try_clone().map_err(connect_err)?;

        let connection = ConnectionId(self.next_id());
        let local_close = Arc::new(AtomicBool::new(false));
        let reader = {
            let local_close = local_close.clone();
            let free_rx = self.free_rx.clone();
            std::thread::Builder::new()
                .name(format!("tcp-reader-{}", connection.0))
                .spawn(move || read_loop(read_half, connection, sink, free_rx, local_close))
                .map_err(connect_err)?
        };

        tracing::debug!(%connection, %addr, "tcp connection established");
        self.connections.insert(
            connection,
            TcpConnection {
                session,
                stream,
                write_buf: Buffer::new(),
                local_close,
                reader: Some(reader),
            },
        );
        Ok(connection)
    }

    fn connection_destroy(&mut self, connection: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&connection) else {
            tracing::debug!(%connection, "destroy for unknown connection");
            return;
        };
        conn.local_close.store(true, Ordering::Release);
        // fails with NotConnected if the peer already went away
        let _ = conn.stream.shutdown(Shutdown::Both);
        // the reader exits on its own once the shutdown reaches it
        drop(conn.reader.take());
        tracing::debug!(%connection, session = %conn.session, "tcp connection released");
    }

    fn send_request(
        &mut self,
        connection: ConnectionId,
        request: Outbound<'_>,
    ) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get_mut(&connection)
            .ok_or(TransportError::NotConnected(connection))?;
        encode_frame(
            &mut conn.write_buf,
            request.sn,
            request.header,
            request.payload,
        )?;
        let result = conn.write_buf.write_all_to(&mut conn.stream);
        if result.is_err() {
            conn.write_buf.clear();
        }
        result.map_err(TransportError::from)
    }

    fn release_response(&mut self, response: Response) {
        for mut buf in [response.header, response.payload] {
            if buf.capacity() == 0 {
                continue;
            }
            buf.clear();
            // full free list: let it drop
            let _ = self.free_tx.try_send(buf);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.local_close.store(true, Ordering::Release);
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

fn take_buffer(free: &Receiver<Vec<u8>>, data: &[u8]) -> Vec<u8> {
    let mut buf = free.try_recv().unwrap_or_default();
    buf.extend_from_slice(data);
    buf
}

fn read_loop(
    mut stream: TcpStream,
    connection: ConnectionId,
    sink: EventSink,
    free: Receiver<Vec<u8>>,
    local_close: Arc<AtomicBool>,
) {
    let mut buf = Buffer::new();

    let reason = 'read: loop {
        match buf.read_from(&mut stream) {
            Ok(0) => break 'read Reason::PeerClose,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => break 'read Reason::Io(e.to_string()),
        }

        loop {
            let (response, consumed) = match decode_frame(buf.as_slice()) {
                Ok(Some((frame, consumed))) => (
                    Response {
                        sn: frame.sn,
                        header: take_buffer(&free, frame.header),
                        payload: take_buffer(&free, frame.payload),
                    },
                    consumed,
                ),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%connection, error = %e, "malformed response frame");
                    break 'read Reason::Io(e.to_string());
                }
            };
            buf.consume(consumed);
            if !sink.deliver_response(response) {
                // loop context is gone; nobody is listening
                return;
            }
        }
    };

    let reason = if local_close.load(Ordering::Acquire) {
        Reason::LocalClose
    } else {
        reason
    };
    tracing::debug!(%connection, %reason, "tcp connection closed");
    sink.deliver_session(SessionEvent::connection_teardown(connection, reason.clone()));
    sink.deliver_session(SessionEvent::session_teardown(reason));
}
