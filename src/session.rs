//! Session state machine.
//!
//! Tracks which transport handles the client still holds and decides what a
//! notification means. The machine itself never calls the transport: it
//! hands back a [`Transition`] naming the handles the caller must release,
//! which keeps every release in one place and makes duplicate notifications
//! harmless (a handle can only be taken once).

use crate::transport::{ConnectionId, SessionEvent, SessionEventKind, SessionId};

use std::fmt;

/// Lifecycle of the client's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    /// Session handle issued, no connection yet.
    Establishing,
    /// Session and connection present; requests may be sent.
    Active,
    /// Connection released, session still held.
    ConnectionTornDown,
    /// Terminal.
    SessionTornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Establishing => "establishing",
            SessionState::Active => "active",
            SessionState::ConnectionTornDown => "connection torn down",
            SessionState::SessionTornDown => "session torn down",
        };
        f.write_str(s)
    }
}

/// What the caller must do in response to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed.
    None,
    /// Release this connection handle.
    ReleaseConnection(ConnectionId),
    /// Release the session (and a connection still held with it), then stop
    /// the loop.
    ReleaseSession {
        session: SessionId,
        connection: Option<ConnectionId>,
    },
}

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    session: Option<SessionId>,
    connection: Option<ConnectionId>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unstarted,
            session: None,
            connection: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// True while requests may reference the session.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// A session handle was issued.
    pub fn begin(&mut self, session: SessionId) {
        debug_assert_eq!(self.state, SessionState::Unstarted);
        self.session = Some(session);
        self.state = SessionState::Establishing;
    }

    /// Connect returned a handle; sending is permitted from here on.
    pub fn connected(&mut self, connection: ConnectionId) {
        debug_assert_eq!(self.state, SessionState::Establishing);
        self.connection = Some(connection);
        self.state = SessionState::Active;
    }

    /// Take the connection for a local destroy.
    pub fn take_connection(&mut self) -> Option<ConnectionId> {
        let connection = self.connection.take()?;
        if self.state == SessionState::Active {
            self.state = SessionState::ConnectionTornDown;
        }
        Some(connection)
    }

    /// Take the session (and any remaining connection) for a local destroy.
    pub fn take_session(&mut self) -> Option<(SessionId, Option<ConnectionId>)> {
        let session = self.session.take()?;
        self.state = SessionState::SessionTornDown;
        Some((session, self.connection.take()))
    }

    /// Apply a notification.
    pub fn on_event(&mut self, event: &SessionEvent) -> Transition {
        match event.kind {
            SessionEventKind::ConnectionTeardown => {
                let matches = match (self.connection, event.connection) {
                    (Some(held), Some(torn)) => held == torn,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if !matches {
                    tracing::debug!(
                        state = %self.state,
                        connection = ?event.connection,
                        "connection teardown for a connection no longer held"
                    );
                    return Transition::None;
                }
                match self.take_connection() {
                    Some(connection) => Transition::ReleaseConnection(connection),
                    None => Transition::None,
                }
            }
            SessionEventKind::SessionTeardown => match self.take_session() {
                Some((session, connection)) => Transition::ReleaseSession {
                    session,
                    connection,
                },
                None => {
                    tracing::debug!(state = %self.state, "duplicate session teardown");
                    Transition::None
                }
            },
            other => {
                tracing::debug!(kind = %other, state = %self.state, "session event ignored");
                Transition::None
            }
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Reason;

    fn active() -> SessionMachine {
        let mut m = SessionMachine::new();
        m.begin(SessionId(1));
        m.connected(ConnectionId(10));
        m
    }

    #[test]
    fn test_establish() {
        let mut m = SessionMachine::new();
        assert_eq!(m.state(), SessionState::Unstarted);
        m.begin(SessionId(1));
        assert_eq!(m.state(), SessionState::Establishing);
        assert!(!m.is_active());
        m.connected(ConnectionId(10));
        assert!(m.is_active());
    }

    #[test]
    fn test_connection_then_session_teardown() {
        let mut m = active();

        let t = m.on_event(&SessionEvent::connection_teardown(
            ConnectionId(10),
            Reason::PeerClose,
        ));
        assert_eq!(t, Transition::ReleaseConnection(ConnectionId(10)));
        assert_eq!(m.state(), SessionState::ConnectionTornDown);
        assert_eq!(m.session(), Some(SessionId(1)));
        assert_eq!(m.connection(), None);

        let t = m.on_event(&SessionEvent::session_teardown(Reason::PeerClose));
        assert_eq!(
            t,
            Transition::ReleaseSession {
                session: SessionId(1),
                connection: None
            }
        );
        assert_eq!(m.state(), SessionState::SessionTornDown);
    }

    #[test]
    fn test_session_teardown_from_active_releases_connection() {
        let mut m = active();
        let t = m.on_event(&SessionEvent::session_teardown(Reason::PeerClose));
        assert_eq!(
            t,
            Transition::ReleaseSession {
                session: SessionId(1),
                connection: Some(ConnectionId(10))
            }
        );
    }

    #[test]
    fn test_duplicate_notifications_are_noops() {
        let mut m = active();
        let conn_down = SessionEvent::connection_teardown(ConnectionId(10), Reason::PeerClose);
        let ses_down = SessionEvent::session_teardown(Reason::PeerClose);

        assert_ne!(m.on_event(&conn_down), Transition::None);
        assert_eq!(m.on_event(&conn_down), Transition::None);
        assert_ne!(m.on_event(&ses_down), Transition::None);
        assert_eq!(m.on_event(&ses_down), Transition::None);
        assert_eq!(m.on_event(&conn_down), Transition::None);
        assert_eq!(m.state(), SessionState::SessionTornDown);
    }

    #[test]
    fn test_teardown_for_other_connection_ignored() {
        let mut m = active();
        let t = m.on_event(&SessionEvent::connection_teardown(
            ConnectionId(99),
            Reason::PeerClose,
        ));
        assert_eq!(t, Transition::None);
        assert!(m.is_active());
    }

    #[test]
    fn test_local_destroy_then_notification() {
        let mut m = active();
        assert_eq!(m.take_connection(), Some(ConnectionId(10)));
        assert_eq!(m.state(), SessionState::ConnectionTornDown);

        // the transport still reports the teardown it was asked for
        let t = m.on_event(&SessionEvent::connection_teardown(
            ConnectionId(10),
            Reason::LocalClose,
        ));
        assert_eq!(t, Transition::None);
    }

    #[test]
    fn test_unhandled_kinds_do_not_change_state() {
        let mut m = active();
        for kind in [
            SessionEventKind::ConnectionEstablished,
            SessionEventKind::ConnectionClosed,
            SessionEventKind::ConnectionDisconnected,
            SessionEventKind::ConnectionError,
            SessionEventKind::SessionReject,
        ] {
            let event = SessionEvent::new(kind, Reason::Success, Some(ConnectionId(10)));
            assert_eq!(m.on_event(&event), Transition::None);
        }
        assert!(m.is_active());
    }
}
