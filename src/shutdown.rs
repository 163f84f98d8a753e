//! Shutdown coordination between the initiating thread and the loop.
//!
//! The initiator never touches loop-owned state. It flips the worker state
//! and, if the loop is already running, injects [`teardown`] onto it.

use crate::client::Client;
use crate::context::LoopCtx;
use crate::transport::Transport;

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a worker thread as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Thread started, loop not entered yet.
    Spawned = 0,
    /// Loop entered.
    Running = 1,
    /// Stop requested. Whether the loop was entered is decided by the
    /// state this was reached from.
    StopRequested = 2,
    /// Thread done and completion signalled.
    Exited = 3,
}

impl WorkerState {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Spawned,
            1 => WorkerState::Running,
            2 => WorkerState::StopRequested,
            _ => WorkerState::Exited,
        }
    }
}

/// What a stop request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop had not been entered and now never will be.
    PreventedEntry,
    /// The loop is running; the caller must inject a teardown.
    InjectTeardown,
    /// Someone already asked.
    AlreadyRequested,
    /// The worker has finished.
    AlreadyExited,
}

/// Atomic [`WorkerState`] shared by the worker thread and its owner.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Spawned as u8),
        }
    }

    #[inline]
    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Called by the worker right before it runs the loop. Fails if a stop
    /// got in first.
    pub fn try_enter_loop(&self) -> bool {
        self.transition(WorkerState::Spawned, WorkerState::Running)
    }

    /// Record a stop request and report how the caller should proceed.
    pub fn request_stop(&self) -> StopOutcome {
        loop {
            match self.load() {
                WorkerState::Spawned => {
                    if self.transition(WorkerState::Spawned, WorkerState::StopRequested) {
                        return StopOutcome::PreventedEntry;
                    }
                }
                WorkerState::Running => {
                    if self.transition(WorkerState::Running, WorkerState::StopRequested) {
                        return StopOutcome::InjectTeardown;
                    }
                }
                WorkerState::StopRequested => return StopOutcome::AlreadyRequested,
                WorkerState::Exited => return StopOutcome::AlreadyExited,
            }
        }
    }

    pub fn mark_exited(&self) {
        self.state
            .store(WorkerState::Exited as u8, Ordering::Release);
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`teardown`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Nothing left; the loop was stopped.
    NoSession,
    /// Connection close started; notifications will finish the job.
    ClosingConnection,
    /// Session released and the loop stopped.
    SessionReleased,
}

/// Runs on the loop thread in response to a stop request.
pub fn teardown<T: Transport>(client: &mut Client<T>, ctx: &mut LoopCtx) -> TeardownStep {
    if !client.has_session() {
        tracing::debug!("teardown: no session");
        ctx.stop_loop();
        return TeardownStep::NoSession;
    }
    if client.destroy_connection() {
        tracing::debug!("teardown: closing connection");
        return TeardownStep::ClosingConnection;
    }
    client.destroy_session();
    ctx.stop_loop();
    TeardownStep::SessionReleased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::context::Context;
    use crate::pool::SlotTemplate;
    use crate::session::SessionState;
    use crate::transport::mem::{MemPeer, MemTransport, RespondMode, TeardownMode};
    use crate::transport::{Reason, SessionEvent, SessionParams};

    use std::time::Duration;

    type TestClient = Client<MemTransport>;

    fn open(teardown: TeardownMode) -> (TestClient, Context<TestClient>, MemPeer) {
        let (transport, peer) = MemTransport::new(RespondMode::Manual, teardown);
        let context = Context::new();
        let config = ClientConfig {
            params: SessionParams {
                uri: "tcp://127.0.0.1:7000".to_string(),
                peer: "127.0.0.1:7000".parse().unwrap(),
                connect_timeout: Duration::from_secs(1),
            },
            depth: 4,
            template: SlotTemplate::default(),
            sample_every: 0,
        };
        let mut client = Client::open(transport, &config, context.sink()).unwrap();
        client.prime().unwrap();
        (client, context, peer)
    }

    fn inject_teardown(context: &Context<TestClient>) {
        context
            .handle()
            .inject(|client: &mut TestClient, ctx: &mut LoopCtx| {
                teardown(client, ctx);
            })
            .unwrap();
    }

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), WorkerState::Spawned);
        assert!(cell.try_enter_loop());
        assert!(!cell.try_enter_loop());
        assert_eq!(cell.request_stop(), StopOutcome::InjectTeardown);
        assert_eq!(cell.request_stop(), StopOutcome::AlreadyRequested);
        cell.mark_exited();
        assert_eq!(cell.request_stop(), StopOutcome::AlreadyExited);
    }

    #[test]
    fn test_stop_before_entry_prevents_loop() {
        let cell = StateCell::new();
        assert_eq!(cell.request_stop(), StopOutcome::PreventedEntry);
        assert!(!cell.try_enter_loop());
        assert_eq!(cell.load(), WorkerState::StopRequested);
    }

    #[test]
    fn test_teardown_waits_for_session_notification() {
        let (mut client, mut context, peer) = open(TeardownMode::Deferred);

        inject_teardown(&context);
        assert!(!context.poll(&mut client));
        assert_eq!(client.state(), SessionState::ConnectionTornDown);
        assert_eq!(peer.connections_destroyed(), 1);
        assert_eq!(peer.sessions_destroyed(), 0);

        peer.complete_teardown();
        assert!(context.poll(&mut client));
        assert_eq!(client.state(), SessionState::SessionTornDown);
        assert_eq!(peer.sessions_destroyed(), 1);
        assert_eq!(peer.connections_destroyed(), 1);
    }

    #[test]
    fn test_teardown_without_connection_releases_session() {
        let (mut client, mut context, peer) = open(TeardownMode::Deferred);
        let connection = client.connection().unwrap();
        peer.notify(SessionEvent::connection_teardown(connection, Reason::PeerClose));
        assert!(!context.poll(&mut client));
        assert_eq!(client.state(), SessionState::ConnectionTornDown);

        let mut ctx = LoopCtx::default();
        assert_eq!(teardown(&mut client, &mut ctx), TeardownStep::SessionReleased);
        assert!(ctx.stop_requested());
        assert_eq!(peer.sessions_destroyed(), 1);
    }

    #[test]
    fn test_teardown_without_session_stops() {
        let (mut client, _context, peer) = open(TeardownMode::Immediate);
        client.close_now();
        let mut ctx = LoopCtx::default();
        assert_eq!(teardown(&mut client, &mut ctx), TeardownStep::NoSession);
        assert!(ctx.stop_requested());
        assert_eq!(peer.sessions_destroyed(), 1);
    }

    #[test]
    fn test_repeated_teardown_is_harmless() {
        let (mut client, mut context, peer) = open(TeardownMode::Immediate);
        inject_teardown(&context);
        inject_teardown(&context);
        // the second injection releases the session before the
        // notifications for the first are dispatched
        assert!(context.poll(&mut client));
        assert_eq!(client.state(), SessionState::SessionTornDown);

        // the late notifications find nothing left to release
        assert!(!context.poll(&mut client));
        assert_eq!(peer.connections_destroyed(), 1);
        assert_eq!(peer.sessions_destroyed(), 1);
    }
}
