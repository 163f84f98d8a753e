//! Single-threaded event loop.
//!
//! A [`Context`] owns two queues: transport events (responses and session
//! notifications, fed through an [`EventSink`]) and injected actions (closures
//! scheduled from other threads through a [`ContextHandle`]). `run_loop`
//! dispatches them one at a time to a [`SessionHandler`] until a handler or an
//! injected action calls [`LoopCtx::stop_loop`].
//!
//! Injection is the only way another thread can touch loop-owned state.

use crate::transport::{EventSink, Response, SessionEvent, TransportEvent};

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use std::fmt;

/// Callbacks the loop invokes for transport events.
pub trait SessionHandler {
    fn on_session_event(&mut self, event: SessionEvent, ctx: &mut LoopCtx);

    fn on_response(&mut self, response: Response, ctx: &mut LoopCtx);
}

/// Per-dispatch view of the loop passed to handlers and injected actions.
#[derive(Debug, Default)]
pub struct LoopCtx {
    stop_requested: bool,
}

impl LoopCtx {
    /// Stop the loop after the current event has been handled.
    pub fn stop_loop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

type Injected<H> = Box<dyn FnOnce(&mut H, &mut LoopCtx) + Send>;

/// Error returned when injecting into a context that has been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event loop context is closed")]
pub struct ContextClosed;

/// Cross-thread handle used to schedule work on a loop.
pub struct ContextHandle<H> {
    inject_tx: Sender<Injected<H>>,
}

impl<H> Clone for ContextHandle<H> {
    fn clone(&self) -> Self {
        Self {
            inject_tx: self.inject_tx.clone(),
        }
    }
}

impl<H> fmt::Debug for ContextHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("pending", &self.inject_tx.len())
            .finish()
    }
}

impl<H> ContextHandle<H> {
    /// Schedule `action` to run on the loop's own thread.
    pub fn inject<F>(&self, action: F) -> Result<(), ContextClosed>
    where
        F: FnOnce(&mut H, &mut LoopCtx) + Send + 'static,
    {
        self.inject_tx
            .send(Box::new(action))
            .map_err(|_| ContextClosed)
    }
}

/// An event loop bound to one handler type.
pub struct Context<H> {
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    inject_tx: Sender<Injected<H>>,
    inject_rx: Receiver<Injected<H>>,
    dispatched: u64,
}

impl<H: SessionHandler> Context<H> {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (inject_tx, inject_rx) = crossbeam_channel::unbounded();
        Self {
            events_tx,
            events_rx,
            inject_tx,
            inject_rx,
            dispatched: 0,
        }
    }

    /// Sink a transport uses to report events to this loop.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.events_tx.clone())
    }

    pub fn handle(&self) -> ContextHandle<H> {
        ContextHandle {
            inject_tx: self.inject_tx.clone(),
        }
    }

    /// Total events and actions dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Block dispatching events until the loop is stopped.
    pub fn run_loop(&mut self, handler: &mut H) {
        let mut ctx = LoopCtx::default();
        while !ctx.stop_requested() {
            // Both senders are held by `self`, so neither queue can disconnect.
            select! {
                recv(self.events_rx) -> event => {
                    if let Ok(event) = event {
                        self.dispatch(handler, event, &mut ctx);
                    }
                }
                recv(self.inject_rx) -> action => {
                    if let Ok(action) = action {
                        self.dispatched += 1;
                        action(handler, &mut ctx);
                    }
                }
            }
        }
        tracing::debug!(dispatched = self.dispatched, "event loop stopped");
    }

    /// Dispatch everything already queued without blocking.
    ///
    /// Injected actions are drained before transport events on each pass.
    /// Returns `true` if the loop was stopped.
    pub fn poll(&mut self, handler: &mut H) -> bool {
        let mut ctx = LoopCtx::default();
        loop {
            if ctx.stop_requested() {
                return true;
            }
            match self.inject_rx.try_recv() {
                Ok(action) => {
                    self.dispatched += 1;
                    action(handler, &mut ctx);
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
            match self.events_rx.try_recv() {
                Ok(event) => self.dispatch(handler, event, &mut ctx),
                Err(_) => return false,
            }
        }
    }

    fn dispatch(&mut self, handler: &mut H, event: TransportEvent, ctx: &mut LoopCtx) {
        self.dispatched += 1;
        match event {
            TransportEvent::Response(response) => handler.on_response(response, ctx),
            TransportEvent::Session(event) => handler.on_session_event(event, ctx),
        }
    }
}

impl<H: SessionHandler> Default for Context<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Reason, SessionEventKind};

    #[derive(Default)]
    struct Recorder {
        events: Vec<SessionEventKind>,
        responses: Vec<u64>,
        stop_on_teardown: bool,
    }

    impl SessionHandler for Recorder {
        fn on_session_event(&mut self, event: SessionEvent, ctx: &mut LoopCtx) {
            self.events.push(event.kind);
            if self.stop_on_teardown && event.kind == SessionEventKind::SessionTeardown {
                ctx.stop_loop();
            }
        }

        fn on_response(&mut self, response: Response, _ctx: &mut LoopCtx) {
            self.responses.push(response.sn);
        }
    }

    fn response(sn: u64) -> Response {
        Response {
            sn,
            header: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_poll_dispatches_in_order() {
        let mut context = Context::<Recorder>::new();
        let mut handler = Recorder::default();
        let sink = context.sink();

        sink.deliver_response(response(3));
        sink.deliver_response(response(1));
        sink.deliver_session(SessionEvent::session_teardown(Reason::PeerClose));

        assert!(!context.poll(&mut handler));
        assert_eq!(handler.responses, vec![3, 1]);
        assert_eq!(handler.events, vec![SessionEventKind::SessionTeardown]);
        assert_eq!(context.dispatched(), 3);
    }

    #[test]
    fn test_stop_leaves_remaining_events_queued() {
        let mut context = Context::<Recorder>::new();
        let mut handler = Recorder {
            stop_on_teardown: true,
            ..Default::default()
        };
        let sink = context.sink();

        sink.deliver_session(SessionEvent::session_teardown(Reason::PeerClose));
        sink.deliver_response(response(7));

        assert!(context.poll(&mut handler));
        assert!(handler.responses.is_empty());
    }

    #[test]
    fn test_injected_action_runs_on_loop() {
        let mut context = Context::<Recorder>::new();
        let mut handler = Recorder::default();
        let handle = context.handle();

        let injector = std::thread::spawn(move || {
            handle
                .inject(|h: &mut Recorder, ctx: &mut LoopCtx| {
                    h.responses.push(42);
                    ctx.stop_loop();
                })
                .is_ok()
        });
        assert!(injector.join().unwrap());

        context.run_loop(&mut handler);
        assert_eq!(handler.responses, vec![42]);
    }

    #[test]
    fn test_inject_after_destroy_fails() {
        let context = Context::<Recorder>::new();
        let handle = context.handle();
        let sink = context.sink();
        drop(context);

        assert_eq!(handle.inject(|_, ctx| ctx.stop_loop()), Err(ContextClosed));
        assert!(!sink.deliver_response(response(0)));
    }
}
