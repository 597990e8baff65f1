//! Transports that carry JSON-RPC frames to an XBMC instance.
//!
//! Three implementations share one contract:
//!
//! ```text
//! ┌──────────────┐   connect / send / close    ┌──────────────────────┐
//! │   Session    │ ──────────────────────────► │ WsTransport          │ ws://host:9090/jsonrpc
//! │   (actor)    │                             │ HttpTransport        │ http://host:8080/jsonrpc
//! │              │ ◄────────────────────────── │ MemoryTransport      │ in-process
//! └──────────────┘   TransportEvent (mpsc)     └──────────────────────┘
//! ```
//!
//! A transport never calls back into the session. Everything it observes
//! (open, inbound frame, close, error) is pushed onto the event channel handed
//! to [`Transport::connect`], in the order it happened.

mod http;
pub mod memory;
mod ws;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub use http::HttpTransport;
pub use memory::{MemoryServer, MemoryTransport};
pub use ws::WsTransport;

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is usable.
    Open,
    /// One inbound text frame.
    Message(String),
    /// The connection went away (peer close or local close).
    Closed,
    /// A connection attempt or exchange failed.
    Error(String),
}

/// Sender half of the event channel a transport reports on.
pub type EventSender = UnboundedSender<TransportEvent>;

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// `send` was called while the connection is not open.
    #[error("Transport is not connected")]
    NotConnected,

    /// The endpoint address could not be built.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Contract between the session and a concrete transport.
pub trait Transport: Send + 'static {
    /// Start a connection attempt. Outcome and all later traffic arrive on
    /// `events`. Calling this while an attempt or an open connection already
    /// exists does nothing.
    fn connect(&mut self, events: EventSender);

    /// Queue one frame for delivery.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Drop the connection without reporting `Closed` for it.
    fn close(&mut self);

    /// Whether `send` would currently be accepted.
    fn is_open(&self) -> bool;

    /// Whether the server can push notifications over this transport.
    fn supports_push(&self) -> bool {
        true
    }
}

/// Lifecycle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    Idle,
    Connecting,
    Open,
}

/// Connection bookkeeping shared between a transport and its I/O tasks.
///
/// Every connection attempt gets a new generation. Tasks belonging to an
/// older generation can neither change the state nor emit events, so a late
/// close from a dead socket never reaches the session.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    inner: Arc<Mutex<LinkInner>>,
}

#[derive(Debug)]
struct LinkInner {
    generation: u64,
    state: LinkState,
    events: Option<EventSender>,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkInner {
                generation: 0,
                state: LinkState::Idle,
                events: None,
            })),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Begin a new connection attempt, superseding any previous one.
    /// Returns `None` when an attempt or connection is already live.
    pub(crate) fn begin(&self, events: EventSender) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Idle {
            return None;
        }
        inner.generation = inner.generation.wrapping_add(1);
        inner.state = LinkState::Connecting;
        inner.events = Some(events);
        Some(inner.generation)
    }

    /// Move a live generation to `state` and report `event`.
    /// Returns false when `generation` has been superseded.
    pub(crate) fn report(&self, generation: u64, state: LinkState, event: TransportEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = state;
        if let Some(events) = &inner.events {
            let _ = events.send(event);
        }
        true
    }

    /// Report an event without changing state.
    pub(crate) fn emit(&self, generation: u64, event: TransportEvent) -> bool {
        let inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        if let Some(events) = &inner.events {
            let _ = events.send(event);
        }
        true
    }

    /// Supersede the current generation silently and go idle.
    pub(crate) fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.generation = inner.generation.wrapping_add(1);
        inner.state = LinkState::Idle;
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.inner.lock().generation
    }
}
