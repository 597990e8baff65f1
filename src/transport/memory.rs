//! In-process transport pair.
//!
//! [`MemoryTransport`] plugs into a session like any other transport, while
//! the matching [`MemoryServer`] plays the remote side: it sees every frame
//! the session sends and decides when connections open, drop, or fail.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{EventSender, Transport, TransportError, TransportEvent};

#[derive(Debug)]
struct Shared {
    events: Option<EventSender>,
    connecting: bool,
    open: bool,
    auto_accept: bool,
    push: bool,
    connect_attempts: usize,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Client half, handed to a session.
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    frames: mpsc::UnboundedSender<String>,
}

/// Server half, driven by the test or embedder.
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    frames: mpsc::UnboundedReceiver<String>,
}

/// Create a connected transport/server pair. Connection attempts are
/// accepted immediately until [`MemoryServer::set_auto_accept`] says otherwise.
pub fn pair() -> (MemoryTransport, MemoryServer) {
    let shared = Arc::new(Mutex::new(Shared {
        events: None,
        connecting: false,
        open: false,
        auto_accept: true,
        push: true,
        connect_attempts: 0,
    }));
    let (tx, rx) = mpsc::unbounded_channel();

    (
        MemoryTransport {
            shared: Arc::clone(&shared),
            frames: tx,
        },
        MemoryServer { shared, frames: rx },
    )
}

impl Transport for MemoryTransport {
    fn connect(&mut self, events: EventSender) {
        let mut shared = self.shared.lock();
        if shared.open || shared.connecting {
            return;
        }
        shared.connect_attempts += 1;
        shared.events = Some(events);
        if shared.auto_accept {
            shared.open = true;
            shared.emit(TransportEvent::Open);
        } else {
            shared.connecting = true;
        }
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.shared.lock().open {
            return Err(TransportError::NotConnected);
        }
        self.frames
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock();
        shared.open = false;
        shared.connecting = false;
        shared.events = None;
    }

    fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    fn supports_push(&self) -> bool {
        self.shared.lock().push
    }
}

impl MemoryServer {
    /// Whether future connection attempts open without an explicit `accept`.
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.shared.lock().auto_accept = auto_accept;
    }

    /// Make the client side behave like a transport without server push.
    pub fn set_push(&self, push: bool) {
        self.shared.lock().push = push;
    }

    /// Complete a pending connection attempt.
    pub fn accept(&self) {
        let mut shared = self.shared.lock();
        if shared.connecting {
            shared.connecting = false;
            shared.open = true;
            shared.emit(TransportEvent::Open);
        }
    }

    /// Fail a pending connection attempt.
    pub fn refuse(&self, reason: &str) {
        let mut shared = self.shared.lock();
        if shared.connecting {
            shared.connecting = false;
            shared.emit(TransportEvent::Error(reason.to_string()));
        }
    }

    /// Drop an open connection as if the peer went away.
    pub fn drop_connection(&self) {
        let mut shared = self.shared.lock();
        if shared.open {
            shared.open = false;
            shared.emit(TransportEvent::Closed);
        }
    }

    /// Deliver a JSON frame to the client.
    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    /// Deliver raw text to the client, valid JSON or not.
    pub fn push_raw(&self, frame: &str) {
        let shared = self.shared.lock();
        if shared.open {
            shared.emit(TransportEvent::Message(frame.to_string()));
        }
    }

    /// Wait for the next frame the client sent.
    pub async fn recv(&mut self) -> Option<Value> {
        let frame = self.frames.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Next frame the client sent, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        let frame = self.frames.try_recv().ok()?;
        serde_json::from_str(&frame).ok()
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.lock().connect_attempts
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }
}
