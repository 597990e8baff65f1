//! JSON-RPC session over a [`Transport`].
//!
//! A session owns id allocation and reply correlation, retries requests that
//! time out, probes the link with `JSONRPC.Ping`, reconnects after a drop,
//! and hands server notifications to a [`NotificationRegistry`].
//!
//! All of that state lives in one background task. [`Session`] is a cheap,
//! cloneable handle that talks to it over a channel, so callers never share
//! a lock with the reader.
//!
//! # Example
//!
//! ```ignore
//! use xbmc_rpc::session::{Session, SessionConfig};
//! use xbmc_rpc::transport::WsTransport;
//!
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let transport = WsTransport::for_host("localhost", 9090)?;
//! let session = Session::start(transport, SessionConfig::default(), events_tx);
//! session.connect().await?;
//! let players = session.call("Player.GetActivePlayers", serde_json::json!({})).await?;
//! ```

mod actor;
mod pending;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::notifications::{Handler, NotificationRegistry};
use crate::protocol::{JsonRpcError, PING_METHOD};
use crate::transport::Transport;

use actor::Actor;

/// Default time a request may wait for its reply before it is retried.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of times an unanswered request is resent before giving up.
pub const DEFAULT_CALL_RETRIES: u32 = 3;

/// Default period of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Default period of the liveness probe.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of unanswered probes that count as a dead link.
pub const DEFAULT_PROBE_MISS_LIMIT: u32 = 2;

/// Default wait between losing a connection and trying again.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default period of the volume poll on transports without push.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors a caller of [`Session`] can see.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    /// There is no open connection, or it dropped before the reply came.
    #[error("Not connected")]
    NotConnected,

    /// The first send and every retry timed out. `attempts` counts all sends.
    #[error("Too many retries: {method} got no reply after {attempts} attempts")]
    RetriesExhausted {
        /// Method that was called
        method: String,
        /// Number of times it was sent
        attempts: u32,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("Server error {code}: {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<Value>,
    },

    /// A connection attempt failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// The session task is gone.
    #[error("Session has shut down")]
    SessionClosed,
}

impl From<JsonRpcError> for RpcError {
    fn from(err: JsonRpcError) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `close()` was requested; in-flight requests are finishing.
    Draining,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events delivered to the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The first connection opened. Sent once per session, before `Online`.
    Initialized,
    /// A connection opened.
    Online,
    /// An open connection was lost.
    Offline,
}

/// Timing and retry knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a request may wait for its reply.
    pub call_timeout: Duration,
    /// Resends after the first send times out.
    pub call_retries: u32,
    pub sweep_interval: Duration,
    pub probe_interval: Duration,
    pub probe_miss_limit: u32,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    /// Reconnect automatically after a drop.
    pub auto_retry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            call_retries: DEFAULT_CALL_RETRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_miss_limit: DEFAULT_PROBE_MISS_LIMIT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            auto_retry: true,
        }
    }
}

/// Requests from handles to the session task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        done: oneshot::Sender<Result<(), RpcError>>,
    },
    Call {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, RpcError>>,
    },
    SetAutoRetry(bool),
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Anything that can make JSON-RPC calls and route notifications.
///
/// [`Session`] is the real implementation; the cache layer is generic over
/// this so it can be tested against a scripted double.
pub trait Rpc: Send + Sync {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;

    fn subscribe(&self, name: &str, handler: Handler);

    fn unsubscribe(&self, name: &str, handler: &Handler) -> bool;
}

/// Handle to a running session. Clones share the same connection.
///
/// The session task ends when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<NotificationRegistry>,
    state: watch::Receiver<ConnectionState>,
}

impl Session {
    /// Spawn the session task for `transport`. Nothing connects until
    /// [`Session::connect`] is called.
    ///
    /// Lifecycle events go to `owner`; dropping its receiver is fine.
    /// Must be called from within a tokio runtime.
    pub fn start<T: Transport>(
        transport: T,
        config: SessionConfig,
        owner: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let registry = Arc::new(NotificationRegistry::new());

        let actor = Actor::new(
            transport,
            config,
            Arc::clone(&registry),
            owner,
            state_tx,
            commands_rx,
        );
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            registry,
            state: state_rx,
        }
    }

    /// Open the connection. Resolves once the attempt succeeds or fails;
    /// returns immediately when already connected.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Connect { done })?;
        rx.await.map_err(|_| RpcError::SessionClosed)?
    }

    /// Call `method` and wait for its result.
    ///
    /// Fails fast with [`RpcError::NotConnected`] when there is no open
    /// connection. A request without a reply is resent under a new id until
    /// the retries run out.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            method: method.to_string(),
            params,
            reply,
        })?;
        rx.await.map_err(|_| RpcError::SessionClosed)?
    }

    /// Round-trip a `JSONRPC.Ping` and return the latency.
    pub async fn ping(&self) -> Result<Duration, RpcError> {
        let start = Instant::now();
        self.call(PING_METHOD, json!({})).await?;
        Ok(start.elapsed())
    }

    pub fn subscribe(&self, name: &str, handler: Handler) {
        self.registry.subscribe(name, handler);
    }

    pub fn unsubscribe(&self, name: &str, handler: &Handler) -> bool {
        self.registry.unsubscribe(name, handler)
    }

    pub fn registry(&self) -> &Arc<NotificationRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), RpcError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| RpcError::SessionClosed)
    }

    /// Turn automatic reconnection on or off.
    pub fn set_auto_retry(&self, enabled: bool) {
        let _ = self.send(Command::SetAutoRetry(enabled));
    }

    /// Stop reconnecting, let in-flight requests finish or time out, then
    /// close the transport.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), RpcError> {
        self.commands
            .send(command)
            .map_err(|_| RpcError::SessionClosed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Rpc for Session {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send {
        Session::call(self, method, params)
    }

    fn subscribe(&self, name: &str, handler: Handler) {
        Session::subscribe(self, name, handler);
    }

    fn unsubscribe(&self, name: &str, handler: &Handler) -> bool {
        Session::unsubscribe(self, name, handler)
    }
}

#[cfg(test)]
mod tests;
