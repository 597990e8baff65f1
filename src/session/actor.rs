//! The task that owns a session's transport and request table.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::pending::{PendingRequest, PendingTable, Target};
use super::{Command, ConnectionState, RpcError, SessionConfig, SessionEvent};
use crate::notifications::NotificationRegistry;
use crate::protocol::{
    parse_incoming, Incoming, JsonRpcError, JsonRpcRequest, GET_PROPERTIES_METHOD, PING_METHOD,
    PING_REPLY, VOLUME_CHANGED,
};
use crate::transport::{EventSender, Transport, TransportEvent};

pub(crate) struct Actor<T: Transport> {
    transport: T,
    config: SessionConfig,
    registry: Arc<NotificationRegistry>,
    owner: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: EventSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,

    pending: PendingTable,
    auto_retry: bool,
    initialized: bool,
    probe_misses: u32,
    last_volume: Option<Value>,
    connect_waiters: Vec<oneshot::Sender<Result<(), RpcError>>>,
    close_waiters: Vec<oneshot::Sender<()>>,

    sweep: Option<Interval>,
    probe: Option<Interval>,
    poll: Option<Interval>,
    reconnect_at: Option<Instant>,
}

impl<T: Transport> Actor<T> {
    pub(crate) fn new(
        transport: T,
        config: SessionConfig,
        registry: Arc<NotificationRegistry>,
        owner: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<ConnectionState>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let auto_retry = config.auto_retry;
        Self {
            transport,
            config,
            registry,
            owner,
            state_tx,
            state: ConnectionState::Disconnected,
            commands,
            events_tx,
            events,
            pending: PendingTable::new(),
            auto_retry,
            initialized: false,
            probe_misses: 0,
            last_volume: None,
            connect_waiters: Vec::new(),
            close_waiters: Vec::new(),
            sweep: None,
            probe: None,
            poll: None,
            reconnect_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_transport_event(event),
                _ = tick(&mut self.sweep) => self.sweep_timeouts(),
                _ = tick(&mut self.probe) => self.send_probe(),
                _ = tick(&mut self.poll) => self.poll_volume(),
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if self.state == ConnectionState::Disconnected && self.auto_retry {
                        info!("Reconnecting");
                        self.begin_connect();
                    }
                }
            }
        }

        debug!("All session handles dropped, shutting down");
        self.transport.close();
        self.stop_timers();
        for request in self.pending.drain() {
            request.target.fail(RpcError::SessionClosed);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done } => match self.state {
                ConnectionState::Connected => {
                    let _ = done.send(Ok(()));
                }
                ConnectionState::Connecting => self.connect_waiters.push(done),
                ConnectionState::Draining => {
                    let _ = done.send(Err(RpcError::NotConnected));
                }
                ConnectionState::Disconnected => {
                    self.connect_waiters.push(done);
                    self.begin_connect();
                }
            },
            Command::Call {
                method,
                params,
                reply,
            } => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(RpcError::NotConnected));
                    return;
                }
                self.submit(method, params, Target::Caller(reply), 1);
            }
            Command::SetAutoRetry(enabled) => {
                self.auto_retry = enabled;
                if !enabled {
                    self.reconnect_at = None;
                }
            }
            Command::Close { done } => self.begin_close(done),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if self.state == ConnectionState::Connecting {
                    self.on_open();
                } else {
                    debug!("Ignoring open while {}", self.state);
                }
            }
            TransportEvent::Message(frame) => match self.state {
                ConnectionState::Connected | ConnectionState::Draining => self.on_message(&frame),
                _ => debug!("Ignoring frame while {}", self.state),
            },
            TransportEvent::Closed => self.on_link_down("connection closed".to_string()),
            TransportEvent::Error(reason) => self.on_link_down(reason),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.owner.send(event);
    }

    fn begin_connect(&mut self) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        self.transport.connect(self.events_tx.clone());
    }

    fn on_open(&mut self) {
        info!("Session connected");
        self.set_state(ConnectionState::Connected);
        self.probe_misses = 0;
        self.last_volume = None;

        self.sweep = Some(periodic(self.config.sweep_interval));
        self.probe = Some(periodic(self.config.probe_interval));
        self.poll = if self.transport.supports_push() {
            None
        } else {
            Some(periodic(self.config.poll_interval))
        };

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if !self.initialized {
            self.initialized = true;
            self.emit(SessionEvent::Initialized);
        }
        self.emit(SessionEvent::Online);
    }

    fn on_link_down(&mut self, reason: String) {
        match self.state {
            ConnectionState::Connecting => {
                warn!("Connection attempt failed: {}", reason);
                self.set_state(ConnectionState::Disconnected);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(RpcError::ConnectFailed(reason.clone())));
                }
                self.schedule_reconnect();
            }
            ConnectionState::Connected | ConnectionState::Draining => self.lose_connection(&reason),
            ConnectionState::Disconnected => debug!("Ignoring link event while disconnected"),
        }
    }

    /// Connected (or draining) to disconnected. Every live request fails and
    /// the owner hears `Offline` exactly once for this transition.
    fn lose_connection(&mut self, reason: &str) {
        warn!("Connection lost: {}", reason);
        self.transport.close();
        self.stop_timers();
        self.probe_misses = 0;
        self.set_state(ConnectionState::Disconnected);

        let failed = self.pending.drain();
        if !failed.is_empty() {
            info!("Failing {} in-flight request(s)", failed.len());
        }
        for request in failed {
            request.target.fail(RpcError::NotConnected);
        }

        self.emit(SessionEvent::Offline);
        self.finish_close();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.auto_retry {
            debug!("Reconnect in {:?}", self.config.reconnect_delay);
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }

    fn stop_timers(&mut self) {
        self.sweep = None;
        self.probe = None;
        self.poll = None;
    }

    fn begin_close(&mut self, done: oneshot::Sender<()>) {
        self.auto_retry = false;
        self.reconnect_at = None;

        match self.state {
            ConnectionState::Disconnected => {
                let _ = done.send(());
            }
            ConnectionState::Connecting => {
                self.transport.close();
                self.set_state(ConnectionState::Disconnected);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(RpcError::ConnectFailed(
                        "closed before the connection opened".to_string(),
                    )));
                }
                let _ = done.send(());
            }
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Draining);
                self.probe = None;
                self.poll = None;
                // Only caller requests hold the close open.
                let dropped = self.pending.discard_internal();
                if dropped > 0 {
                    debug!("Dropped {} probe/poll request(s) on close", dropped);
                }
                info!("Draining {} in-flight request(s)", self.pending.len());
                self.close_waiters.push(done);
                self.drain_if_idle();
            }
            ConnectionState::Draining => self.close_waiters.push(done),
        }
    }

    fn drain_if_idle(&mut self) {
        if self.state == ConnectionState::Draining && self.pending.is_empty() {
            info!("Session closed");
            self.transport.close();
            self.stop_timers();
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionEvent::Offline);
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn submit(&mut self, method: String, params: Value, target: Target, attempt: u32) {
        let id = self.pending.allocate_id();
        let frame = match JsonRpcRequest::new(method.as_str(), params.clone(), id).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                target.fail(RpcError::Encode(e.to_string()));
                return;
            }
        };

        debug!(id, method = %method, attempt, "Sending request");
        if let Err(e) = self.transport.send(frame) {
            warn!("Send of {} failed: {}", method, e);
            target.fail(RpcError::NotConnected);
            return;
        }

        self.pending.insert(PendingRequest {
            id,
            method,
            params,
            target,
            submitted_at: Instant::now(),
            attempt,
        });
    }

    fn on_message(&mut self, frame: &str) {
        match parse_incoming(frame) {
            Ok(Incoming::Reply { id, outcome }) => match self.pending.remove(id) {
                Some(request) => self.resolve(request, outcome),
                None => debug!("Dropping reply for unknown request {}", id),
            },
            Ok(Incoming::Notification { method, data }) => {
                debug!("Notification {}", method);
                self.registry.dispatch(&method, &data);
            }
            Err(e) => warn!("Dropping malformed message: {}", e),
        }
        self.drain_if_idle();
    }

    fn resolve(&mut self, request: PendingRequest, outcome: Result<Value, JsonRpcError>) {
        match request.target {
            Target::Caller(reply) => {
                let _ = reply.send(outcome.map_err(RpcError::from));
            }
            Target::Probe => {
                self.probe_misses = 0;
                if outcome.as_ref().ok().and_then(Value::as_str) != Some(PING_REPLY) {
                    debug!("Unexpected ping reply: {:?}", outcome);
                }
            }
            Target::VolumePoll => match outcome {
                Ok(volume) => {
                    if self.last_volume.as_ref() != Some(&volume) {
                        self.last_volume = Some(volume.clone());
                        self.registry.dispatch(VOLUME_CHANGED, &volume);
                    }
                }
                Err(e) => debug!("Volume poll failed: {}", e.message),
            },
        }
    }

    fn sweep_timeouts(&mut self) {
        let expired = self
            .pending
            .take_expired(Instant::now(), self.config.call_timeout);

        for request in expired {
            match request.target {
                Target::Caller(reply) if request.attempt <= self.config.call_retries => {
                    info!(
                        "Request {} ({}) timed out, retrying (attempt {})",
                        request.id,
                        request.method,
                        request.attempt + 1
                    );
                    self.submit(
                        request.method,
                        request.params,
                        Target::Caller(reply),
                        request.attempt + 1,
                    );
                }
                Target::Caller(reply) => {
                    warn!(
                        "Request {} ({}) timed out after {} attempts",
                        request.id, request.method, request.attempt
                    );
                    let _ = reply.send(Err(RpcError::RetriesExhausted {
                        method: request.method,
                        attempts: request.attempt,
                    }));
                }
                Target::Probe => {
                    self.probe_misses += 1;
                    warn!(
                        "Liveness probe unanswered ({}/{})",
                        self.probe_misses, self.config.probe_miss_limit
                    );
                }
                Target::VolumePoll => debug!("Volume poll timed out"),
            }
        }

        if self.probe_misses >= self.config.probe_miss_limit
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Draining
            )
        {
            self.lose_connection("liveness probe unanswered");
            return;
        }
        self.drain_if_idle();
    }

    fn send_probe(&mut self) {
        if self.state == ConnectionState::Connected {
            self.submit(PING_METHOD.to_string(), json!({}), Target::Probe, 1);
        }
    }

    fn poll_volume(&mut self) {
        if self.state != ConnectionState::Connected
            || !self.registry.has_subscribers(VOLUME_CHANGED)
            || self.pending.has_volume_poll()
        {
            return;
        }
        self.submit(
            GET_PROPERTIES_METHOD.to_string(),
            json!({"properties": ["volume", "muted"]}),
            Target::VolumePoll,
            1,
        );
    }
}

/// An interval whose first tick is one full period from now.
fn periodic(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Tick `interval`, or never resolve when there is none.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
