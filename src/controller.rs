//! High-level XBMC client.
//!
//! [`Controller`] picks a transport, connects a [`Session`], loads the
//! method catalogue from `JSONRPC.introspect` and routes every call through
//! the cache. It also carries a handful of convenience helpers and groups
//! related notifications into tagged event streams.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheTier, CachedClient, CallOptions, FileStore};
use crate::config::ClientConfig;
use crate::notifications::{handler, Handler};
use crate::protocol::{INTROSPECT_METHOD, VOLUME_CHANGED};
use crate::session::{RpcError, Session, SessionEvent};
use crate::transport::{HttpTransport, Transport, TransportError, WsTransport};

/// Player notifications and the event tag each maps to.
pub const PLAYER_EVENTS: &[(&str, &str)] = &[
    ("Player.OnPlay", "play"),
    ("Player.OnPause", "pause"),
    ("Player.OnStop", "stop"),
    ("Player.OnPropertyChanged", "property"),
    ("Player.OnSeek", "seek"),
    ("Player.OnSpeedChanged", "speed"),
];

pub const PLAYLIST_EVENTS: &[(&str, &str)] = &[
    ("Playlist.OnAdd", "add"),
    ("Playlist.OnRemove", "remove"),
    ("Playlist.OnClear", "clear"),
];

pub const SYSTEM_EVENTS: &[(&str, &str)] = &[
    ("System.OnLowBattery", "battery"),
    ("System.OnQuit", "quit"),
    ("System.OnRestart", "restart"),
    ("System.OnSleep", "sleep"),
    ("System.OnWake", "wake"),
];

/// Which transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// WebSocket first, HTTP if the socket cannot be opened.
    Auto,
    #[serde(alias = "ws")]
    WebSocket,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Auto => "auto",
            Protocol::WebSocket => "websocket",
            Protocol::Http => "http",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Protocol::Auto),
            "ws" | "websocket" => Ok(Protocol::WebSocket),
            "http" => Ok(Protocol::Http),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The method is not in the server's catalogue.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The server answered, but not in the expected shape.
    #[error("Unexpected result from {method}: {detail}")]
    UnexpectedResult { method: String, detail: String },
}

/// One entry of the method catalogue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodInfo {
    pub description: Option<String>,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
}

/// `namespace.command` → [`MethodInfo`], loaded from `JSONRPC.introspect`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodCatalogue {
    methods: BTreeMap<String, MethodInfo>,
}

impl MethodCatalogue {
    /// Build from an introspect result. Names that are not exactly
    /// `namespace.command` are skipped.
    pub fn from_introspect(result: &Value) -> Self {
        let Some(methods) = result.get("methods").and_then(Value::as_object) else {
            warn!("Introspect result has no method table");
            return Self::default();
        };

        let methods = methods
            .iter()
            .filter(|(name, _)| name.split('.').count() == 2)
            .map(|(name, desc)| {
                let description = desc
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let params = desc
                    .get("params")
                    .and_then(Value::as_array)
                    .map(|params| {
                        params
                            .iter()
                            .filter_map(|p| p.get("name").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (
                    name.clone(),
                    MethodInfo {
                        description,
                        params,
                    },
                )
            })
            .collect();

        Self { methods }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn get(&self, method: &str) -> Option<&MethodInfo> {
        self.methods.get(method)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MethodInfo)> {
        self.methods.iter().map(|(name, info)| (name.as_str(), info))
    }

    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.methods
            .keys()
            .filter_map(|name| name.split('.').next())
            .collect()
    }

    /// Library browsing is cached for the session; everything else goes live.
    pub fn default_tier(method: &str) -> CacheTier {
        match method.split('.').next() {
            Some("AudioLibrary") | Some("VideoLibrary") => CacheTier::Session,
            _ => CacheTier::None,
        }
    }
}

/// A grouped notification: `event` is the short tag, `data` the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct XbmcEvent {
    pub event: &'static str,
    pub data: Value,
}

/// Handlers bound by one `on_*` call; pass to [`Controller::unsubscribe`].
#[derive(Default)]
pub struct Subscription {
    bindings: Vec<(String, Handler)>,
}

impl Subscription {
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.bindings.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("Subscription").field("names", &names).finish()
    }
}

/// Reported application version.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XbmcVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub revision: Value,
    #[serde(default)]
    pub tag: String,
}

impl std::fmt::Display for XbmcVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if !self.tag.is_empty() {
            write!(f, " ({})", self.tag)?;
        }
        Ok(())
    }
}

/// An on-screen notification for `GUI.ShowNotification`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuiNotification {
    pub title: String,
    pub message: String,
    pub image: String,
    pub display_time_ms: u32,
}

impl GuiNotification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            image: "info".to_string(),
            display_time_ms: 5000,
        }
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn display_time_ms(mut self, ms: u32) -> Self {
        self.display_time_ms = ms;
        self
    }
}

/// Connected client: session, cache and catalogue.
pub struct Controller {
    client: CachedClient<Session>,
    catalogue: MethodCatalogue,
    protocol: Protocol,
}

impl Controller {
    /// Connect as configured, open the durable cache and load the catalogue.
    ///
    /// Session lifecycle events go to `owner`.
    pub async fn connect(
        config: &ClientConfig,
        owner: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, ControllerError> {
        let (session, protocol) = open_session(config, owner).await?;

        let mut client = CachedClient::new(session, config.cache.clone());
        if let Some(path) = config.durable_cache_path() {
            match FileStore::open(&path) {
                Ok(store) => client = client.with_durable_store(store),
                Err(e) => warn!("Durable cache unavailable, using memory: {:#}", e),
            }
        }

        Ok(Self::from_client(client, protocol).await)
    }

    /// Wrap an already connected client and load the catalogue.
    ///
    /// A failed introspect leaves the catalogue empty, which turns off
    /// method-name validation.
    pub async fn from_client(client: CachedClient<Session>, protocol: Protocol) -> Self {
        let catalogue = match client.inner().call(INTROSPECT_METHOD, json!({})).await {
            Ok(result) => MethodCatalogue::from_introspect(&result),
            Err(e) => {
                warn!("Failed to retrieve methods: {}", e);
                MethodCatalogue::default()
            }
        };
        info!(
            "Loaded {} methods in {} namespaces",
            catalogue.len(),
            catalogue.namespaces().len()
        );

        Self {
            client,
            catalogue,
            protocol,
        }
    }

    pub fn session(&self) -> &Session {
        self.client.inner()
    }

    pub fn catalogue(&self) -> &MethodCatalogue {
        &self.catalogue
    }

    /// The transport actually in use (never `Auto`).
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Call `method`. Without an explicit tier, the namespace default applies.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, ControllerError> {
        if !self.catalogue.is_empty() && !self.catalogue.contains(method) {
            return Err(ControllerError::UnknownMethod(method.to_string()));
        }

        let params = if params.is_null() { json!({}) } else { params };
        let options = CallOptions {
            tier: options
                .tier
                .or_else(|| Some(MethodCatalogue::default_tier(method))),
            ..options
        };
        debug!("{} via {} cache tier {:?}", method, self.protocol, options.tier);
        Ok(self.client.call(method, params, options).await?)
    }

    pub async fn name(&self) -> Result<String, ControllerError> {
        let result = self.application_property("name").await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected("Application.GetProperties", "name is not a string"))
    }

    pub async fn version(&self) -> Result<XbmcVersion, ControllerError> {
        let result = self.application_property("version").await?;
        serde_json::from_value(result)
            .map_err(|e| unexpected("Application.GetProperties", &e.to_string()))
    }

    async fn application_property(&self, property: &str) -> Result<Value, ControllerError> {
        let result = self
            .call(
                "Application.GetProperties",
                json!({"properties": [property]}),
                CallOptions::tier(CacheTier::Session),
            )
            .await?;
        result
            .get(property)
            .cloned()
            .ok_or_else(|| unexpected("Application.GetProperties", &format!("missing {}", property)))
    }

    /// Show a notification on the XBMC screen.
    pub async fn send_notification(
        &self,
        notification: &GuiNotification,
    ) -> Result<(), ControllerError> {
        self.call(
            "GUI.ShowNotification",
            json!({
                "title": notification.title,
                "message": notification.message,
                "image": notification.image,
                "displaytime": notification.display_time_ms,
            }),
            CallOptions::uncached(),
        )
        .await?;
        Ok(())
    }

    /// Fetch info labels, e.g. `System.Time` or `Weather.Temperature`.
    pub async fn labels(&self, labels: &[&str]) -> Result<Value, ControllerError> {
        self.call(
            "XBMC.GetInfoLabels",
            json!({"labels": labels}),
            CallOptions::default(),
        )
        .await
    }

    pub fn on_player_event(&self, events: mpsc::UnboundedSender<XbmcEvent>) -> Subscription {
        self.subscribe_group(PLAYER_EVENTS, events)
    }

    pub fn on_playlist_event(&self, events: mpsc::UnboundedSender<XbmcEvent>) -> Subscription {
        self.subscribe_group(PLAYLIST_EVENTS, events)
    }

    pub fn on_system_event(&self, events: mpsc::UnboundedSender<XbmcEvent>) -> Subscription {
        self.subscribe_group(SYSTEM_EVENTS, events)
    }

    /// Volume changes as `{"volume": .., "muted": ..}`. Over HTTP these
    /// come from polling.
    pub fn on_volume_changed(&self, events: mpsc::UnboundedSender<Value>) -> Subscription {
        let h = handler(move |data| {
            let _ = events.send(data.clone());
        });
        self.session().subscribe(VOLUME_CHANGED, h.clone());
        Subscription {
            bindings: vec![(VOLUME_CHANGED.to_string(), h)],
        }
    }

    fn subscribe_group(
        &self,
        table: &'static [(&'static str, &'static str)],
        events: mpsc::UnboundedSender<XbmcEvent>,
    ) -> Subscription {
        let mut subscription = Subscription::default();
        for &(name, tag) in table {
            let events = events.clone();
            let h = handler(move |data| {
                let _ = events.send(XbmcEvent {
                    event: tag,
                    data: data.clone(),
                });
            });
            self.session().subscribe(name, h.clone());
            subscription.bindings.push((name.to_string(), h));
        }
        subscription
    }

    /// Remove every binding of `subscription`. Returns how many were removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> usize {
        subscription
            .bindings
            .iter()
            .filter(|(name, h)| self.session().unsubscribe(name, h))
            .count()
    }

    pub fn clear_cache(&self) {
        self.client.clear_cache();
    }

    pub fn settings(&self) -> Value {
        self.client.settings()
    }

    pub fn save_settings(&self, settings: &Value) {
        self.client.save_settings(settings);
    }

    /// Drain in-flight calls and disconnect.
    pub async fn close(&self) {
        self.session().close().await;
    }
}

fn unexpected(method: &str, detail: &str) -> ControllerError {
    ControllerError::UnexpectedResult {
        method: method.to_string(),
        detail: detail.to_string(),
    }
}

/// Open a session with the configured protocol, falling back from the
/// socket to HTTP under `Auto`.
async fn open_session(
    config: &ClientConfig,
    owner: mpsc::UnboundedSender<SessionEvent>,
) -> Result<(Session, Protocol), ControllerError> {
    match config.protocol {
        Protocol::WebSocket => {
            let session = connect_websocket(config, owner).await?;
            Ok((session, Protocol::WebSocket))
        }
        Protocol::Http => {
            let session = connect_http(config, owner).await?;
            Ok((session, Protocol::Http))
        }
        Protocol::Auto => match connect_websocket(config, owner.clone()).await {
            Ok(session) => Ok((session, Protocol::WebSocket)),
            Err(e) => {
                warn!("WebSocket unavailable ({}), trying HTTP", e);
                let session = connect_http(config, owner).await?;
                Ok((session, Protocol::Http))
            }
        },
    }
}

async fn connect_websocket(
    config: &ClientConfig,
    owner: mpsc::UnboundedSender<SessionEvent>,
) -> Result<Session, ControllerError> {
    let transport = WsTransport::new(config.ws_url()?);
    info!("Attempting to use WebSocket at {}", transport.url());
    start_session(transport, config, owner).await
}

async fn connect_http(
    config: &ClientConfig,
    owner: mpsc::UnboundedSender<SessionEvent>,
) -> Result<Session, ControllerError> {
    let transport = HttpTransport::new(config.http_url()?)?;
    info!("Attempting to use HTTP at {}", transport.url());
    start_session(transport, config, owner).await
}

/// Start a session and wait for its first connection. On failure the
/// session handle is dropped, which stops its task.
async fn start_session<T: Transport>(
    transport: T,
    config: &ClientConfig,
    owner: mpsc::UnboundedSender<SessionEvent>,
) -> Result<Session, ControllerError> {
    let session = Session::start(transport, config.session_config(), owner);
    session.connect().await?;
    Ok(session)
}
