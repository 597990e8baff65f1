//! Persistent WebSocket transport over `tokio-tungstenite`.
//!
//! One background task owns the socket for each connection attempt. Frames
//! to send reach it over an unbounded channel; inbound text frames are
//! reported as [`TransportEvent::Message`].

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{EventSender, Link, LinkState, Transport, TransportError, TransportEvent};

/// Socket transport for `ws://<host>:<port>/jsonrpc`.
pub struct WsTransport {
    url: Url,
    link: Link,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            link: Link::new(),
            outgoing: None,
        }
    }

    /// Build the transport for the standard XBMC socket endpoint.
    pub fn for_host(host: &str, port: u16) -> Result<Self, TransportError> {
        let url = Url::parse(&format!("ws://{}:{}/jsonrpc", host, port))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        Ok(Self::new(url))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, events: EventSender) {
        let Some(generation) = self.link.begin(events) else {
            debug!("WebSocket connect ignored, attempt already live");
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);

        info!("Connecting to {}", self.url);
        tokio::spawn(run_socket(
            self.url.as_str().to_string(),
            self.link.clone(),
            generation,
            rx,
        ));
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.link.state() != LinkState::Open {
            return Err(TransportError::NotConnected);
        }
        self.outgoing
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&mut self) {
        self.link.retire();
        // Dropping the sender makes the socket task send a close frame and exit.
        self.outgoing = None;
    }

    fn is_open(&self) -> bool {
        self.link.state() == LinkState::Open
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Own one socket connection from handshake to close.
async fn run_socket(
    url: String,
    link: Link,
    generation: u64,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("WebSocket connection to {} failed: {}", url, e);
            link.report(generation, LinkState::Idle, TransportEvent::Error(e.to_string()));
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    if !link.report(generation, LinkState::Open, TransportEvent::Open) {
        // Closed locally while the handshake was in flight.
        let _ = sink.close().await;
        return;
    }
    info!("WebSocket connected to {}", url);

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    debug!("WebSocket closed locally");
                    let _ = sink.close().await;
                    return;
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!("WebSocket send failed: {}", e);
                    link.report(generation, LinkState::Idle, TransportEvent::Error(e.to_string()));
                    return;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        link.emit(generation, TransportEvent::Message(text.to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            link.emit(generation, TransportEvent::Message(text));
                        }
                        Err(e) => warn!("Dropping non UTF-8 binary frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket close frame received: {:?}", frame);
                        break;
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read failed: {}", e);
                        link.report(generation, LinkState::Idle, TransportEvent::Error(e.to_string()));
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket to {} closed by peer", url);
    link.report(generation, LinkState::Idle, TransportEvent::Closed);
}
