//! HTTP fallback transport.
//!
//! There is no persistent connection: every frame is POSTed on its own and
//! the response body is reported as that frame's reply. The transport is
//! "open" as long as the last exchange succeeded.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::{EventSender, Link, LinkState, Transport, TransportError, TransportEvent};
use crate::protocol::{JsonRpcRequest, PING_METHOD};

/// Upper bound on a single HTTP exchange so a hung request cannot pin the
/// transport in `Connecting`.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Request-per-frame transport for `http://<host>:<port>/jsonrpc`.
pub struct HttpTransport {
    url: Url,
    http: reqwest::Client,
    link: Link,
}

impl HttpTransport {
    pub fn new(url: Url) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        Ok(Self {
            url,
            http,
            link: Link::new(),
        })
    }

    /// Build the transport for the standard XBMC HTTP endpoint.
    pub fn for_host(host: &str, port: u16) -> Result<Self, TransportError> {
        let url = Url::parse(&format!("http://{}:{}/jsonrpc", host, port))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        Self::new(url)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn connect(&mut self, events: EventSender) {
        let Some(generation) = self.link.begin(events) else {
            debug!("HTTP connect ignored, probe already in flight");
            return;
        };

        // id 0 is never handed out by a session, and this reply is consumed here.
        let probe = JsonRpcRequest::new(PING_METHOD, json!({}), 0);
        let body = match probe.to_frame() {
            Ok(body) => body,
            Err(e) => {
                self.link
                    .report(generation, LinkState::Idle, TransportEvent::Error(e.to_string()));
                return;
            }
        };

        let http = self.http.clone();
        let url = self.url.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            match exchange(&http, &url, body).await {
                Ok(_) => {
                    info!("HTTP endpoint {} reachable", url);
                    link.report(generation, LinkState::Open, TransportEvent::Open);
                }
                Err(e) => {
                    warn!("HTTP endpoint {} unreachable: {}", url, e);
                    link.report(generation, LinkState::Idle, TransportEvent::Error(e));
                }
            }
        });
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.link.state() != LinkState::Open {
            return Err(TransportError::NotConnected);
        }

        let generation = self.link.current_generation();
        let http = self.http.clone();
        let url = self.url.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            match exchange(&http, &url, frame).await {
                Ok(reply) => {
                    link.emit(generation, TransportEvent::Message(reply));
                }
                Err(e) => {
                    warn!("HTTP exchange with {} failed: {}", url, e);
                    link.report(generation, LinkState::Idle, TransportEvent::Error(e));
                }
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        self.link.retire();
    }

    fn is_open(&self) -> bool {
        self.link.state() == LinkState::Open
    }

    fn supports_push(&self) -> bool {
        false
    }
}

/// POST one frame and return the response body.
async fn exchange(http: &reqwest::Client, url: &Url, body: String) -> Result<String, String> {
    let response = http
        .post(url.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP status {}", status));
    }

    response.text().await.map_err(|e| e.to_string())
}
