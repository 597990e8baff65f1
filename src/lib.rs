//! XBMC/Kodi JSON-RPC client.
//!
//! Layers, bottom up:
//!
//! - `protocol` - JSON-RPC 2.0 wire types and inbound frame parsing
//! - `transport` - WebSocket, HTTP fallback and in-memory transports
//! - `notifications` - notification name → ordered handler registry
//! - `session` - id correlation, timeout retry, liveness probe, reconnect
//! - `cache` - TTL response cache with session and durable tiers
//! - `controller` - protocol selection, method catalogue, helpers
//! - `config` - file and environment configuration
//!
//! # Example
//!
//! ```ignore
//! use xbmc_rpc::cache::CallOptions;
//! use xbmc_rpc::config::ClientConfig;
//! use xbmc_rpc::controller::Controller;
//!
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let controller = Controller::connect(&ClientConfig::load()?, events_tx).await?;
//! let players = controller
//!     .call("Player.GetActivePlayers", serde_json::json!({}), CallOptions::default())
//!     .await?;
//! ```

pub mod cache;
pub mod config;
pub mod controller;
pub mod notifications;
pub mod protocol;
pub mod session;
pub mod transport;
