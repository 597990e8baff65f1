//! xbmc-rpc - command line client for XBMC/Kodi JSON-RPC.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xbmc_rpc::cache::{
    clear_keeping_settings, load_settings, CacheStore, CacheTier, CallOptions, FileStore,
    SETTINGS_KEY,
};
use xbmc_rpc::config::ClientConfig;
use xbmc_rpc::controller::{Controller, Protocol, XbmcEvent};
use xbmc_rpc::session::SessionEvent;

/// Talk to an XBMC/Kodi instance over JSON-RPC.
#[derive(Parser, Debug)]
#[command(name = "xbmc-rpc", version, about)]
struct Cli {
    /// Host name or address (overrides config and XBMC_HOST).
    #[arg(long, global = true)]
    host: Option<String>,

    /// WebSocket port.
    #[arg(long, global = true)]
    ws_port: Option<u16>,

    /// HTTP port.
    #[arg(long, global = true)]
    http_port: Option<u16>,

    /// auto, ws or http.
    #[arg(long, global = true)]
    protocol: Option<Protocol>,

    /// Durable cache file.
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method and print the result.
    Call {
        /// e.g. Player.GetActivePlayers
        method: String,
        /// JSON params object.
        #[arg(default_value = "{}")]
        params: String,
        /// none, session or durable. Defaults per namespace.
        #[arg(long)]
        tier: Option<CacheTier>,
        /// Bypass the cached value and store the fresh one.
        #[arg(long)]
        refresh: bool,
    },
    /// Measure round-trip latency.
    Ping {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Print notifications and connection changes until interrupted.
    Listen,
    /// List the methods the server exposes.
    Methods {
        /// Only methods in this namespace.
        namespace: Option<String>,
    },
    /// Drop all durable cached results (settings are kept). Works offline.
    ClearCache,
    /// Show or replace the stored settings object. Works offline.
    Settings {
        /// JSON object to store.
        #[arg(long)]
        set: Option<String>,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load().context("Failed to load configuration")?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.ws_port {
            config.ws_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(path) = &self.cache_path {
            config.durable_cache_path = Some(path.clone());
        }
        // One-shot commands should fail fast rather than reconnect.
        config.auto_retry = matches!(self.command, Command::Listen);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xbmc_rpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;

    // These only touch the durable store on disk.
    let command = match cli.command {
        Command::ClearCache => return clear_cache(&config),
        Command::Settings { set } => return settings(&config, set),
        command => command,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let controller = Controller::connect(&config, events_tx)
        .await
        .with_context(|| format!("Failed to connect to {}", config.host))?;
    info!("Connected to {} over {}", config.host, controller.protocol());

    let result = run(command, &controller, events_rx).await;
    controller.close().await;
    result
}

async fn run(
    command: Command,
    controller: &Controller,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<()> {
    match command {
        Command::Call {
            method,
            params,
            tier,
            refresh,
        } => {
            let params: Value =
                serde_json::from_str(&params).context("Params must be valid JSON")?;
            let options = CallOptions {
                tier,
                force_refresh: refresh,
                ..CallOptions::default()
            };
            let result = controller.call(&method, params, options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Ping { count } => {
            for _ in 0..count {
                let latency = controller.session().ping().await?;
                println!("pong in {:.1} ms", latency.as_secs_f64() * 1000.0);
            }
        }
        Command::Listen => {
            let (tx, mut rx) = mpsc::unbounded_channel::<XbmcEvent>();
            let (volume_tx, mut volume_rx) = mpsc::unbounded_channel();
            let _player = controller.on_player_event(tx.clone());
            let _playlist = controller.on_playlist_event(tx.clone());
            let _system = controller.on_system_event(tx);
            let _volume = controller.on_volume_changed(volume_tx);

            println!("Listening, Ctrl-C to stop");
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => println!("{:<8} {}", event.event, event.data),
                    Some(volume) = volume_rx.recv() => println!("{:<8} {}", "volume", volume),
                    Some(event) = session_events.recv() => println!("-- {:?}", event),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Methods { namespace } => {
            let catalogue = controller.catalogue();
            if catalogue.is_empty() {
                bail!("Server did not return a method catalogue");
            }
            for (name, info) in catalogue.iter() {
                if let Some(ns) = &namespace {
                    if !name.starts_with(&format!("{}.", ns)) {
                        continue;
                    }
                }
                println!("{}({})", name, info.params.join(", "));
            }
        }
        // Handled in main without a connection.
        Command::ClearCache | Command::Settings { .. } => {}
    }
    Ok(())
}

fn open_durable_store(config: &ClientConfig) -> Result<FileStore> {
    let path = config
        .durable_cache_path()
        .context("No cache directory on this platform, pass --cache-path")?;
    FileStore::open(&path)
}

fn clear_cache(config: &ClientConfig) -> Result<()> {
    let store = open_durable_store(config)?;
    clear_keeping_settings(&store);
    println!("Cache cleared ({})", store.path().display());
    Ok(())
}

fn settings(config: &ClientConfig, set: Option<String>) -> Result<()> {
    let store = open_durable_store(config)?;
    if let Some(raw) = set {
        let settings: Value = serde_json::from_str(&raw).context("Settings must be valid JSON")?;
        if !settings.is_object() {
            bail!("Settings must be a JSON object");
        }
        store.set(SETTINGS_KEY, settings);
    }
    println!("{}", serde_json::to_string_pretty(&load_settings(&store))?);
    Ok(())
}
