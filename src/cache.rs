//! TTL response cache in front of an [`Rpc`] client.
//!
//! Each call picks a tier:
//!
//! - `none`: always call through, never store
//! - `session`: in-memory, entries live for `session_minutes`
//! - `durable`: a [`CacheStore`] that survives restarts, entries live for
//!   `durable_days`
//!
//! Entries are stored as `{"expires": <unix millis>, "data": <result>}` under
//! `"<method>.<hash of params>"`. An entry is served only while
//! `expires > now`; an expired or unreadable entry counts as a miss, and so
//! does a stored `null` result.
//!
//! Concurrent misses on the same key are not coalesced. Both calls go to the
//! server and both write the entry; whichever finishes last wins.

pub mod store;

use std::str::FromStr;
use std::time::Duration;

use chrono::{Days, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::session::{Rpc, RpcError};

pub use store::{default_durable_path, CacheStore, FileStore, MemoryStore};

/// Reserved durable key holding the user's settings object.
pub const SETTINGS_KEY: &str = "settings";

/// Which store a call reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    None,
    Session,
    Durable,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::None => "none",
            CacheTier::Session => "session",
            CacheTier::Durable => "durable",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTier {
    type Err = String;

    /// Accepts `none`, `session`/`sess` and `durable`/`perm`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CacheTier::None),
            "session" | "sess" => Ok(CacheTier::Session),
            "durable" | "perm" => Ok(CacheTier::Durable),
            other => Err(format!("unknown cache tier '{}'", other)),
        }
    }
}

/// Per-call cache behaviour. `Default` uses the client's default tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Tier override; `None` means the configured default.
    pub tier: Option<CacheTier>,
    /// Lifetime override for the entry this call writes.
    pub duration: Option<Duration>,
    /// Skip the lookup but still write the fresh result.
    pub force_refresh: bool,
}

impl CallOptions {
    pub fn tier(tier: CacheTier) -> Self {
        Self {
            tier: Some(tier),
            ..Self::default()
        }
    }

    pub fn uncached() -> Self {
        Self::tier(CacheTier::None)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Client-wide cache defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_tier: CacheTier,
    pub durable_days: u32,
    pub session_minutes: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_tier: CacheTier::Session,
            durable_days: 1,
            session_minutes: 1,
        }
    }
}

/// Stored form of one cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    /// Expiry as unix milliseconds.
    pub expires: i64,
    pub data: Value,
}

impl CacheEnvelope {
    /// Valid strictly before `expires`.
    pub fn is_fresh_at(&self, now_millis: i64) -> bool {
        self.expires > now_millis
    }

    fn to_value(&self) -> Value {
        json!({"expires": self.expires, "data": self.data})
    }
}

/// Cache key for a call: `"<method>.<hash>"`.
///
/// The hash is a 32-bit rolling hash (`h = h * 31 + unit`, wrapping) over the
/// UTF-16 code units of the params serialized with sorted object keys.
/// `null` params hash like `{}`.
pub fn cache_key(method: &str, params: &Value) -> String {
    let canonical = match params {
        Value::Null => "{}".to_string(),
        other => canonicalize(other).to_string(),
    };
    format!("{}.{}", method, rolling_hash(&canonical))
}

fn rolling_hash(text: &str) -> i32 {
    text.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// An [`Rpc`] client with a session store and a durable store in front.
pub struct CachedClient<C> {
    inner: C,
    config: CacheConfig,
    session: Box<dyn CacheStore>,
    durable: Box<dyn CacheStore>,
}

impl<C: Rpc> CachedClient<C> {
    /// Both tiers start in memory; see [`CachedClient::with_durable_store`].
    pub fn new(inner: C, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            session: Box::new(MemoryStore::new()),
            durable: Box::new(MemoryStore::new()),
        }
    }

    pub fn with_durable_store(mut self, store: impl CacheStore + 'static) -> Self {
        self.durable = Box::new(store);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Call `method`, serving a fresh cached result when the tier allows.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let tier = options.tier.unwrap_or(self.config.default_tier);
        let Some(store) = self.store(tier) else {
            return self.inner.call(method, params).await;
        };

        let key = cache_key(method, &params);
        if !options.force_refresh {
            if let Some(data) = lookup(store, &key) {
                debug!("Cache hit for {} ({})", key, tier);
                return Ok(data);
            }
        }

        let data = self.inner.call(method, params).await?;
        let envelope = CacheEnvelope {
            expires: self.expiry(tier, options.duration),
            data,
        };
        store.set(&key, envelope.to_value());
        debug!("Cached {} ({})", key, tier);
        Ok(envelope.data)
    }

    /// Drop every cached result in both tiers. Settings survive.
    pub fn clear_cache(&self) {
        self.session.clear();
        clear_keeping_settings(self.durable.as_ref());
    }

    /// The stored settings object, or `{}` when absent or unreadable.
    pub fn settings(&self) -> Value {
        load_settings(self.durable.as_ref())
    }

    pub fn save_settings(&self, settings: &Value) {
        self.durable.set(SETTINGS_KEY, settings.clone());
    }

    fn store(&self, tier: CacheTier) -> Option<&dyn CacheStore> {
        match tier {
            CacheTier::None => None,
            CacheTier::Session => Some(self.session.as_ref()),
            CacheTier::Durable => Some(self.durable.as_ref()),
        }
    }

    fn expiry(&self, tier: CacheTier, duration: Option<Duration>) -> i64 {
        let now = Utc::now();
        let expires = match (duration, tier) {
            (Some(duration), _) => TimeDelta::from_std(duration)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta)),
            (None, CacheTier::Durable) => {
                now.checked_add_days(Days::new(u64::from(self.config.durable_days)))
            }
            (None, _) => TimeDelta::try_minutes(i64::from(self.config.session_minutes))
                .and_then(|delta| now.checked_add_signed(delta)),
        };
        expires.map_or(i64::MAX, |at| at.timestamp_millis())
    }
}

/// Empty `store` except for the settings entry.
///
/// Works on a durable store directly, without a connected client.
pub fn clear_keeping_settings(store: &dyn CacheStore) {
    let settings = store.get(SETTINGS_KEY);
    store.clear();
    if let Some(settings) = settings {
        store.set(SETTINGS_KEY, settings);
    }
}

/// Settings object held by `store`, `{}` when absent or not an object.
pub fn load_settings(store: &dyn CacheStore) -> Value {
    match store.get(SETTINGS_KEY) {
        Some(settings @ Value::Object(_)) => settings,
        Some(other) => {
            warn!("Ignoring stored settings that are not an object: {}", other);
            json!({})
        }
        None => json!({}),
    }
}

/// Fresh, non-null cached data for `key`, dropping the entry if it is stale or corrupt.
fn lookup(store: &dyn CacheStore, key: &str) -> Option<Value> {
    let raw = store.get(key)?;
    let envelope: CacheEnvelope = match serde_json::from_value(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping corrupt cache entry {}: {}", key, e);
            store.remove(key);
            return None;
        }
    };

    if envelope.data.is_null() {
        debug!("Cache entry {} holds null, refetching", key);
        None
    } else if envelope.is_fresh_at(Utc::now().timestamp_millis()) {
        Some(envelope.data)
    } else {
        debug!("Cache entry {} expired", key);
        store.remove(key);
        None
    }
}
