//! Key/value stores backing the cache tiers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// A flat string → JSON map. Values are stored as given; interpreting them
/// (envelopes, expiry) is the caller's business.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime store used for the session tier.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Default location of the durable store file.
///
/// `~/.cache/xbmc-rpc/durable-cache.json` on Linux,
/// `~/Library/Caches/xbmc-rpc/durable-cache.json` on macOS.
pub fn default_durable_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("xbmc-rpc").join("durable-cache.json"))
}

/// Durable store kept as one JSON object on disk.
///
/// The whole map is held in memory and written through on every mutation.
/// A missing file starts empty; an unreadable or corrupt one is logged and
/// also starts empty.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let entries = load_entries(&path);
        debug!("Opened durable cache {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, Value>) {
        let map: Map<String, Value> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let body = match serde_json::to_string(&Value::Object(map)) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode durable cache: {}", e);
                return;
            }
        };

        // Write to a sibling file first so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!("Failed to write durable cache {}: {}", self.path.display(), e);
        }
    }
}

fn load_entries(path: &Path) -> HashMap<String, Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Failed to read durable cache {}: {}", path.display(), e);
            return HashMap::new();
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => {
            warn!("Durable cache {} is corrupt, starting empty", path.display());
            HashMap::new()
        }
    }
}

impl CacheStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }

    fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.persist(&entries);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
