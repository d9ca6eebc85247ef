use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::geocoder::Coordinate;

/// Persistent string storage holding the serialized cache mapping.
pub trait CacheStore: Send + Sync {
    fn load(&self) -> AppResult<Option<String>>;
    fn save(&self, payload: &str) -> AppResult<()>;
    fn describe(&self) -> String;
}

/// Result of writing the cache through to its store after a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Persisted,
    Failed(String),
}

impl FlushOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, FlushOutcome::Persisted)
    }
}

/// Builds the lookup key for a postal code, suffixed with `|locality` when one is known.
pub fn cache_key(postal_code: &str, locality: &str) -> String {
    if locality.is_empty() {
        postal_code.to_string()
    } else {
        format!("{postal_code}|{locality}")
    }
}

pub struct GeocodeCache {
    entries: Mutex<BTreeMap<String, Coordinate>>,
    store: Arc<dyn CacheStore>,
}

impl GeocodeCache {
    /// Reads the persisted mapping once. Unreadable or corrupt data yields an empty cache.
    pub fn load(store: Arc<dyn CacheStore>) -> Self {
        let entries = match store.load() {
            Ok(Some(payload)) => match serde_json::from_str::<BTreeMap<String, Coordinate>>(&payload)
            {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        target: "geocode_cache",
                        store = %store.describe(),
                        error = %err,
                        "persisted cache is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(
                    target: "geocode_cache",
                    store = %store.describe(),
                    error = %err,
                    "failed to read persisted cache; starting empty"
                );
                BTreeMap::new()
            }
        };

        info!(
            target: "geocode_cache",
            store = %store.describe(),
            entries = entries.len(),
            "geocode cache loaded"
        );
        Self {
            entries: Mutex::new(entries),
            store,
        }
    }

    pub fn get(&self, key: &str) -> Option<Coordinate> {
        self.entries.lock().get(key).copied()
    }

    /// Stores the coordinate and flushes the whole mapping. Flush failures are reported,
    /// never raised: the entry stays cached for the rest of the session either way.
    pub fn put(&self, key: impl Into<String>, coordinate: Coordinate) -> FlushOutcome {
        let key = key.into();
        let mut entries = self.entries.lock();
        if let Some(previous) = entries.insert(key.clone(), coordinate) {
            if previous != coordinate {
                debug!(
                    target: "geocode_cache",
                    key = %key,
                    ?previous,
                    ?coordinate,
                    "cache entry replaced with a different coordinate"
                );
            }
        }

        let payload = match serde_json::to_string(&*entries) {
            Ok(payload) => payload,
            Err(err) => return FlushOutcome::Failed(err.to_string()),
        };
        match self.store.save(&payload) {
            Ok(()) => FlushOutcome::Persisted,
            Err(err) => FlushOutcome::Failed(err.to_string()),
        }
    }

    /// `put` with the store write moved to the blocking pool, so file and SQLite I/O
    /// never stalls the lookups polled on the calling task.
    pub async fn put_offloaded(self: &Arc<Self>, key: String, coordinate: Coordinate) -> FlushOutcome {
        let cache = Arc::clone(self);
        match tokio::task::spawn_blocking(move || cache.put(key, coordinate)).await {
            Ok(outcome) => outcome,
            Err(err) => FlushOutcome::Failed(err.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self) -> AppResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn save(&self, payload: &str) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, payload)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Keeps the serialized mapping in process memory only.
#[derive(Clone, Default)]
pub struct MemoryStore {
    payload: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Arc::new(Mutex::new(Some(payload.into()))),
        }
    }

    pub fn snapshot(&self) -> Option<String> {
        self.payload.lock().clone()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> AppResult<Option<String>> {
        Ok(self.snapshot())
    }

    fn save(&self, payload: &str) -> AppResult<()> {
        *self.payload.lock() = Some(payload.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
