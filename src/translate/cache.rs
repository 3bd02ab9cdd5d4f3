//! Persistent translation cache with TTL.
//! Key: `"<source text>:<target lang>"`. The whole store is one JSON blob
//! under a single storage key, loaded lazily on first use.
//!
//! Storage I/O is best-effort: a corrupt blob resets to empty, a full quota
//! prunes the oldest half and retries once, and anything else leaves the
//! cache working from memory for the rest of the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::storage::{KeyValueStorage, StorageError};
use crate::clock::Clock;

/// Storage key holding the serialized store.
pub const CACHE_STORAGE_KEY: &str = "jdm-translation-cache";
/// Default entry lifetime: 24 hours.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Share of entries removed by a manual `prune` without an explicit percentage.
pub const DEFAULT_PRUNE_PERCENT: u32 = 25;
/// Share of entries removed when a write hits the storage quota.
pub const QUOTA_PRUNE_PERCENT: u32 = 50;
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: String,
    /// Insertion time, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub storage_key: String,
    pub expiry_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_key: CACHE_STORAGE_KEY.to_string(),
            expiry_ms: DEFAULT_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Composite cache key for a translation.
pub fn translation_key(text: &str, target_lang: &str) -> String {
    format!("{text}:{target_lang}")
}

pub struct PersistentCache {
    /// `None` until the store has been loaded from storage.
    store: Mutex<Option<HashMap<String, CacheEntry>>>,
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PersistentCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            store: Mutex::new(None),
            storage,
            clock,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Load the store from storage. Idempotent; never fails.
    pub fn init(&self) {
        let mut guard = self.store.lock();
        self.loaded(&mut guard);
    }

    /// Cached value for `key`, or `None` if absent or expired.
    /// An expired entry is removed and the removal persisted.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.store.lock();
        let now = self.clock.now_ms();
        let expiry_ms = self.config.expiry_ms;
        let store = self.loaded(&mut guard);

        match store.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if now - entry.timestamp <= expiry_ms => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        store.remove(key);
        debug!(key, "cache entry expired");
        if let Err(e) = self.persist(store) {
            warn!(error = %e, "cache persist after expiry failed");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite `key`, stamped with the current time, and persist.
    pub fn set(&self, key: &str, value: &str) {
        let mut guard = self.store.lock();
        let now = self.clock.now_ms();
        let store = self.loaded(&mut guard);
        store.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                timestamp: now,
            },
        );

        match self.persist(store) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded) => {
                let removed = prune_oldest(store, QUOTA_PRUNE_PERCENT);
                warn!(removed, "storage quota exceeded, pruned cache");
                if let Err(e) = self.persist(store) {
                    warn!(error = %e, "cache write dropped after prune, keeping memory copy");
                }
            }
            Err(e) => {
                warn!(error = %e, "cache persist failed, keeping memory copy");
            }
        }
    }

    /// Remove every expired entry. Persists only when something was removed.
    pub fn clean_expired(&self) -> usize {
        let mut guard = self.store.lock();
        let now = self.clock.now_ms();
        let expiry_ms = self.config.expiry_ms;
        let store = self.loaded(&mut guard);

        let before = store.len();
        store.retain(|_, entry| now - entry.timestamp <= expiry_ms);
        let removed = before - store.len();

        if removed > 0 {
            info!(removed, "cache cleanup");
            if let Err(e) = self.persist(store) {
                warn!(error = %e, "cache persist after cleanup failed");
            }
        }
        removed
    }

    /// Remove the oldest `percent` of entries by timestamp.
    pub fn prune(&self, percent: u32) -> usize {
        let mut guard = self.store.lock();
        let store = self.loaded(&mut guard);
        let removed = prune_oldest(store, percent);
        if removed > 0 {
            info!(removed, percent, "cache pruned");
            if let Err(e) = self.persist(store) {
                warn!(error = %e, "cache persist after prune failed");
            }
        }
        removed
    }

    /// Empty the cache in memory and in storage.
    pub fn clear(&self) {
        let mut guard = self.store.lock();
        *guard = Some(HashMap::new());
        if let Err(e) = self.storage.remove_item(&self.config.storage_key) {
            warn!(error = %e, "cache clear failed in storage");
        }
        info!("cache cleared");
    }

    pub fn len(&self) -> usize {
        let mut guard = self.store.lock();
        self.loaded(&mut guard).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Start a background task running `clean_expired` every `interval`
    /// until `shutdown` fires.
    pub fn start_cleanup_loop(
        cache: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.clean_expired();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("cache cleanup loop exiting");
        })
    }

    fn loaded<'a>(
        &self,
        guard: &'a mut Option<HashMap<String, CacheEntry>>,
    ) -> &'a mut HashMap<String, CacheEntry> {
        guard.get_or_insert_with(|| self.load())
    }

    fn load(&self) -> HashMap<String, CacheEntry> {
        match self.storage.get_item(&self.config.storage_key) {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&raw) {
                Ok(store) => {
                    debug!(entries = store.len(), "cache loaded");
                    store
                }
                Err(e) => {
                    warn!(error = %e, "cache blob corrupt, starting empty");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "cache load failed, starting empty");
                HashMap::new()
            }
        }
    }

    fn persist(&self, store: &HashMap<String, CacheEntry>) -> Result<(), StorageError> {
        let raw = serde_json::to_string(store)
            .map_err(|e| StorageError::Backend(format!("cache serialize failed: {e}")))?;
        self.storage.set_item(&self.config.storage_key, &raw)
    }
}

/// Remove the oldest `percent` of entries (rounded down). Returns the number removed.
fn prune_oldest(store: &mut HashMap<String, CacheEntry>, percent: u32) -> usize {
    let percent = percent.min(100) as usize;
    let to_remove = store.len() * percent / 100;
    if to_remove == 0 {
        return 0;
    }

    let mut by_age: Vec<(String, i64)> = store
        .iter()
        .map(|(k, e)| (k.clone(), e.timestamp))
        .collect();
    by_age.sort_by_key(|(_, ts)| *ts);

    for (key, _) in by_age.into_iter().take(to_remove) {
        store.remove(&key);
    }
    to_remove
}
