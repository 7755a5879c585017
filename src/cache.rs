//! Content-addressed analysis result cache.
//!
//! Entries are keyed by the canonical JSON of the request body, never by the
//! query id or by which engine instance answered. The cache therefore stays
//! valid across engine restarts and is shared by every engine a supervisor
//! creates.
//!
//! Eviction is least-recently-used by item count, with an optional TTL checked
//! on read. The lock is held only for map operations, never across an `.await`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::types::CacheConfig;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub max_items: usize,
}

#[derive(Debug)]
struct CacheEntry {
    fields: Map<String, Value>,
    inserted_at: Instant,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // tick → key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

/// Derive the cache key for a request body.
///
/// `serde_json::Map` keeps keys sorted, so serialization is canonical: two
/// bodies with the same content produce the same key regardless of the order
/// their fields were inserted in.
pub fn content_key(body: &Map<String, Value>) -> String {
    Value::Object(body.clone()).to_string()
}

/// Bounded LRU + TTL cache of successful analysis responses.
#[derive(Debug)]
pub struct AnalysisCache {
    max_items: usize,
    ttl: Option<Duration>,
    state: Mutex<CacheState>,
}

impl AnalysisCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_items: config.max_items,
            ttl: config.ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Look up a cached response body.
    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<Map<String, Value>> {
        let mut state = self.lock();

        let Some(inserted_at) = state.entries.get(key).map(|entry| entry.inserted_at) else {
            state.misses += 1;
            return None;
        };

        if self
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(inserted_at) > ttl)
        {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let tick = state.bump();
        let entry = state.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.tick, tick);
        let fields = entry.fields.clone();
        state.recency.remove(&previous);
        state.recency.insert(tick, key.to_string());
        state.hits += 1;
        Some(fields)
    }

    /// Store a response body, evicting the least recently used entries if full.
    pub fn insert(&self, key: String, fields: Map<String, Value>) {
        self.insert_at(key, fields, Instant::now());
    }

    pub fn insert_at(&self, key: String, fields: Map<String, Value>, now: Instant) {
        let mut state = self.lock();
        state.remove(&key);

        let tick = state.bump();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                fields,
                inserted_at: now,
                tick,
            },
        );

        if self.max_items > 0 {
            while state.entries.len() > self.max_items {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                state.evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and reset statistics.
    pub fn clear(&self) {
        *self.lock() = CacheState::default();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            entries: state.entries.len(),
            max_items: self.max_items,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
