//! Bounded result cache for large tool outputs.
//!
//! Oversized tool results are stored here keyed by tool name and an input
//! fingerprint; the conversation gets a short summary while the UI still
//! shows the full text. Entries expire by TTL and the cache is bounded by
//! entry count with least-recently-used eviction.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::config::CacheConfig;

/// How many leading characters of a cached output survive into the
/// in-context summary.
const SUMMARY_HEAD_CHARS: usize = 240;

// ---------------------------------------------------------------------------
// Key and entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tool: String,
    fingerprint: u64,
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    stored_at: Instant,
    last_access: Instant,
}

/// Deterministic fingerprint of a tool input object.
///
/// `serde_json::Map` preserves insertion order, so hash a sorted view to
/// make the fingerprint insensitive to argument order.
fn fingerprint(input: &Map<String, Value>) -> u64 {
    let mut keys: Vec<&String> = input.keys().collect();
    keys.sort();

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for key in keys {
        key.hash(&mut hasher);
        input[key].to_string().hash(&mut hasher);
    }
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// In-memory TTL + LRU cache for tool outputs.
pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    config: CacheConfig,
}

impl ResultCache {
    /// Create a cache with the given bounds.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether an output of `len` bytes is large enough to cache.
    pub fn should_cache(&self, len: usize) -> bool {
        len >= self.config.min_store_bytes
    }

    /// Store a large output and return the short summary that replaces it
    /// in the conversation. Returns `None` when the output is below the
    /// caching threshold (the caller keeps the full text in context).
    pub fn store(&self, tool: &str, input: &Map<String, Value>, value: &str) -> Option<String> {
        if !self.should_cache(value.len()) {
            return None;
        }

        let key = CacheKey {
            tool: tool.to_owned(),
            fingerprint: fingerprint(input),
        };
        let now = Instant::now();

        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        purge_expired(&mut entries, self.config.ttl, now);

        if entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
            evict_lru(&mut entries);
        }

        entries.insert(
            key,
            CacheEntry {
                value: value.to_owned(),
                stored_at: now,
                last_access: now,
            },
        );

        tracing::debug!(tool, bytes = value.len(), "large tool output cached");
        Some(summarize(tool, value))
    }

    /// Fetch the full output for a repeated identical call, refreshing its
    /// recency. Expired entries are misses.
    pub fn get(&self, tool: &str, input: &Map<String, Value>) -> Option<String> {
        let key = CacheKey {
            tool: tool.to_owned(),
            fingerprint: fingerprint(input),
        };
        let now = Instant::now();

        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        purge_expired(&mut entries, self.config.ttl, now);

        entries.get_mut(&key).map(|entry| {
            entry.last_access = now;
            entry.value.clone()
        })
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge_expired(entries: &mut HashMap<CacheKey, CacheEntry>, ttl: Duration, now: Instant) {
    entries.retain(|_, entry| now.duration_since(entry.stored_at) < ttl);
}

fn evict_lru(entries: &mut HashMap<CacheKey, CacheEntry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(key, _)| key.clone())
    {
        entries.remove(&oldest);
    }
}

/// Build the short in-context stand-in for a cached output.
fn summarize(tool: &str, value: &str) -> String {
    let head: String = value.chars().take(SUMMARY_HEAD_CHARS).collect();
    let lines = value.lines().count();
    format!(
        "{head}\n[{tool} produced {} bytes over {lines} lines; output cached. \
         Repeat the identical call to retrieve it in full]",
        value.len(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
