use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use log::debug;
use serde::Serialize;
use serde_json::Value;

/// Default entry cap; responses are tiny JSON documents.
const DEFAULT_MAX_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub current_size: usize,
    pub window_version: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
    window_version: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

/// FIFO response cache. Keys embed the window version, so one
/// `invalidate_all` makes every previously generated key unreachable even
/// though entries are also cleared eagerly.
pub struct ResponseCache {
    max_size: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        ResponseCache {
            max_size: max_size.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                window_version: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                invalidations: 0,
            }),
        }
    }

    /// Build a key for `(handler, params)` bound to the current window
    /// version: `handler:version:stable_hash(sorted params)`.
    pub fn generate_key(&self, handler: &str, params: &[(String, String)]) -> String {
        let version = self.inner.lock().unwrap().window_version;
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let mut material = String::new();
        for (key, value) in sorted {
            material.push_str(key);
            material.push('=');
            material.push_str(value);
            material.push('&');
        }
        let hash = seahash::hash(material.as_bytes());
        format!("{handler}:{version}:{hash:016x}")
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key).cloned() {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: String, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&key) {
            inner.entries.insert(key, value);
            return;
        }
        if inner.entries.len() >= self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                debug!("Response cache evicted oldest entry {}", oldest);
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, value);
    }

    /// Drop every entry and advance the window version embedded in new keys.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
        inner.window_version += 1;
        inner.invalidations += 1;
        debug!(
            "Response cache invalidated, window version now {}",
            inner.window_version
        );
    }

    pub fn window_version(&self) -> u64 {
        self.inner.lock().unwrap().window_version
    }

    pub fn get_stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            invalidations: inner.invalidations,
            current_size: inner.entries.len(),
            window_version: inner.window_version,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
