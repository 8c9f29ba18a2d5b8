//! Query Result Cache
//!
//! Bounded, time-boxed store of completed queries keyed on
//! (connection, question, schema fingerprint, policy).
//!
//! Eviction follows insertion order, not access order: reading an entry does
//! not protect it. Any failure here (poisoned lock, unreadable snapshot) is
//! logged and treated as a miss or a skipped write, never surfaced.

use crate::db::Row;
use crate::security::Policy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// Time source, injectable so expiry can be tested without sleeping
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Configuration for the query result cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    /// JSON snapshot file; `None` keeps the cache in memory only
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            path: None,
        }
    }
}

/// Result of a completed query as handed to the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub sql: String,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(flatten)]
    pub result: CachedResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order, oldest first
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.order.retain(|k| k != key);
        self.entries.remove(key)
    }

    fn snapshot(&self) -> Vec<(&String, &CacheEntry)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get_key_value(k))
            .collect()
    }
}

pub struct QueryCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = Self {
            config,
            clock,
            inner: Mutex::new(CacheInner::default()),
        };
        cache.load();
        cache
    }

    /// Deterministic key over the four inputs. Each part is length-prefixed so
    /// that different splits of the same bytes never collide.
    pub fn key(connection: &str, question: &str, fingerprint: &str, policy: Policy) -> String {
        let policy = policy.to_string();
        let mut hasher = Sha256::new();
        for part in [connection, question, fingerprint, policy.as_str()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, connection: &str, question: &str, fingerprint: &str, policy: Policy) -> Option<CacheEntry> {
        let key = Self::key(connection, question, fingerprint, policy);
        let now = self.clock.now();

        let entry = {
            let mut inner = self.lock()?;
            let entry = inner.entries.get(&key)?.clone();
            if self.is_expired(&entry, now) {
                inner.remove(&key);
                debug!("Cache entry expired");
                self.save(&inner);
                None
            } else {
                Some(entry)
            }
        };

        if entry.is_some() {
            debug!("Cache hit");
        }
        entry
    }

    pub fn set(&self, connection: &str, question: &str, fingerprint: &str, policy: Policy, result: CachedResult) {
        let key = Self::key(connection, question, fingerprint, policy);
        let entry = CacheEntry {
            result,
            created_at: self.clock.now(),
        };

        let Some(mut inner) = self.lock() else { return };
        // Overwriting keeps the key's original insertion position.
        if inner.entries.insert(key.clone(), entry).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.config.max_entries {
            let Some(oldest) = inner.order.pop_front() else { break };
            inner.entries.remove(&oldest);
            debug!("Evicted oldest cache entry");
        }
        self.save(&inner);
    }

    pub fn clear(&self) {
        let Some(mut inner) = self.lock() else { return };
        inner.entries.clear();
        inner.order.clear();
        self.save(&inner);
    }

    pub fn clear_expired(&self) {
        let now = self.clock.now();
        let Some(mut inner) = self.lock() else { return };
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        self.save(&inner);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.config.max_entries,
            ttl_secs: self.config.ttl.as_secs(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.created_at).to_std() {
            Ok(age) => age > self.config.ttl,
            // Entry stamped in the future (clock moved back): keep it
            Err(_) => false,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, CacheInner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("Query cache lock poisoned, bypassing cache: {}", e);
                None
            }
        }
    }

    /// Write the snapshot file. Called with the lock held, so the file never
    /// lags behind a later mutation.
    fn save(&self, inner: &CacheInner) {
        let Some(path) = self.config.path.as_ref() else { return };
        let data = match serde_json::to_string(&inner.snapshot()) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize query cache: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create cache directory {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = std::fs::write(path, data) {
            warn!("Failed to save query cache to {}: {}", path.display(), e);
        }
    }

    fn load(&self) {
        let Some(path) = self.config.path.as_ref() else { return };
        if !path.exists() {
            return;
        }

        let entries: Vec<(String, CacheEntry)> = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|data| serde_json::from_str(&data).map_err(|e| e.to_string()))
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to load query cache from {}: {}", path.display(), e);
                return;
            }
        };

        let Some(mut inner) = self.lock() else { return };
        for (key, entry) in entries {
            if inner.entries.insert(key.clone(), entry).is_none() {
                inner.order.push_back(key);
            }
        }
        drop(inner);

        self.clear_expired();
        info!("Loaded {} cached queries from {}", self.len(), path.display());
    }
}
