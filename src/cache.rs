//! Primary-key column cache keyed by `schema.table`.
//!
//! Loaded once from the catalog before the pipeline starts and read on every
//! event, so lookups never go to the database. A missing entry means the key
//! is unknown, not that the table has none.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::postgres::KeyCatalog;
use crate::Result;

#[derive(Debug, Clone)]
struct CacheEntry {
    columns: Vec<String>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
pub struct KeyColumnCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Option<Duration>,
    schemas: Vec<String>,
}

impl KeyColumnCache {
    /// A zero `ttl` keeps entries until they are deleted or flushed.
    pub fn new(ttl: Duration, schemas: Vec<String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: (!ttl.is_zero()).then_some(ttl),
            schemas,
        }
    }

    pub fn key(schema: &str, table: &str) -> String {
        format!("{}.{}", schema, table)
    }

    /// Loads the primary keys of every table in the configured schemas.
    pub async fn init<C: KeyCatalog + ?Sized>(&self, catalog: &C) -> Result<usize> {
        let keys = catalog.primary_keys(&self.schemas).await?;
        let loaded = keys.len();

        let mut entries = self.write();
        for key in keys {
            let entry = self.entry(key.columns);
            entries.insert(Self::key(&key.schema, &key.table), entry);
        }

        info!(tables = loaded, "Primary key cache initialized");
        Ok(loaded)
    }

    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let entries = self.read();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.columns.clone())
    }

    pub fn set(&self, key: impl Into<String>, columns: Vec<String>) {
        let entry = self.entry(columns);
        self.write().insert(key.into(), entry);
    }

    pub fn del(&self, keys: &[&str]) {
        let mut entries = self.write();
        for key in keys {
            entries.remove(*key);
        }
    }

    pub fn flush(&self) {
        self.write().clear();
        debug!("Primary key cache flushed");
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired primary keys");
        }
        removed
    }

    /// Starts a background sweep every `ttl * fraction`.
    ///
    /// Returns `None` when entries never expire. The task ends when the
    /// handle is dropped or the cache is gone.
    pub fn spawn_sweeper(self: &Arc<Self>, fraction: f64) -> Option<SweeperHandle> {
        let ttl = self.ttl?;
        let period = ttl.mul_f64(fraction).max(Duration::from_millis(1));
        let cache: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        });

        debug!(period_ms = period.as_millis() as u64, "Started primary key sweeper");
        Some(SweeperHandle { task })
    }

    fn entry(&self, columns: Vec<String>) -> CacheEntry {
        CacheEntry {
            columns,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Aborts the sweep task on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
