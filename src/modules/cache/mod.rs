//! On-disk fallback cache.
//!
//! Stores the payload of prior successful fetches keyed by normalized
//! target URL so a request whose retries are exhausted can still be served.
//! Entries survive process restarts; expiry is lazy, applied when an entry
//! is read past its ttl.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::modules::clock::Clock;

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("fetch_cache");

/// Cached payload for one normalized target URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.stored_at;
        age.num_seconds() >= 0 && (age.num_seconds() as u64) <= self.ttl_secs
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("cache transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("cache table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("cache storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("cache commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("cache entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistent content store consulted when live fetching fails.
///
/// Reads and writes of the same key are serialized through a per-key
/// critical section; unrelated keys proceed in parallel.
pub struct FallbackCache {
    db: Database,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FallbackCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let db = Database::create(path)?;
        // Make sure the table exists so first reads do not fail.
        let txn = db.begin_write()?;
        txn.open_table(ENTRIES)?;
        txn.commit()?;

        Ok(Self {
            db,
            ttl,
            clock,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Look up the entry for `url`, evicting it when past its ttl.
    pub async fn get(&self, url: &Url) -> Result<Option<CacheEntry>, CacheError> {
        let key = normalize_key(url);
        let lock = self.key_lock(&key).await;
        let _section = lock.lock().await;

        let entry = self.read_entry(&key)?;
        match entry {
            Some(entry) if entry.is_fresh(self.clock.utc_now()) => Ok(Some(entry)),
            Some(_) => {
                log::debug!("evicting expired cache entry for {key}");
                self.remove_entry(&key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store `payload` for `url`, unconditionally overwriting any previous
    /// entry. Last successful write wins.
    pub async fn put(&self, url: &Url, payload: &[u8]) -> Result<(), CacheError> {
        let key = normalize_key(url);
        let lock = self.key_lock(&key).await;
        let _section = lock.lock().await;

        let entry = CacheEntry {
            payload: payload.to_vec(),
            stored_at: self.clock.utc_now(),
            ttl_secs: self.ttl.as_secs(),
        };
        let encoded = serde_json::to_vec(&entry)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            table.insert(key.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        log::debug!("cached {} bytes for {key}", payload.len());
        Ok(())
    }

    fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        let Some(raw) = table.get(key)? else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(raw.value())?;
        Ok(Some(entry))
    }

    fn remove_entry(&self, key: &str) -> Result<(), CacheError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guard = self.key_locks.lock().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Normalize a target URL into its cache key.
///
/// Scheme and host are lowercased by the parser already; default ports,
/// fragments, and a trailing slash on the path are dropped. The query
/// string is kept in the order given.
pub fn normalize_key(url: &Url) -> String {
    let mut key = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        key.push_str(&format!(":{port}"));
    }
    let path = url.path().trim_end_matches('/');
    if !path.is_empty() {
        key.push_str(path);
    }
    if let Some(query) = url.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}
