//! Shared key-value store seam.
//!
//! The queue's job locks and the pause/cancel flags live in one shared KV
//! store so that every worker process observes the same keys. The production
//! deployment points this trait at a networked store; [`InMemoryKv`] backs
//! tests and single-process runs. All operations are atomic per key and TTLs
//! are honored lazily on access.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KvError {
    /// The store cannot be reached at all.
    #[error("key-value store unavailable: {message}")]
    #[diagnostic(
        code(backtest::kv::unavailable),
        help("Check connectivity to the shared key-value store.")
    )]
    Unavailable { message: String },

    #[error("key-value operation failed: {message}")]
    #[diagnostic(code(backtest::kv::operation))]
    Operation { message: String },
}

/// Minimal shared KV surface the core needs: get, put with optional TTL,
/// conditional put for lock acquisition, delete.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set the key only when absent; returns whether the write happened.
    /// This is the lock-acquisition primitive.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

struct KvEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local TTL-aware store.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<FxHashMap<String, KvEntry>>,
}

impl InMemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Utc::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Lazy expiry: drop the dead entry under the write lock.
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.write().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if !entry.expired(now) {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.expired(now)),
            None => Ok(false),
        }
    }
}
