//! External consensus KV seam used for lease arbitration and block storage.
//!
//! The production deployment points this trait at a strongly consistent
//! store (etcd or similar); [`MemoryKv`] provides the same conditional-put
//! semantics in-process for tests and single-node runs. Version tokens are
//! per key and monotonic; expected-version 0 means "create, must not
//! exist".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, ZirconError};

/// A value plus the version token guarding conditional writes to its key.
#[derive(Clone, Debug)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Strongly consistent KV capability: versioned reads, conditional writes,
/// TTL-scoped entries for leases, and prefix listing.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Conditional put. `expected_version` 0 requires the key to be absent;
    /// otherwise it must match the key's current version. Returns the new
    /// version. `ttl` makes the entry disappear unless re-put in time.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> Result<u64>;

    /// Conditional delete. Deleting an absent key succeeds (idempotent
    /// release); a present key must match `expected_version`.
    async fn delete(&self, key: &str, expected_version: u64) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;
}

struct KvEntry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory [`KvStore`] with real expiry, shared by every agent in a
/// process.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Force-expires a key. Test hook for lease-loss scenarios.
    pub fn expire(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.live() {
                return Ok(Some(VersionedValue {
                    value: entry.value.clone(),
                    version: entry.version,
                }));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let mut entries = self.entries.lock();
        let found = match entries.get(key) {
            Some(entry) if entry.live() => entry.version,
            _ => 0,
        };
        if found != expected_version {
            return Err(ZirconError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }
        let version = found + 1;
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                version,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let live_version = entries
            .get(key)
            .and_then(|entry| entry.live().then_some(entry.version));
        if let Some(found) = live_version {
            if found != expected_version {
                return Err(ZirconError::VersionMismatch {
                    expected: expected_version,
                    found,
                });
            }
        }
        entries.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let entries = self.entries.lock();
        let mut out: Vec<_> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live())
            .map(|(key, entry)| {
                (
                    key.clone(),
                    VersionedValue {
                        value: entry.value.clone(),
                        version: entry.version,
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
