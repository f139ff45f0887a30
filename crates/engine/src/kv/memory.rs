//! In-process key-value backend built on `moka`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};

use super::{BackendError, KeyValueBackend};
use crate::lock::LOCK_PREFIX;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires each entry after its own TTL.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Key-value backend local to this process.
///
/// Atomicity of set-if-absent and compare-and-delete comes from moka's
/// per-key entry API.
///
/// Cart lock keys ([`LOCK_PREFIX`]) live in their own cache without a
/// capacity bound, so only their TTL ends them. Everything else shares a
/// size-bounded cache and may be evicted under pressure.
#[derive(Clone)]
pub struct MemoryBackend {
    locks: Cache<String, Entry>,
    entries: Cache<String, Entry>,
}

impl MemoryBackend {
    /// Create a backend holding at most `max_capacity` non-lock keys.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            locks: Cache::builder().expire_after(PerEntryTtl).build(),
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    fn cache_for(&self, key: &str) -> &Cache<String, Entry> {
        if key.starts_with(LOCK_PREFIX) {
            &self.locks
        } else {
            &self.entries
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let entry = self
            .cache_for(key)
            .entry(key.to_owned())
            .or_insert_with(async {
                Entry {
                    value: value.to_owned(),
                    ttl,
                }
            })
            .await;
        Ok(entry.is_fresh())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.cache_for(key).get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        self.cache_for(key)
            .insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.cache_for(key).remove(key).await.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let result = self
            .cache_for(key)
            .entry(key.to_owned())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().value == expected => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::Removed(_)))
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, BackendError> {
        let count = self
            .locks
            .iter()
            .chain(self.entries.iter())
            .filter(|(key, _)| key.starts_with(prefix))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}
