//! Shared counter store abstraction
//!
//! Two backends implement the traits here:
//! - Redis for fleet-wide deployments (see [`super::redis`])
//! - In-memory for development, single-instance deployments and tests

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::debug;

/// Atomically incrementing, TTL-bearing counters shared across processes
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count
    ///
    /// When the count becomes 1, or the key somehow has no TTL, the TTL is set
    /// to `window_secs`. Increment and expiry happen as one atomic step.
    async fn increment_and_get_count(&self, key: &str, window_secs: u64) -> Result<i64>;

    /// Seconds until `key` expires; 0 if it does not exist
    async fn remaining_ttl(&self, key: &str) -> Result<u64>;

    /// Delete every key starting with `prefix`, returning how many were removed
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Hourly aggregate of slow-path timings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub count: u64,
    pub total_duration_ms: u64,
    pub slow_operation_count: u64,
}

/// Self-expiring aggregate records
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Add one sample to the aggregate at `key`, setting `ttl_secs` if unset
    async fn accumulate(&self, key: &str, duration_ms: u64, slow: bool, ttl_secs: u64)
        -> Result<()>;

    /// Read the aggregate at `key`, if present
    async fn fetch_aggregate(&self, key: &str) -> Result<Option<HourlyAggregate>>;
}

/// Value with absolute expiry
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory store
///
/// Each key's read-modify-write happens under its DashMap shard lock, which
/// makes increment-and-expire atomic within the process. Expiry is lazy:
/// dead entries are treated as absent and replaced on the next write.
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<String, Expiring<i64>>,
    aggregates: DashMap<String, Expiring<HourlyAggregate>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len() + self.aggregates.len();
        self.counters.retain(|_, entry| entry.is_live(now));
        self.aggregates.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.counters.len() + self.aggregates.len())
    }

    /// Purge expired entries every `every` until the store is dropped
    ///
    /// Expiry is otherwise lazy, so without this task every distinct key ever
    /// seen would stay resident.
    pub fn spawn_purge_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired in-memory counters");
                }
            }
        })
    }

    /// Number of resident counter entries, live or not (for testing/monitoring)
    pub fn resident_counters(&self) -> usize {
        self.counters.len()
    }

    /// Number of live counters (for testing/monitoring)
    pub fn live_counters(&self) -> usize {
        let now = Instant::now();
        self.counters
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_get_count(&self, key: &str, window_secs: u64) -> Result<i64> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: 0,
                expires_at: now + window,
            });

        if !entry.is_live(now) {
            entry.value = 0;
            entry.expires_at = now + window;
        }
        entry.value += 1;

        Ok(entry.value)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let ttl = self
            .counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| {
                let left = entry.expires_at.saturating_duration_since(now);
                // Round up like Redis' TTL so a live key never reports 0
                left.as_secs() + u64::from(left.subsec_nanos() > 0)
            })
            .unwrap_or(0);

        Ok(ttl)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut deleted = 0u64;
        self.counters.retain(|key, _| {
            let matched = key.starts_with(prefix);
            deleted += u64::from(matched);
            !matched
        });
        self.aggregates.retain(|key, _| {
            let matched = key.starts_with(prefix);
            deleted += u64::from(matched);
            !matched
        });

        Ok(deleted)
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn accumulate(
        &self,
        key: &str,
        duration_ms: u64,
        slow: bool,
        ttl_secs: u64,
    ) -> Result<()> {
        let now = Instant::now();
        let ttl = Duration::from_secs(ttl_secs);

        let mut entry = self
            .aggregates
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HourlyAggregate::default(),
                expires_at: now + ttl,
            });

        if !entry.is_live(now) {
            entry.value = HourlyAggregate::default();
            entry.expires_at = now + ttl;
        }
        entry.value.count += 1;
        entry.value.total_duration_ms += duration_ms;
        if slow {
            entry.value.slow_operation_count += 1;
        }

        Ok(())
    }

    async fn fetch_aggregate(&self, key: &str) -> Result<Option<HourlyAggregate>> {
        let now = Instant::now();
        Ok(self
            .aggregates
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }
}

/// Build an aggregate from a Redis-style field map
pub(crate) fn aggregate_from_fields(fields: &HashMap<String, i64>) -> Option<HourlyAggregate> {
    if fields.is_empty() {
        return None;
    }

    let field = |name: &str| fields.get(name).copied().unwrap_or(0).max(0) as u64;
    Some(HourlyAggregate {
        count: field("count"),
        total_duration_ms: field("total_duration_ms"),
        slow_operation_count: field("slow_operation_count"),
    })
}
