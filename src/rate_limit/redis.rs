use super::lua_scripts::{HOURLY_AGGREGATE_SCRIPT, INCREMENT_WITH_EXPIRY_SCRIPT};
use super::store::{aggregate_from_fields, AggregateStore, CounterStore, HourlyAggregate};
use crate::error::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::collections::HashMap;
use tracing::{debug, info};

/// Keys fetched per SCAN round during a bulk clear
const SCAN_BATCH: usize = 500;

/// Redis-backed shared counter store
///
/// `ConnectionManager` multiplexes over one connection and reconnects on its
/// own, so each call works on a cheap clone instead of holding a lock.
pub struct RedisStore {
    connection: ConnectionManager,
    increment_script: Script,
    aggregate_script: Script,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Connected to Redis counter store");

        Ok(Self {
            connection,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY_SCRIPT),
            aggregate_script: Script::new(HOURLY_AGGREGATE_SCRIPT),
        })
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_and_get_count(&self, key: &str, window_secs: u64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let count = self
            .increment_script
            .key(key)
            .arg(window_secs)
            .invoke_async::<_, i64>(&mut conn)
            .await?;

        debug!(key, count, "Counter incremented");
        Ok(count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        // -2 = missing key, -1 = no expiry
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl.max(0) as u64)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: u64 = redis::cmd("UNLINK")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(prefix, deleted, "Bulk-cleared counters");
        Ok(deleted)
    }
}

#[async_trait]
impl AggregateStore for RedisStore {
    async fn accumulate(
        &self,
        key: &str,
        duration_ms: u64,
        slow: bool,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        self.aggregate_script
            .key(key)
            .arg(duration_ms)
            .arg(i64::from(slow))
            .arg(ttl_secs)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fetch_aggregate(&self, key: &str) -> Result<Option<HourlyAggregate>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, i64> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(aggregate_from_fields(&fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: these tests require a running Redis instance.
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn create_test_store() -> RedisStore {
        RedisStore::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis")
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("ratelimit:"), "ratelimit:*");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_connection() {
        let store = create_test_store().await;
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_increment_sets_ttl() {
        let store = create_test_store().await;
        let key = format!("ratelimit:test:user:{}", rand::random::<u32>());

        assert_eq!(store.increment_and_get_count(&key, 60).await.unwrap(), 1);
        assert_eq!(store.increment_and_get_count(&key, 60).await.unwrap(), 2);

        let ttl = store.remaining_ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_delete_by_prefix() {
        let store = create_test_store().await;
        let prefix = format!("ratelimit-test-{}:", rand::random::<u32>());

        for i in 0..3 {
            store
                .increment_and_get_count(&format!("{}{}", prefix, i), 60)
                .await
                .unwrap();
        }

        assert_eq!(store.delete_by_prefix(&prefix).await.unwrap(), 3);
        assert_eq!(
            store.remaining_ttl(&format!("{}0", prefix)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_aggregate() {
        let store = create_test_store().await;
        let key = format!("ratelimit_stats:test:{}", rand::random::<u32>());

        store.accumulate(&key, 40, false, 3600).await.unwrap();
        store.accumulate(&key, 140, true, 3600).await.unwrap();

        let aggregate = store.fetch_aggregate(&key).await.unwrap().unwrap();
        assert_eq!(aggregate.count, 2);
        assert_eq!(aggregate.total_duration_ms, 180);
        assert_eq!(aggregate.slow_operation_count, 1);
        assert!(store.remaining_ttl(&key).await.unwrap() > 0);
    }
}
