use super::types::Category;
use moka::sync::Cache;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Per-(subject, category) burst state for the current wall-clock second
#[derive(Debug)]
struct DamperEntry {
    last_checked_second: u64,
    local_count: u32,
    /// Remote checks are forced until this second (exclusive) after a denial
    pinned_until_second: u64,
}

impl DamperEntry {
    fn new() -> Self {
        Self {
            // No real second matches, so the first call always resets
            last_checked_second: u64::MAX,
            local_count: 0,
            pinned_until_second: 0,
        }
    }
}

/// Process-local damper that skips redundant shared-store checks
///
/// At least one remote check happens per key per wall-clock second. Within a
/// second, further requests are waved through only while the local burst
/// stays strictly below `burst_threshold`, which is always smaller than the
/// smallest configured `max_attempts`. The table is bounded: entries beyond
/// `max_entries` are evicted by the cache's LRU-like policy and idle entries
/// expire.
pub struct LocalDamper {
    entries: Cache<(String, Category), Arc<Mutex<DamperEntry>>>,
    burst_threshold: u32,
    enabled: bool,
}

impl LocalDamper {
    /// Create a new damper
    pub fn new(burst_threshold: u32, max_entries: u64, idle: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_idle(idle)
                .build(),
            burst_threshold,
            enabled: true,
        }
    }

    /// A damper that never skips
    pub fn disabled() -> Self {
        Self {
            entries: Cache::new(0),
            burst_threshold: 0,
            enabled: false,
        }
    }

    /// Pick a burst threshold strictly below the smallest configured limit
    ///
    /// An explicit value is clamped into range; otherwise half the smallest
    /// limit is used. A threshold of 2 or less never skips anything.
    pub fn safe_threshold(min_max_attempts: u32, configured: Option<u32>) -> u32 {
        let ceiling = min_max_attempts.saturating_sub(1).max(1);
        configured
            .unwrap_or(min_max_attempts / 2)
            .clamp(1, ceiling)
    }

    /// Decide whether the remote check may be skipped for this request
    pub fn should_skip_remote_check(
        &self,
        subject_key: &str,
        category: &Category,
        now_second: u64,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let slot = self
            .entries
            .get_with((subject_key.to_string(), category.clone()), || {
                Arc::new(Mutex::new(DamperEntry::new()))
            });
        let mut entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if entry.last_checked_second != now_second {
            entry.last_checked_second = now_second;
            entry.local_count = 1;
            return false;
        }

        entry.local_count = entry.local_count.saturating_add(1);

        if now_second < entry.pinned_until_second {
            return false;
        }

        let skip = entry.local_count < self.burst_threshold;
        if skip {
            debug!(
                subject_key,
                category = %category,
                burst = entry.local_count,
                "Skipping remote check"
            );
        }
        skip
    }

    /// Force remote checks for a key until `until_second`
    ///
    /// Called after a denial so the damper never waves through a subject the
    /// shared store already knows to be over its limit.
    pub fn pin(&self, subject_key: &str, category: &Category, until_second: u64) {
        if !self.enabled {
            return;
        }

        let slot = self
            .entries
            .get_with((subject_key.to_string(), category.clone()), || {
                Arc::new(Mutex::new(DamperEntry::new()))
            });
        let mut entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entry.pinned_until_second = entry.pinned_until_second.max(until_second);
    }

    /// Drop every local entry
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of tracked keys (for testing/monitoring)
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn burst_threshold(&self) -> u32 {
        self.burst_threshold
    }
}
