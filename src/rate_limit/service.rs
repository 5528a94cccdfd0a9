use super::local::LocalDamper;
use super::quota::QuotaTable;
use super::redis::RedisStore;
use super::store::{AggregateStore, CounterStore, MemoryStore};
use super::types::{
    counter_key, Category, DecisionPath, Denial, Quota, RawIdentity, Subject, SubjectClass, Verdict,
};
use crate::config::{AdmissionConfig, StoreBackend};
use crate::error::{AdmissionError, Result};
use crate::metrics::{self, MetricsSink};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Source of the current wall-clock second
pub trait Clock: Send + Sync {
    fn now_second(&self) -> u64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_second(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Tracks whether the counter store is currently failing
///
/// Logs once when an outage starts and once when it ends; failures in between
/// only show up at debug level and in the degraded counter.
#[derive(Debug, Default)]
pub struct DegradedMode {
    degraded: AtomicBool,
    episodes: AtomicU64,
}

impl DegradedMode {
    fn on_failure(&self, error: &AdmissionError, category: &Category) {
        let cause = match error {
            AdmissionError::StoreTimeout(_) => "timeout",
            _ => "unavailable",
        };
        metrics::record_degraded(category, cause);

        if !self.degraded.swap(true, Ordering::AcqRel) {
            self.episodes.fetch_add(1, Ordering::Relaxed);
            warn!(error = %error, "Counter store failing, entering degraded mode");
        } else {
            debug!(error = %error, "Counter store still failing");
        }
    }

    fn on_success(&self) {
        if self.degraded.load(Ordering::Acquire) && self.degraded.swap(false, Ordering::AcqRel) {
            info!("Counter store recovered, leaving degraded mode");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of distinct outages observed
    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }
}

/// One admission request as handed over by the HTTP layer
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub identity: RawIdentity,
    pub category: Category,
    pub internal: bool,
    pub elevated: bool,
    /// Endpoint label for slow-path metrics
    pub endpoint: Option<String>,
}

/// Decides, per request, whether it may proceed
///
/// Per request: bypass check, subject resolution, local damping, quota
/// lookup, then one atomic increment of the shared counter. Any failure of
/// the shared store resolves to a verdict instead of an error.
pub struct AdmissionDecider {
    quotas: Arc<QuotaTable>,
    damper: Arc<LocalDamper>,
    counters: Arc<dyn CounterStore>,
    metrics: Option<MetricsSink>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    fail_closed: HashSet<Category>,
    degraded: DegradedMode,
}

impl AdmissionDecider {
    /// Create a decider with default timeout and no metrics sink
    pub fn new(
        quotas: Arc<QuotaTable>,
        damper: Arc<LocalDamper>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            quotas,
            damper,
            counters,
            metrics: None,
            clock: Arc::new(SystemClock),
            store_timeout: Duration::from_millis(50),
            fail_closed: HashSet::new(),
            degraded: DegradedMode::default(),
        }
    }

    pub fn with_metrics(mut self, sink: MetricsSink) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_fail_closed(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.fail_closed = categories.into_iter().collect();
        self
    }

    /// Build a decider and its stores from configuration
    pub async fn from_config(config: &AdmissionConfig) -> Result<Self> {
        config.validate()?;

        let quotas = Arc::new(config.quotas.quota_table()?);

        let damper = if config.damper.enabled {
            let threshold =
                LocalDamper::safe_threshold(quotas.min_max_attempts(), config.damper.burst_threshold);
            info!(
                threshold,
                min_max_attempts = quotas.min_max_attempts(),
                "Local damper enabled"
            );
            LocalDamper::new(
                threshold,
                config.damper.max_entries,
                Duration::from_secs(config.damper.idle_secs),
            )
        } else {
            info!("Local damper disabled");
            LocalDamper::disabled()
        };

        let (counters, aggregates): (Arc<dyn CounterStore>, Arc<dyn AggregateStore>) =
            match config.store.backend {
                StoreBackend::Memory => {
                    info!("Using in-memory counter store");
                    let store = Arc::new(MemoryStore::new());
                    store.spawn_purge_task(Duration::from_secs(config.store.purge_interval_secs));
                    (
                        store.clone() as Arc<dyn CounterStore>,
                        store as Arc<dyn AggregateStore>,
                    )
                }
                StoreBackend::Redis => {
                    let url = config.store.url.as_deref().ok_or_else(|| {
                        AdmissionError::Config("Redis store requires a url".to_string())
                    })?;
                    let store = Arc::new(RedisStore::new(url).await?);
                    if let Err(e) = store.ping().await {
                        warn!(error = %e, "Redis ping failed; decisions will fail open until it recovers");
                    }
                    (
                        store.clone() as Arc<dyn CounterStore>,
                        store as Arc<dyn AggregateStore>,
                    )
                }
            };

        Ok(Self::new(quotas, Arc::new(damper), counters)
            .with_metrics(MetricsSink::new(aggregates, &config.metrics))
            .with_store_timeout(Duration::from_millis(config.store.timeout_ms))
            .with_fail_closed(config.fail_closed()))
    }

    /// Decide whether a request may proceed
    pub async fn decide(
        &self,
        identity: &RawIdentity,
        category: &Category,
        is_internal: bool,
        is_elevated: bool,
    ) -> Verdict {
        self.decide_request(&AdmissionRequest {
            identity: identity.clone(),
            category: category.clone(),
            internal: is_internal,
            elevated: is_elevated,
            endpoint: None,
        })
        .await
    }

    /// Decide, recording metrics against the request's endpoint
    pub async fn decide_request(&self, request: &AdmissionRequest) -> Verdict {
        let started = Instant::now();
        let (verdict, class, path) = self.evaluate(request).await;

        metrics::record_decision(&request.category, class, path, verdict.is_allowed());
        if let Some(sink) = &self.metrics {
            sink.record(
                started.elapsed(),
                &request.category,
                class,
                request.endpoint.as_deref().unwrap_or("unknown"),
            );
        }

        verdict
    }

    async fn evaluate(&self, request: &AdmissionRequest) -> (Verdict, SubjectClass, DecisionPath) {
        if request.internal || request.elevated {
            return (Verdict::Allow, SubjectClass::Internal, DecisionPath::Bypassed);
        }

        let subject = resolve_subject(&self.quotas, &request.identity);
        let class = subject.class();
        let Some(subject_key) = subject.subject_key() else {
            return (Verdict::Allow, class, DecisionPath::Bypassed);
        };
        let category = &request.category;

        let now = self.clock.now_second();
        if self
            .damper
            .should_skip_remote_check(&subject_key, category, now)
        {
            return (Verdict::Allow, class, DecisionPath::ShortCircuited);
        }

        let quota = self.quota_for(&subject, category);
        let key = counter_key(category, &subject_key);

        let count = match self
            .guarded(self.counters.increment_and_get_count(&key, quota.window_secs))
            .await
        {
            Ok(count) => {
                self.degraded.on_success();
                count
            }
            Err(e) => {
                self.degraded.on_failure(&e, category);
                let verdict = self.degraded_verdict(&subject, category, quota);
                return (verdict, class, DecisionPath::Degraded);
            }
        };

        if !quota.is_exceeded_by(count) {
            debug!(key = %key, count, limit = quota.max_attempts, "Admitted");
            return (Verdict::Allow, class, DecisionPath::QuotaChecked);
        }

        let ttl = match self.guarded(self.counters.remaining_ttl(&key)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                self.degraded.on_failure(&e, category);
                quota.window_secs
            }
        };
        let retry_after_secs = ttl.clamp(1, quota.window_secs);

        self.damper
            .pin(&subject_key, category, now.saturating_add(retry_after_secs));

        warn!(
            key = %key,
            count,
            limit = quota.max_attempts,
            retry_after_secs,
            "Rate limit exceeded"
        );

        let verdict = Verdict::Deny(self.denial(&subject, category, quota, retry_after_secs));
        (verdict, class, DecisionPath::QuotaChecked)
    }

    fn quota_for(&self, subject: &Subject, category: &Category) -> Quota {
        match subject {
            Subject::Authenticated { tier, .. } => self.quotas.lookup(*tier, category),
            _ => self.quotas.guest(category),
        }
    }

    fn denial(
        &self,
        subject: &Subject,
        category: &Category,
        quota: Quota,
        retry_after_secs: u64,
    ) -> Denial {
        let upgrade = match subject {
            Subject::Authenticated { tier, .. } => self.quotas.upgrade_for(*tier, category),
            _ => None,
        };

        Denial {
            retry_after_secs,
            subject_class: subject.class(),
            category: category.clone(),
            quota,
            upgrade,
        }
    }

    /// Verdict while the shared store cannot be consulted
    fn degraded_verdict(&self, subject: &Subject, category: &Category, quota: Quota) -> Verdict {
        if self.fail_closed.contains(category) {
            Verdict::Deny(self.denial(subject, category, quota, quota.window_secs))
        } else {
            Verdict::Allow
        }
    }

    /// Bound a store call by the hot-path timeout
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::StoreTimeout(
                self.store_timeout.as_millis() as u64
            )),
        }
    }

    /// Administrative bulk clear of shared counters, plus the local damper
    pub async fn flush(&self, prefix: &str) -> Result<u64> {
        let deleted = self.counters.delete_by_prefix(prefix).await?;
        self.damper.clear();
        info!(prefix, deleted, "Flushed rate limit counters");
        Ok(deleted)
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    pub fn metrics_sink(&self) -> Option<&MetricsSink> {
        self.metrics.as_ref()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_degraded()
    }

    pub fn degraded_episodes(&self) -> u64 {
        self.degraded.episodes()
    }
}

/// Classify the raw identity; the quota table decides what unknown tiers map to
fn resolve_subject(quotas: &QuotaTable, identity: &RawIdentity) -> Subject {
    match identity {
        RawIdentity::Anonymous { ip } => Subject::Anonymous { ip: ip.clone() },
        RawIdentity::Authenticated { user_id, tier } => Subject::Authenticated {
            user_id: user_id.clone(),
            tier: quotas.resolve_tier(tier),
        },
    }
}
