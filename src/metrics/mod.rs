use crate::config::MetricsConfig;
use crate::error::{AdmissionError, Result};
use crate::rate_limit::store::{AggregateStore, HourlyAggregate};
use crate::rate_limit::types::{Category, DecisionPath, SubjectClass};
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace};

/// Prefix of the hourly aggregate keys; deliberately outside `ratelimit:`
pub const STATS_PREFIX: &str = "ratelimit_stats:";

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            AdmissionError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        describe_counter!(
            "admission_decisions_total",
            "Total number of admission decisions"
        );
        describe_histogram!(
            "admission_decision_duration_seconds",
            "Admission decision latencies in seconds"
        );
        describe_counter!(
            "admission_slow_decisions_total",
            "Decisions that exceeded the slow-operation threshold"
        );
        describe_counter!(
            "admission_degraded_total",
            "Counter store failures absorbed by failing open or closed"
        );
        describe_counter!(
            "admission_metrics_write_failures_total",
            "Hourly aggregate writes that failed or timed out"
        );
        describe_counter!(
            "admission_metrics_dropped_samples_total",
            "Slow-path samples dropped because too many writes were in flight"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let metrics = service.render();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Record one admission decision
pub fn record_decision(category: &Category, class: SubjectClass, path: DecisionPath, allowed: bool) {
    let labels = [
        ("category", category.to_string()),
        ("subject", class.as_str().to_string()),
        ("path", path.as_str().to_string()),
        ("outcome", if allowed { "allow" } else { "deny" }.to_string()),
    ];
    counter!("admission_decisions_total", &labels).increment(1);
}

/// Record a counter store failure
pub fn record_degraded(category: &Category, cause: &str) {
    let labels = [
        ("category", category.to_string()),
        ("cause", cause.to_string()),
    ];
    counter!("admission_degraded_total", &labels).increment(1);
}

/// One timed decision, as seen by the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSample {
    pub duration_ms: u64,
    pub category: Category,
    pub subject_class: SubjectClass,
    pub endpoint: String,
}

/// Aggregate key for the hour containing `at`
pub fn hourly_key(at: DateTime<Utc>) -> String {
    format!("{}{}", STATS_PREFIX, at.format("%Y-%m-%d:%H"))
}

/// Aggregate key for an explicit date and hour, validating both
pub fn hourly_key_for(date: &str, hour: u32) -> Result<String> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| AdmissionError::InvalidRequest(format!("Invalid date '{}': {}", date, e)))?;
    if hour > 23 {
        return Err(AdmissionError::InvalidRequest(format!("Invalid hour: {}", hour)));
    }
    Ok(format!("{}{}:{:02}", STATS_PREFIX, date.format("%Y-%m-%d"), hour))
}

/// Slow-path metrics sink
///
/// Only decisions slower than `record_threshold` reach the shared aggregate.
/// The write runs on a detached task so nothing it does, including failing,
/// can reach the caller. Each write is bounded by `write_timeout` and at most
/// `max_in_flight` run at once; samples beyond that are dropped.
#[derive(Clone)]
pub struct MetricsSink {
    store: Arc<dyn AggregateStore>,
    record_threshold: Duration,
    slow_threshold: Duration,
    aggregate_ttl_secs: u64,
    write_timeout: Duration,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
}

impl MetricsSink {
    /// Create a new sink writing into `store`
    pub fn new(store: Arc<dyn AggregateStore>, config: &MetricsConfig) -> Self {
        Self {
            store,
            record_threshold: Duration::from_millis(config.record_threshold_ms),
            slow_threshold: Duration::from_millis(config.slow_threshold_ms),
            aggregate_ttl_secs: config.aggregate_ttl_secs,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight_writes)),
            max_in_flight: config.max_in_flight_writes,
        }
    }

    /// Aggregate writes currently running
    pub fn in_flight_writes(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }

    /// Record a decision's timing; never fails and never blocks on the store
    pub fn record(&self, elapsed: Duration, category: &Category, class: SubjectClass, endpoint: &str) {
        histogram!(
            "admission_decision_duration_seconds",
            "category" => category.to_string()
        )
        .record(elapsed.as_secs_f64());

        if elapsed <= self.record_threshold {
            return;
        }

        let slow = elapsed > self.slow_threshold;
        if slow {
            counter!("admission_slow_decisions_total", "category" => category.to_string())
                .increment(1);
        }

        let sample = DecisionSample {
            duration_ms: elapsed.as_millis() as u64,
            category: category.clone(),
            subject_class: class,
            endpoint: endpoint.to_string(),
        };

        // No runtime means no one to run the write; drop the sample
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!("No runtime available, dropping metrics sample");
            return;
        };

        let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
            counter!("admission_metrics_dropped_samples_total").increment(1);
            trace!("Aggregate writes saturated, dropping metrics sample");
            return;
        };

        let sink = self.clone();
        runtime.spawn(async move {
            let _permit = permit;
            let outcome =
                tokio::time::timeout(sink.write_timeout, sink.write(&sample, slow, Utc::now()))
                    .await;

            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", sink.write_timeout.as_millis()),
            };
            counter!("admission_metrics_write_failures_total").increment(1);
            debug!(error = %error, "Failed to record slow-path sample");
        });
    }

    /// Write one sample into its hourly aggregate
    pub async fn write(&self, sample: &DecisionSample, slow: bool, at: DateTime<Utc>) -> Result<()> {
        debug!(
            duration_ms = sample.duration_ms,
            category = %sample.category,
            subject = sample.subject_class.as_str(),
            endpoint = %sample.endpoint,
            "Slow admission decision"
        );

        self.store
            .accumulate(
                &hourly_key(at),
                sample.duration_ms,
                slow,
                self.aggregate_ttl_secs,
            )
            .await
            .map_err(|e| AdmissionError::MetricsWrite(e.to_string()))
    }

    /// Read the aggregate for a date (`YYYY-MM-DD`) and hour (0-23)
    pub async fn hourly(&self, date: &str, hour: u32) -> Result<Option<HourlyAggregate>> {
        let key = hourly_key_for(date, hour)?;
        self.store.fetch_aggregate(&key).await
    }
}
