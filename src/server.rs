//! Admission sidecar HTTP surface
//!
//! Lets non-Rust callers ask for verdicts over HTTP and exposes the
//! administrative operations (bulk counter clear, hourly stats, metrics).

use crate::error::{AdmissionError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::middleware::denial_response;
use crate::rate_limit::service::{AdmissionDecider, AdmissionRequest};
use crate::rate_limit::types::{Category, RawIdentity, Verdict, COUNTER_PREFIX};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state of the sidecar handlers
#[derive(Clone)]
pub struct AppState {
    pub decider: Arc<AdmissionDecider>,
    /// Absent when another component owns the global metrics recorder
    pub prometheus: Option<MetricsService>,
}

impl AppState {
    pub fn new(decider: Arc<AdmissionDecider>, prometheus: Option<MetricsService>) -> Self {
        Self {
            decider,
            prometheus,
        }
    }
}

/// Body of `POST /v1/admission`
#[derive(Debug, Deserialize)]
pub struct AdmissionBody {
    pub identity: RawIdentity,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl TryFrom<AdmissionBody> for AdmissionRequest {
    type Error = AdmissionError;

    fn try_from(body: AdmissionBody) -> Result<Self> {
        let category = match body.category.as_deref() {
            Some(name) => Category::parse(name)?,
            None => Category::default_category(),
        };

        Ok(AdmissionRequest {
            identity: body.identity,
            category,
            internal: body.internal,
            elevated: body.elevated,
            endpoint: body.endpoint,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct FlushParams {
    pub prefix: Option<String>,
}

/// Build the sidecar router
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/admission", post(admit))
        .route("/admin/counters", delete(flush_counters))
        .route("/admin/stats/:date/:hour", get(hourly_stats))
        .route("/health", get(health));

    if let Some(service) = state.prometheus.clone() {
        router = router.route("/metrics", get(metrics_handler).with_state(service));
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

async fn admit(
    State(state): State<AppState>,
    Json(body): Json<AdmissionBody>,
) -> Result<Response> {
    let request = AdmissionRequest::try_from(body)?;

    Ok(match state.decider.decide_request(&request).await {
        Verdict::Allow => Json(json!({ "verdict": "allow" })).into_response(),
        Verdict::Deny(denial) => denial_response(&denial),
    })
}

async fn flush_counters(
    State(state): State<AppState>,
    Query(params): Query<FlushParams>,
) -> Result<Json<Value>> {
    let prefix = params.prefix.unwrap_or_else(|| COUNTER_PREFIX.to_string());

    // Only the counter namespace may be cleared from here
    if !prefix.starts_with(COUNTER_PREFIX) {
        return Err(AdmissionError::InvalidRequest(format!(
            "Prefix must start with '{}'",
            COUNTER_PREFIX
        )));
    }

    let deleted = state.decider.flush(&prefix).await?;
    Ok(Json(json!({ "prefix": prefix, "deleted": deleted })))
}

async fn hourly_stats(
    State(state): State<AppState>,
    Path((date, hour)): Path<(String, u32)>,
) -> Result<Json<Value>> {
    let sink = state
        .decider
        .metrics_sink()
        .ok_or_else(|| AdmissionError::Internal("Metrics sink is not configured".to_string()))?;

    let aggregate = sink.hourly(&date, hour).await?.unwrap_or_default();
    let average_ms = if aggregate.count > 0 {
        aggregate.total_duration_ms as f64 / aggregate.count as f64
    } else {
        0.0
    };

    Ok(Json(json!({
        "date": date,
        "hour": hour,
        "count": aggregate.count,
        "total_duration_ms": aggregate.total_duration_ms,
        "slow_operation_count": aggregate.slow_operation_count,
        "average_duration_ms": average_ms,
    })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let degraded = state.decider.is_degraded();
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "degraded": degraded,
        "degraded_episodes": state.decider.degraded_episodes(),
    }))
}
