use super::service::{AdmissionDecider, AdmissionRequest};
use super::types::{Category, Denial, RawIdentity, SubjectClass, Verdict};
use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Identity established by the upstream authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    /// Raw tier name from the user record
    pub tier: String,
    /// Administrators and moderators skip admission entirely
    pub elevated: bool,
}

/// Marker extension for requests from trusted internal callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalCaller;

/// Middleware state: the shared decider plus the category of this route group
#[derive(Clone)]
pub struct AdmissionLayerState {
    decider: Arc<AdmissionDecider>,
    category: Category,
}

impl AdmissionLayerState {
    /// Bind a route group to a quota category
    pub fn new(decider: Arc<AdmissionDecider>, category: impl Into<Category>) -> Self {
        Self {
            decider,
            category: category.into(),
        }
    }
}

/// Axum middleware function for admission control
///
/// Install per route group with `axum::middleware::from_fn_with_state`.
pub async fn admission_middleware(
    State(state): State<AdmissionLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let admission = admission_request(&request, &state.category);

    match state.decider.decide_request(&admission).await {
        Verdict::Allow => next.run(request).await,
        Verdict::Deny(denial) => {
            debug!(
                category = %denial.category,
                subject = denial.subject_class.as_str(),
                "Rejecting request"
            );
            denial_response(&denial)
        }
    }
}

/// Build the decider input from request extensions
fn admission_request(request: &Request, category: &Category) -> AdmissionRequest {
    let extensions = request.extensions();
    let auth = extensions.get::<AuthContext>();

    let identity = match auth {
        Some(auth) => RawIdentity::Authenticated {
            user_id: auth.user_id.clone(),
            tier: auth.tier.clone(),
        },
        None => RawIdentity::Anonymous {
            ip: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        },
    };

    // Route templates keep the metrics label set small
    let endpoint = extensions
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    AdmissionRequest {
        identity,
        category: category.clone(),
        internal: extensions.get::<InternalCaller>().is_some(),
        elevated: auth.map_or(false, |auth| auth.elevated),
        endpoint: Some(endpoint),
    }
}

/// Create a 429 Too Many Requests response for a denial
pub fn denial_response(denial: &Denial) -> Response {
    let mut headers = HeaderMap::new();

    headers.insert("Retry-After", HeaderValue::from(denial.retry_after_secs));
    headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from(denial.quota.max_attempts),
    );
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(denial.retry_after_secs),
    );

    let code = match denial.subject_class {
        SubjectClass::Guest => "guest_rate_limited",
        SubjectClass::Free => "free_rate_limited",
        SubjectClass::Premium | SubjectClass::Internal => "premium_rate_limited",
    };

    let mut body = serde_json::json!({
        "error": "Rate limit exceeded",
        "code": code,
        "status": 429,
        "subject": denial.subject_class,
        "category": denial.category,
        "retry_after": denial.retry_after_secs,
        "limit": denial.quota,
    });
    if let Some(upgrade) = &denial.upgrade {
        body["upgrade"] = serde_json::json!(upgrade);
    }

    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        axum::Json(body),
    )
        .into_response()
}
