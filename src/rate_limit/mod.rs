//! Admission control module
//!
//! Decides for every inbound request whether it may proceed, using tiered
//! quotas, a process-local damper and a fleet-wide counter store:
//!
//! - **QuotaTable**: static (tier, category) → quota lookup
//! - **LocalDamper**: skips redundant remote checks within one second
//! - **CounterStore**: atomic increment-and-expire counters (Redis or in-memory)
//! - **AdmissionDecider**: ties the above together into a verdict
//!
//! # Features
//!
//! - Guest, free and premium quotas with per-category overrides
//! - Fail-open on counter store outages, with edge-triggered degraded logging
//! - `Retry-After` and tier-aware 429 bodies
//! - Per-route-group axum middleware
//!
//! # Example
//!
//! ```rust,no_run
//! use admission::config::AdmissionConfig;
//! use admission::rate_limit::{AdmissionDecider, Category, RawIdentity};
//!
//! #[tokio::main]
//! async fn main() {
//!     let decider = AdmissionDecider::from_config(&AdmissionConfig::default())
//!         .await
//!         .unwrap();
//!
//!     let identity = RawIdentity::Anonymous { ip: "203.0.113.7".to_string() };
//!     let verdict = decider
//!         .decide(&identity, &Category::new("media"), false, false)
//!         .await;
//!     assert!(verdict.is_allowed());
//! }
//! ```

pub mod local;
pub mod lua_scripts;
pub mod middleware;
pub mod quota;
pub mod redis;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use local::LocalDamper;
pub use middleware::{
    admission_middleware, denial_response, AdmissionLayerState, AuthContext, InternalCaller,
};
pub use quota::QuotaTable;
pub use self::redis::RedisStore;
pub use service::{AdmissionDecider, AdmissionRequest, Clock, SystemClock};
pub use store::{AggregateStore, CounterStore, HourlyAggregate, MemoryStore};
pub use types::{
    Category, DecisionPath, Denial, Quota, RawIdentity, Subject, SubjectClass, Tier, Verdict,
    COUNTER_PREFIX,
};
