pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod server;

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, Result};
use crate::metrics::MetricsService;
use crate::rate_limit::AdmissionDecider;
use crate::server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub use crate::observability::init_tracing;

/// Initialize the admission sidecar server
pub async fn init_admission(config: AdmissionConfig) -> Result<()> {
    // Validate configuration
    config.validate()?;

    info!("Starting admission service");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    let decider = Arc::new(AdmissionDecider::from_config(&config).await?);
    if !config.fail_closed_categories.is_empty() {
        info!(categories = ?config.fail_closed_categories, "Fail-closed categories");
    }

    let prometheus = match MetricsService::new() {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(error = %e, "Prometheus exporter disabled");
            None
        }
    };

    let app = app(AppState::new(decider, prometheus));

    // Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(AdmissionError::Io)?;

    info!("Admission service ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| AdmissionError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
