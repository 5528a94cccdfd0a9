use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "admission=info,tower_http=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
}

/// Initialize tracing/logging
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(format: LogFormat) {
    let result = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .with_current_span(false)
            .try_init(),
    };

    if result.is_ok() {
        tracing::info!(?format, "Tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_does_not_panic() {
        init_tracing(LogFormat::Compact);
        init_tracing(LogFormat::Json);
    }
}
