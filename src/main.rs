use admission::{config::AdmissionConfig, init_admission, init_tracing};
use anyhow::Context;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/admission.yaml".to_string());

    // Load configuration; ADMISSION__* environment variables override the file
    let config = AdmissionConfig::load(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: admission [config_file])",
            config_path
        )
    })?;

    init_tracing(config.logging.format);

    init_admission(config)
        .await
        .context("Admission service error")?;

    Ok(())
}
