use crate::error::{AdmissionError, Result};
use crate::rate_limit::quota::{default_free, default_guest, default_premium, QuotaSet, QuotaTable};
use crate::rate_limit::types::Category;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides, e.g. `ADMISSION__STORE__URL`
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main admission configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-tier quota tables
    #[serde(default)]
    pub quotas: QuotasConfig,
    /// Local damper
    #[serde(default)]
    pub damper: DamperConfig,
    /// Slow-path metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Categories that deny instead of allowing while the store is down
    #[serde(default)]
    pub fail_closed_categories: Vec<String>,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Counter store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Redis connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Per-call budget on the hot path (in milliseconds)
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// How often the in-memory backend drops expired counters (in seconds)
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

/// Quota tables, one category map per subject class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotasConfig {
    #[serde(default = "default_guest")]
    pub guest: QuotaSet,
    #[serde(default = "default_free")]
    pub free: QuotaSet,
    #[serde(default = "default_premium")]
    pub premium: QuotaSet,
}

/// Local damper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local burst below which remote checks are skipped; derived when unset
    #[serde(default)]
    pub burst_threshold: Option<u32>,
    /// Maximum tracked (subject, category) pairs
    #[serde(default = "default_damper_max_entries")]
    pub max_entries: u64,
    /// Idle entries are dropped after this many seconds
    #[serde(default = "default_damper_idle_secs")]
    pub idle_secs: u64,
}

/// Slow-path metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Decisions slower than this are added to the hourly aggregate
    #[serde(default = "default_record_threshold_ms")]
    pub record_threshold_ms: u64,
    /// Decisions slower than this also count as slow operations
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Lifetime of each hourly aggregate
    #[serde(default = "default_aggregate_ttl_secs")]
    pub aggregate_ttl_secs: u64,
    /// Budget for one aggregate write (in milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Aggregate writes allowed in flight; further samples are dropped
    #[serde(default = "default_max_in_flight_writes")]
    pub max_in_flight_writes: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_purge_interval_secs() -> u64 {
    30
}

fn default_damper_max_entries() -> u64 {
    100_000
}

fn default_damper_idle_secs() -> u64 {
    60
}

fn default_record_threshold_ms() -> u64 {
    10
}

fn default_slow_threshold_ms() -> u64 {
    100
}

fn default_aggregate_ttl_secs() -> u64 {
    48 * 3600
}

fn default_write_timeout_ms() -> u64 {
    100
}

fn default_max_in_flight_writes() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            timeout_ms: default_store_timeout_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            guest: default_guest(),
            free: default_free(),
            premium: default_premium(),
        }
    }
}

impl Default for DamperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst_threshold: None,
            max_entries: default_damper_max_entries(),
            idle_secs: default_damper_idle_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            record_threshold_ms: default_record_threshold_ms(),
            slow_threshold_ms: default_slow_threshold_ms(),
            aggregate_ttl_secs: default_aggregate_ttl_secs(),
            write_timeout_ms: default_write_timeout_ms(),
            max_in_flight_writes: default_max_in_flight_writes(),
        }
    }
}

impl QuotasConfig {
    /// Build the immutable lookup table
    pub fn quota_table(&self) -> Result<QuotaTable> {
        QuotaTable::new(&self.guest, &self.free, &self.premium)
    }
}

impl AdmissionConfig {
    /// Load configuration from a YAML file, with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AdmissionError::Config(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdmissionError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let table = self.quotas.quota_table()?;

        for name in &self.fail_closed_categories {
            Category::parse(name).map_err(|e| {
                AdmissionError::Config(format!("Invalid fail-closed category: {}", e))
            })?;
        }

        if let Some(threshold) = self.damper.burst_threshold {
            if threshold >= table.min_max_attempts() {
                return Err(AdmissionError::Config(format!(
                    "Damper burst_threshold ({}) must be below the smallest max_attempts ({})",
                    threshold,
                    table.min_max_attempts()
                )));
            }
        }

        if self.damper.enabled && self.damper.max_entries == 0 {
            return Err(AdmissionError::Config(
                "Damper max_entries must be > 0".to_string(),
            ));
        }

        if self.store.timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "Store timeout must be > 0".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Memory && self.store.purge_interval_secs == 0 {
            return Err(AdmissionError::Config(
                "Store purge_interval_secs must be > 0".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis
            && self.store.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(AdmissionError::Config(
                "Redis store requires a url".to_string(),
            ));
        }

        if self.metrics.write_timeout_ms == 0 || self.metrics.max_in_flight_writes == 0 {
            return Err(AdmissionError::Config(
                "Metrics write_timeout_ms and max_in_flight_writes must be > 0".to_string(),
            ));
        }

        if self.metrics.aggregate_ttl_secs == 0 {
            return Err(AdmissionError::Config(
                "Metrics aggregate TTL must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Categories configured to fail closed
    pub fn fail_closed(&self) -> Vec<Category> {
        self.fail_closed_categories
            .iter()
            .map(|name| Category::new(name.as_str()))
            .collect()
    }
}
