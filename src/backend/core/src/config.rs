//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Generation API configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Payment provider configuration
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Settings for the claim loop and the stalled-job recovery sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between claim ticks
    #[serde(with = "humantime_serde", default = "default_claim_interval")]
    pub claim_interval: Duration,

    /// Maximum jobs claimed per tick
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: i64,

    /// Interval between recovery sweeps
    #[serde(with = "humantime_serde", default = "default_recovery_interval")]
    pub recovery_interval: Duration,

    /// How long a processing job may go without a heartbeat before the
    /// sweep returns it to pending
    #[serde(with = "humantime_serde", default = "default_processing_timeout")]
    pub processing_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_interval: default_claim_interval(),
            claim_batch_size: default_claim_batch_size(),
            recovery_interval: default_recovery_interval(),
            processing_timeout: default_processing_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrently executing jobs
    #[serde(default = "default_job_concurrency")]
    pub job_concurrency: usize,

    /// Maximum concurrent generation calls within a single job
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,

    /// Interval between heartbeat touches while a job is processing
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// How long shutdown waits for in-flight jobs to drain
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_concurrency: default_job_concurrency(),
            unit_concurrency: default_unit_concurrency(),
            heartbeat_interval: default_heartbeat_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of the generation API
    #[serde(default = "default_generation_url")]
    pub base_url: String,

    /// API key for the generation API
    #[serde(default)]
    pub api_key: String,

    /// Token bucket capacity shared by all outbound generation calls
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Tokens refilled per refill interval
    #[serde(default = "default_rate_capacity")]
    pub rate_refill: u32,

    /// Token bucket refill interval
    #[serde(with = "humantime_serde", default = "default_rate_interval")]
    pub rate_interval: Duration,

    /// Hard timeout for a single generation call
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    pub call_timeout: Duration,

    /// Maximum attempts per unit (first call + retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Retry backoff cap
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_generation_url(),
            api_key: String::new(),
            rate_capacity: default_rate_capacity(),
            rate_refill: default_rate_capacity(),
            rate_interval: default_rate_interval(),
            call_timeout: default_call_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Upload endpoint of the object storage service
    #[serde(default = "default_storage_url")]
    pub upload_url: String,

    /// Access token for the storage service
    #[serde(default)]
    pub access_token: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_url: default_storage_url(),
            access_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// Base URL of the payment provider API
    #[serde(default = "default_payment_url")]
    pub base_url: String,

    /// Provider name recorded on orders
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Merchant identifier at the provider
    #[serde(default)]
    pub merchant_id: String,

    /// Shared secret for webhook signature verification (hex)
    #[serde(default)]
    pub webhook_secret: String,

    /// Key serial the provider includes with each notification
    #[serde(default)]
    pub webhook_key_serial: String,

    /// AES-256 key for notification payload decryption (hex, 32 bytes)
    #[serde(default)]
    pub notification_key: String,

    /// Callback URL handed to the provider at order creation
    #[serde(default)]
    pub callback_url: String,

    /// How long a created order stays payable
    #[serde(with = "humantime_serde", default = "default_order_ttl")]
    pub order_ttl: Duration,

    /// Interval between expiry sweeps
    #[serde(with = "humantime_serde", default = "default_expiry_interval")]
    pub expiry_interval: Duration,

    /// Maximum orders closed per expiry sweep
    #[serde(default = "default_expiry_batch_size")]
    pub expiry_batch_size: i64,

    /// Webhook timestamp freshness window
    #[serde(with = "humantime_serde", default = "default_replay_window")]
    pub replay_window: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            base_url: default_payment_url(),
            provider_name: default_provider_name(),
            merchant_id: String::new(),
            webhook_secret: String::new(),
            webhook_key_serial: String::new(),
            notification_key: String::new(),
            callback_url: String::new(),
            order_ttl: default_order_ttl(),
            expiry_interval: default_expiry_interval(),
            expiry_batch_size: default_expiry_batch_size(),
            replay_window: default_replay_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_claim_interval() -> Duration { Duration::from_secs(5) }
fn default_claim_batch_size() -> i64 { 20 }
fn default_recovery_interval() -> Duration { Duration::from_secs(30) }
fn default_processing_timeout() -> Duration { Duration::from_secs(600) }
fn default_job_concurrency() -> usize { 5 }
fn default_unit_concurrency() -> usize { 4 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(300) }
fn default_drain_timeout() -> Duration { Duration::from_secs(30) }
fn default_generation_url() -> String { "https://api.image-provider.example".to_string() }
fn default_rate_capacity() -> u32 { 20 }
fn default_rate_interval() -> Duration { Duration::from_secs(1) }
fn default_call_timeout() -> Duration { Duration::from_secs(120) }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> Duration { Duration::from_secs(1) }
fn default_max_backoff() -> Duration { Duration::from_secs(30) }
fn default_storage_url() -> String { "https://storage.example/upload".to_string() }
fn default_payment_url() -> String { "https://pay.example/api".to_string() }
fn default_provider_name() -> String { "unipay".to_string() }
fn default_order_ttl() -> Duration { Duration::from_secs(600) }
fn default_expiry_interval() -> Duration { Duration::from_secs(60) }
fn default_expiry_batch_size() -> i64 { 50 }
fn default_replay_window() -> Duration { Duration::from_secs(300) }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ATELIER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ATELIER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults_match_sweep_contract() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.claim_interval, Duration::from_secs(5));
        assert_eq!(cfg.recovery_interval, Duration::from_secs(30));
        assert_eq!(cfg.processing_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_generation_defaults() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.rate_capacity, 20);
        assert_eq!(cfg.call_timeout, Duration::from_secs(120));
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn test_config_from_toml_file() {
        let toml = r#"
            [database]
            url = "postgres://localhost/atelier"

            [worker]
            job_concurrency = 8
            heartbeat_interval = "2m"
        "#;
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.database.url, "postgres://localhost/atelier");
        assert_eq!(cfg.worker.job_concurrency, 8);
        assert_eq!(cfg.worker.heartbeat_interval, Duration::from_secs(120));
        // Untouched sections fall back to defaults.
        assert_eq!(cfg.scheduler.claim_batch_size, 20);
    }
}
