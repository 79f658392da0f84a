// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub jobs: JobsConfig,
    pub lease: LeaseConfig,
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_run_migrations() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub command_subject: String,
    pub consumer_name: String,
}

/// Scheduling knobs of the job service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Forward horizon within which jobs get a live timer
    pub chunk_window_minutes: u64,
    /// Arm jobs whose fire time is already in the past instead of rejecting them
    #[serde(default)]
    pub force_execute_expired_jobs: bool,
    /// Reconciliation period while the command feed is degraded
    pub poll_interval_seconds: u64,
    /// Jobs scheduled in parallel during one reconciliation pass
    pub reconcile_concurrency: usize,
    /// Retry budget given to jobs created without one
    pub default_retries: u32,
    pub retry: RetryConfig,
}

impl JobsConfig {
    pub fn chunk_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.chunk_window_minutes as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategyKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub strategy: RetryStrategyKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_factor: f64,
}

/// Lease (duty slot ownership) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub slot: String,
    pub heartbeat_interval_seconds: u64,
    pub expiry_seconds: u64,
}

impl LeaseConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Request timeout used when a job carries no execution timeout
    pub default_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Start with built-in defaults
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.backend == StorageBackend::Postgres {
            if self.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }

        if self.jobs.chunk_window_minutes == 0 {
            return Err("Jobs chunk_window_minutes must be greater than 0".to_string());
        }
        if self.jobs.poll_interval_seconds == 0 {
            return Err("Jobs poll_interval_seconds must be greater than 0".to_string());
        }
        if self.jobs.reconcile_concurrency == 0 {
            return Err("Jobs reconcile_concurrency must be greater than 0".to_string());
        }
        if self.jobs.retry.max_delay_ms < self.jobs.retry.base_delay_ms {
            return Err("Retry max_delay_ms must not be below base_delay_ms".to_string());
        }

        if self.lease.slot.is_empty() {
            return Err("Lease slot cannot be empty".to_string());
        }
        if self.lease.heartbeat_interval_seconds == 0 {
            return Err("Lease heartbeat_interval_seconds must be greater than 0".to_string());
        }
        if self.lease.expiry_seconds <= self.lease.heartbeat_interval_seconds {
            return Err(
                "Lease expiry_seconds must be greater than heartbeat_interval_seconds".to_string(),
            );
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Postgres,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/jobs_service".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                run_migrations: true,
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "JOB_COMMANDS".to_string(),
                command_subject: "jobs.commands.>".to_string(),
                consumer_name: "jobs-service".to_string(),
            },
            jobs: JobsConfig {
                chunk_window_minutes: 10,
                force_execute_expired_jobs: false,
                poll_interval_seconds: 60,
                reconcile_concurrency: 16,
                default_retries: 3,
                retry: RetryConfig {
                    strategy: RetryStrategyKind::Fixed,
                    base_delay_ms: 1000,
                    max_delay_ms: 60_000,
                    jitter_factor: 0.0,
                },
            },
            lease: LeaseConfig {
                slot: "jobs-service-reconciler".to_string(),
                heartbeat_interval_seconds: 10,
                expiry_seconds: 30,
            },
            executor: ExecutorConfig {
                default_timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}
