//! Dispatch pipeline configuration.
//!
//! TOML file with environment variable overrides. Every section defaults so
//! a bare `fc-dispatch-server` run uses the embedded queue and a local
//! SQLite job store.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use fc_common::PoolConfig;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSettings,
    pub queue: QueueSettings,
    pub router: RouterSettings,
    pub store: StoreSettings,
    pub standby: StandbySettings,
    pub http: HttpSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            queue: QueueSettings::default(),
            router: RouterSettings::default(),
            store: StoreSettings::default(),
            standby: StandbySettings::default(),
            http: HttpSettings::default(),
        }
    }
}

/// Dispatch scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    /// Pending poll cadence.
    pub poll_interval_seconds: u64,
    /// Jobs loaded per pending poll.
    pub batch_size: u32,
    /// Width of the group-dispatch semaphore.
    pub max_concurrent_groups: u32,
    /// Age at which QUEUED jobs are reset to PENDING.
    pub stale_queued_threshold_minutes: i64,
    pub stale_queued_poll_interval_seconds: u64,
    /// Pool used when a job names none.
    pub default_dispatch_pool_code: String,
    /// Webhook target used when a job names none.
    pub processing_endpoint: String,
    /// Key for dispatch auth tokens (HMAC over the job id).
    pub app_key: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 5,
            batch_size: 20,
            max_concurrent_groups: 10,
            stale_queued_threshold_minutes: 15,
            stale_queued_poll_interval_seconds: 60,
            default_dispatch_pool_code: "DISPATCH-POOL".to_string(),
            processing_endpoint: "http://localhost:8080/api/dispatch/process".to_string(),
            app_key: String::new(),
        }
    }
}

/// Broker backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// EMBEDDED, SQS, NATS or ACTIVEMQ.
    pub kind: String,
    /// Backend endpoint: SQS queue URL, NATS URL, or AMQP URI.
    pub queue_url: String,
    pub embedded_db_path: String,
    pub visibility_timeout_seconds: u32,
    /// Consumer loop count on the router side.
    pub connections: u32,
    pub nats_stream: String,
    pub nats_subject: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            kind: "EMBEDDED".to_string(),
            queue_url: String::new(),
            embedded_db_path: "./dispatch-queue.db".to_string(),
            visibility_timeout_seconds: 120,
            connections: 1,
            nats_stream: "DISPATCH".to_string(),
            nats_subject: "dispatch.jobs".to_string(),
        }
    }
}

/// Message router knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Secret for X-FlowCatalyst-SIGNATURE webhook signing; empty disables
    /// signing headers.
    pub signing_secret: String,
    pub topology_sync_interval_seconds: u64,
    pub pools: Vec<PoolSettings>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            topology_sync_interval_seconds: 300,
            pools: vec![PoolSettings {
                code: "DISPATCH-POOL".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
                queue_capacity: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub queue_capacity: Option<u32>,
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            code: settings.code.clone(),
            concurrency: settings.concurrency,
            rate_limit_per_minute: settings.rate_limit_per_minute,
            queue_capacity: settings.queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "./dispatch-jobs.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbySettings {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    pub lease_ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
    pub instance_id: String,
}

impl Default for StandbySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "fc:dispatch:leader".to_string(),
            lease_ttl_seconds: 30,
            refresh_interval_seconds: 10,
            instance_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub metrics_port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            metrics_port: 9090,
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.queue.kind.to_uppercase().as_str() {
            "EMBEDDED" => {}
            "SQS" | "NATS" | "ACTIVEMQ" => {
                if self.queue.queue_url.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "queue.queue_url is required for queue kind {}",
                        self.queue.kind
                    )));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown queue kind: {other}"
                )));
            }
        }

        for pool in &self.router.pools {
            if pool.concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Pool [{}] concurrency must be positive",
                    pool.code
                )));
            }
        }

        Ok(())
    }

    pub fn example_toml() -> String {
        r#"# FlowCatalyst dispatch pipeline configuration
# Environment variables override these settings (FC_DISPATCH_* keys).

[scheduler]
enabled = true
poll_interval_seconds = 5
batch_size = 20
max_concurrent_groups = 10
stale_queued_threshold_minutes = 15
stale_queued_poll_interval_seconds = 60
default_dispatch_pool_code = "DISPATCH-POOL"
processing_endpoint = "http://localhost:8080/api/dispatch/process"
app_key = ""

[queue]
kind = "EMBEDDED"  # EMBEDDED, SQS, NATS, ACTIVEMQ
queue_url = ""
embedded_db_path = "./dispatch-queue.db"
visibility_timeout_seconds = 120
connections = 1
nats_stream = "DISPATCH"
nats_subject = "dispatch.jobs"

[router]
signing_secret = ""
topology_sync_interval_seconds = 300

[[router.pools]]
code = "DISPATCH-POOL"
concurrency = 10
# rate_limit_per_minute = 600
# queue_capacity = 100

[store]
db_path = "./dispatch-jobs.db"

[standby]
enabled = false
redis_url = "redis://127.0.0.1:6379"
lock_key = "fc:dispatch:leader"
lease_ttl_seconds = 30
refresh_interval_seconds = 10
instance_id = ""

[http]
host = "0.0.0.0"
metrics_port = 9090
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.poll_interval_seconds, 5);
        assert_eq!(config.scheduler.batch_size, 20);
        assert_eq!(config.scheduler.max_concurrent_groups, 10);
        assert_eq!(config.scheduler.stale_queued_threshold_minutes, 15);
        assert_eq!(config.scheduler.default_dispatch_pool_code, "DISPATCH-POOL");
        assert_eq!(config.queue.kind, "EMBEDDED");
        assert_eq!(config.queue.embedded_db_path, "./dispatch-queue.db");
    }

    #[test]
    fn example_toml_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.pools.len(), 1);
        assert_eq!(config.router.pools[0].code, "DISPATCH-POOL");
    }

    #[test]
    fn remote_queue_requires_url() {
        let mut config = AppConfig::default();
        config.queue.kind = "SQS".to_string();
        assert!(config.validate().is_err());

        config.queue.queue_url = "https://sqs.example.com/q.fifo".to_string();
        assert!(config.validate().is_ok());
    }
}
