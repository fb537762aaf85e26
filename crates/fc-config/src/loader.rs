//! Configuration loader: file discovery plus environment overrides.

use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::{AppConfig, ConfigError};

const CONFIG_PATHS: &[&str] = &[
    "dispatch.toml",
    "config.toml",
    "./config/dispatch.toml",
    "/etc/flowcatalyst/dispatch.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("FC_DISPATCH_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Scheduler
        if let Ok(val) = env::var("FC_DISPATCH_SCHEDULER_ENABLED") {
            config.scheduler.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("FC_DISPATCH_POLL_INTERVAL_SECONDS") {
            if let Ok(interval) = val.parse() {
                config.scheduler.poll_interval_seconds = interval;
            }
        }
        if let Ok(val) = env::var("FC_DISPATCH_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.scheduler.batch_size = size;
            }
        }
        if let Ok(val) = env::var("FC_DISPATCH_MAX_CONCURRENT_GROUPS") {
            if let Ok(groups) = val.parse() {
                config.scheduler.max_concurrent_groups = groups;
            }
        }
        if let Ok(val) = env::var("FC_DISPATCH_STALE_QUEUED_THRESHOLD_MINUTES") {
            if let Ok(minutes) = val.parse() {
                config.scheduler.stale_queued_threshold_minutes = minutes;
            }
        }
        if let Ok(val) = env::var("FC_DISPATCH_DEFAULT_POOL_CODE") {
            config.scheduler.default_dispatch_pool_code = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_PROCESSING_ENDPOINT") {
            config.scheduler.processing_endpoint = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_APP_KEY") {
            config.scheduler.app_key = val;
        }

        // Queue
        if let Ok(val) = env::var("FC_DISPATCH_QUEUE_TYPE") {
            config.queue.kind = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_QUEUE_URL") {
            config.queue.queue_url = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_EMBEDDED_DB_PATH") {
            config.queue.embedded_db_path = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_QUEUE_CONNECTIONS") {
            if let Ok(connections) = val.parse() {
                config.queue.connections = connections;
            }
        }

        // Router
        if let Ok(val) = env::var("FC_DISPATCH_SIGNING_SECRET") {
            config.router.signing_secret = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_TOPOLOGY_SYNC_INTERVAL") {
            if let Ok(interval) = val.parse() {
                config.router.topology_sync_interval_seconds = interval;
            }
        }

        // Store
        if let Ok(val) = env::var("FC_DISPATCH_STORE_DB_PATH") {
            config.store.db_path = val;
        }

        // Standby
        if let Ok(val) = env::var("FC_DISPATCH_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("FC_DISPATCH_STANDBY_REDIS_URL") {
            config.standby.redis_url = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }
        if let Ok(val) = env::var("FC_DISPATCH_STANDBY_INSTANCE_ID") {
            config.standby.instance_id = val;
        }

        // HTTP
        if let Ok(val) = env::var("FC_DISPATCH_METRICS_PORT") {
            if let Ok(port) = val.parse() {
                config.http.metrics_port = port;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
