//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "failover.toml",
    "./config/config.toml",
    "/etc/failover/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    /// Replaces the process environment, for tests
    env_vars: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_vars: None,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            env_vars: None,
        }
    }

    /// Read overrides from `vars` instead of the process environment.
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    /// Load configuration from file (if found), apply environment overrides
    /// and validate the result.
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

    fn var(&self, key: &str) -> Option<String> {
        match &self.env_vars {
            Some(vars) => vars.get(key).cloned(),
            None => env::var(key).ok(),
        }
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Some(path) = self.var("FAILOVER_CONFIG") {
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

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // AMQP
        if let Some(val) = self.var("FAILOVER_AMQP_URI") {
            config.amqp.uri = val;
        }
        if let Some(val) = self.var("FAILOVER_AMQP_QUEUE") {
            config.amqp.queue_name = val;
        }
        if let Some(val) = self.var("FAILOVER_AMQP_PREFETCH") {
            if let Ok(count) = val.parse() {
                config.amqp.prefetch_count = count;
            }
        }
        if let Some(val) = self.var("FAILOVER_AMQP_RECONNECT_DELAY_SECS") {
            if let Ok(secs) = val.parse() {
                config.amqp.reconnect_delay_secs = secs;
            }
        }

        // MongoDB
        if let Some(val) = self.var("FAILOVER_MONGODB_URI") {
            config.mongodb.uri = val;
        }
        if let Some(val) = self.var("FAILOVER_MONGODB_DATABASE") {
            config.mongodb.database = val;
        }

        // HTTP
        if let Some(val) = self.var("FAILOVER_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Some(val) = self.var("FAILOVER_HEALTH_PORT") {
            if let Ok(port) = val.parse() {
                config.health.port = port;
            }
        }
        if let Some(val) = self.var("FAILOVER_MEMORY_THRESHOLD_PERCENT") {
            if let Ok(pct) = val.parse() {
                config.health.memory_threshold_percent = pct;
            }
        }

        // Worker pool
        if let Some(val) = self.var("FAILOVER_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.worker_pool.workers = workers;
            }
        }
        if let Some(val) = self.var("FAILOVER_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                config.worker_pool.capacity = capacity;
            }
        }

        // Retry
        if let Some(val) = self.var("FAILOVER_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        // Shutdown
        if let Some(val) = self.var("FAILOVER_SHUTDOWN_CONSUMER_SECS") {
            if let Ok(secs) = val.parse() {
                config.shutdown.consumer_deadline_secs = secs;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
