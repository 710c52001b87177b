//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const ENV_BIND_ADDR: &str = "STORE_TRANSPORT_BIND_ADDR";
const ENV_DIAL_TIMEOUT: &str = "STORE_TRANSPORT_DIAL_TIMEOUT";
const ENV_MAX_IDLE: &str = "STORE_TRANSPORT_MAX_IDLE";
const ENV_REAP_INTERVAL: &str = "STORE_TRANSPORT_REAP_INTERVAL";
const ENV_LOG_LEVEL: &str = "STORE_TRANSPORT_LOG_LEVEL";

const MAX_TIMEOUT: Duration = Duration::from_secs(3600);
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it is missing
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        tracing::info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from environment variables over the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var(ENV_BIND_ADDR) {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}: {}", ENV_BIND_ADDR, bind_addr))?;
        }

        if let Some(timeout) = env_duration(ENV_DIAL_TIMEOUT)? {
            config.pool.dial_timeout = timeout;
        }

        if let Some(max_idle) = env_duration(ENV_MAX_IDLE)? {
            config.pool.max_idle = max_idle;
        }

        if let Some(interval) = env_duration(ENV_REAP_INTERVAL)? {
            config.pool.reap_interval = interval;
        }

        if let Ok(log_level) = std::env::var(ENV_LOG_LEVEL) {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => humantime::parse_duration(&value)
            .map(Some)
            .with_context(|| format!("Invalid {}: {}", name, value)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_pool_config()
            .with_context(|| "Pool configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        if self.server.shutdown_timeout > MAX_TIMEOUT {
            bail!("shutdown_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_pool_config(&self) -> Result<()> {
        let pool = &self.pool;

        if pool.dial_timeout.is_zero() {
            bail!("dial_timeout must be greater than 0");
        }

        if pool.dial_timeout > MAX_TIMEOUT {
            bail!("dial_timeout cannot exceed 1 hour");
        }

        if pool.max_idle.is_zero() {
            bail!("max_idle must be greater than 0");
        }

        if pool.reap_interval.is_zero() {
            bail!("reap_interval must be greater than 0");
        }

        if pool.reap_interval > MAX_TIMEOUT {
            bail!("reap_interval cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        dial_timeout: Option<u64>,
        max_idle: Option<u64>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(secs) = dial_timeout {
            self.pool.dial_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: dial timeout set to {}s", secs);
        }

        if let Some(secs) = max_idle {
            self.pool.max_idle = Duration::from_secs(secs);
            tracing::info!("CLI override: max idle set to {}s", secs);
        }
    }
}
