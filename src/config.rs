use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::time::Duration;

use crate::error::RegistrarError;
use crate::transport::DEFAULT_ENDPOINT;
use crate::window::RateLimit;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    pub window_ms: u64,
    pub capacity: u32,
    // Absent means callers wait for as many windows as it takes
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl LimiterConfig {
    pub fn rate_limit(&self) -> Result<RateLimit, RegistrarError> {
        RateLimit::new(Duration::from_millis(self.window_ms), self.capacity)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub endpoint_url: String,
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enable: bool,
    pub bind_addr: String,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bind_addr: "127.0.0.1:9100".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .with_context(|| "Failed to parse configuration")?;

    // Reject a bad budget at startup rather than on first use
    config.limiter.rate_limit()?;

    Ok(config)
}

pub fn load_config() -> Result<Config> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let config_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    parse_config(&config_content)
}
