//! Configuration management for Tokenwarden.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TokenwardenError};
use crate::ratelimit::{Rate, DEFAULT_KEY_PREFIX};

/// Main configuration for the Tokenwarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenwardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-request rate limit
    #[serde(default)]
    pub requests: RequestLimitConfig,

    /// Response bandwidth limit
    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    /// Bucket storage
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            json_logs: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

/// Request limit: `rate` requests per `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimitConfig {
    #[serde(default = "default_request_rate")]
    pub rate: u32,

    #[serde(default = "default_request_window")]
    pub window_secs: u64,
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        Self {
            rate: default_request_rate(),
            window_secs: default_request_window(),
        }
    }
}

fn default_request_rate() -> u32 {
    60
}

fn default_request_window() -> u64 {
    60
}

impl RequestLimitConfig {
    pub fn to_rate(&self) -> Result<Rate> {
        Rate::new(self.rate, Duration::from_secs(self.window_secs))
            .map_err(|e| TokenwardenError::Config(format!("requests: {}", e)))
    }
}

/// Bandwidth limit: `rate` quanta of `quantum_bytes` per `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    #[serde(default = "default_bandwidth_rate")]
    pub rate: u32,

    #[serde(default = "default_bandwidth_window")]
    pub window_secs: u64,

    /// Bytes granted per token
    #[serde(default = "default_quantum_bytes")]
    pub quantum_bytes: usize,

    /// Wait between takes while the bucket is full
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            rate: default_bandwidth_rate(),
            window_secs: default_bandwidth_window(),
            quantum_bytes: default_quantum_bytes(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_bandwidth_rate() -> u32 {
    64
}

fn default_bandwidth_window() -> u64 {
    1
}

fn default_quantum_bytes() -> usize {
    1024
}

fn default_retry_interval_ms() -> u64 {
    10
}

impl BandwidthConfig {
    pub fn to_rate(&self) -> Result<Rate> {
        Rate::new(self.rate, Duration::from_secs(self.window_secs))
            .map_err(|e| TokenwardenError::Config(format!("bandwidth: {}", e)))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Which bucket store backs the limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Bucket storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the Redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for keys written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Fall back to an in-memory store when Redis fails
    #[serde(default = "default_memory_fallback")]
    pub memory_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            memory_fallback: default_memory_fallback(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_memory_fallback() -> bool {
    true
}

impl TokenwardenConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TokenwardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TokenwardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every section describes a usable setup.
    pub fn validate(&self) -> Result<()> {
        self.requests.to_rate()?;
        self.bandwidth.to_rate()?;

        if self.bandwidth.quantum_bytes == 0 {
            return Err(TokenwardenError::Config(
                "bandwidth: quantum_bytes must be positive".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(TokenwardenError::Config(
                "store: redis backend requires redis_url".to_string(),
            ));
        }

        Ok(())
    }
}
