// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache configuration.
//!
//! Defaults cover a single-cluster deployment; [`CacheConfig::from_env`]
//! overlays the environment variables the deployment manifests set. Invalid
//! values fall back to the default with a warning rather than failing the
//! process.

use std::time::Duration;

use crate::error::CacheError;

/// Refresh interval for per-pod metric scraping, in milliseconds.
pub const ENV_POD_METRIC_REFRESH_INTERVAL_MS: &str = "AIBRIX_POD_METRIC_REFRESH_INTERVAL_MS";
/// Base URL of the external time-series backend. Unset disables external queries.
pub const ENV_PROMETHEUS_ENDPOINT: &str = "PROMETHEUS_ENDPOINT";
/// Optional basic-auth username for the external backend.
pub const ENV_PROMETHEUS_BASIC_AUTH_USERNAME: &str = "PROMETHEUS_BASIC_AUTH_USERNAME";
/// Optional basic-auth password for the external backend.
pub const ENV_PROMETHEUS_BASIC_AUTH_PASSWORD: &str = "PROMETHEUS_BASIC_AUTH_PASSWORD";

const DEFAULT_SCRAPE_INTERVAL_MS: u64 = 50;
const DEFAULT_POD_METRICS_PORT: u16 = 8000;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
const DEFAULT_TRACE_EXPIRY_SECS: u64 = 10 * 60;
const DEFAULT_PREFIX_BLOCK_SIZE: usize = 16;
const DEFAULT_PREFIX_TTL_SECS: u64 = 60 * 60;
const DEFAULT_PREFIX_EVICTION_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 3;

/// Basic-auth credentials for the external time-series backend.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Configuration for the cache and its background loops.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often the per-pod metric scrape ticker fires.
    pub scrape_interval: Duration,

    /// Per-pod HTTP timeout for one scrape. A pod slower than this is skipped
    /// for the cycle; its prior values are retained.
    pub scrape_timeout: Duration,

    /// Port of the inference engine's metrics endpoint on every pod.
    pub pod_metrics_port: u16,

    /// Base URL of the external time-series backend. `None` skips all
    /// external queries.
    pub prometheus_endpoint: Option<String>,

    /// Credentials for the external backend, if it requires them.
    pub prometheus_auth: Option<BasicAuth>,

    /// How often request traces are flushed to the external key/value store.
    pub flush_interval: Duration,

    /// TTL applied to every flushed trace document.
    pub trace_expiry: Duration,

    /// Number of tokens per prefix-cache window.
    pub prefix_block_size: usize,

    /// Age after which an untouched prefix block is evicted.
    pub prefix_ttl: Duration,

    /// How often the prefix eviction sweep runs.
    pub prefix_eviction_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            scrape_interval: Duration::from_millis(DEFAULT_SCRAPE_INTERVAL_MS),
            scrape_timeout: Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS),
            pod_metrics_port: DEFAULT_POD_METRICS_PORT,
            prometheus_endpoint: None,
            prometheus_auth: None,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            trace_expiry: Duration::from_secs(DEFAULT_TRACE_EXPIRY_SECS),
            prefix_block_size: DEFAULT_PREFIX_BLOCK_SIZE,
            prefix_ttl: Duration::from_secs(DEFAULT_PREFIX_TTL_SECS),
            prefix_eviction_interval: Duration::from_secs(DEFAULT_PREFIX_EVICTION_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = read_env(ENV_POD_METRIC_REFRESH_INTERVAL_MS) {
            match value.parse::<u64>() {
                Ok(ms) => config.scrape_interval = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    %value,
                    "invalid {ENV_POD_METRIC_REFRESH_INTERVAL_MS}, falling back to default"
                ),
            }
        }

        config.prometheus_endpoint = read_env(ENV_PROMETHEUS_ENDPOINT);

        let username = read_env(ENV_PROMETHEUS_BASIC_AUTH_USERNAME);
        let password = read_env(ENV_PROMETHEUS_BASIC_AUTH_PASSWORD);
        if let (Some(username), Some(password)) = (username, password) {
            config.prometheus_auth = Some(BasicAuth { username, password });
        }

        config
    }

    pub(crate) fn validate(&self) -> Result<(), CacheError> {
        if self.scrape_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "scrape interval must be non-zero".to_string(),
            ));
        }
        if self.flush_interval.as_secs() == 0 {
            return Err(CacheError::InvalidConfig(
                "flush interval must be at least one second".to_string(),
            ));
        }
        if self.prefix_block_size == 0 {
            return Err(CacheError::InvalidConfig(
                "prefix block size must be non-zero".to_string(),
            ));
        }
        if self.prometheus_auth.is_some() && self.prometheus_endpoint.is_none() {
            return Err(CacheError::InvalidConfig(
                "basic auth configured without an external metrics endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
