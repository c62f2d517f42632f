use crate::chunk_planner::{ChunkPlanner, DEFAULT_OVERLAP_INTERVALS};
use crate::error::{AppError, Result};
use crate::rate_limiter::RateLimiter;
use chrono::Utc;
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration constants
pub mod constants {
    /// Spot REST endpoint
    pub const DEFAULT_API_BASE_URL: &str = "https://api.binance.com";

    /// Maximum klines the source returns per request
    pub const DEFAULT_REQ_LIMIT: u32 = 1000;

    /// Request weight allowed per minute
    pub const DEFAULT_WEIGHT_BUDGET_PER_MINUTE: u32 = 1200;

    /// Weight charged per kline request
    pub const DEFAULT_WEIGHT_PER_CALL: u32 = 1;

    pub const DEFAULT_CONCURRENCY: usize = 8;

    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

    pub const DEFAULT_DB_PATH: &str = "./data/klines.db";

    pub const DEFAULT_OUTPUT_DIR: &str = "./downloaded";
}

use constants::*;

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_req_limit() -> u32 {
    DEFAULT_REQ_LIMIT
}

fn default_overlap_intervals() -> u32 {
    DEFAULT_OVERLAP_INTERVALS
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_weight_budget_per_minute() -> u32 {
    DEFAULT_WEIGHT_BUDGET_PER_MINUTE
}

fn default_weight_per_call() -> u32 {
    DEFAULT_WEIGHT_PER_CALL
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_write_cache() -> bool {
    true
}

/// Backfill configuration. Every field has a default, so a TOML file only needs
/// the keys it wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URL of the kline REST API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Optional proxy for all API requests, e.g. `socks5://127.0.0.1:1080`
    #[serde(default)]
    pub proxy: Option<String>,

    /// Per-request timeout enforced by the HTTP client
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum klines per request
    #[serde(default = "default_req_limit")]
    pub req_limit: u32,

    /// Candles shared by consecutive chunks
    #[serde(default = "default_overlap_intervals")]
    pub overlap_intervals: u32,

    /// Number of chunk fetches that may be in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Request weight the source allows per minute
    #[serde(default = "default_weight_budget_per_minute")]
    pub weight_budget_per_minute: u32,

    /// Request weight of one kline call
    #[serde(default = "default_weight_per_call")]
    pub weight_per_call: u32,

    /// SQLite cache location
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for CSV exports without an explicit path
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Persist fetched klines into the cache
    #[serde(default = "default_write_cache")]
    pub write_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            proxy: None,
            request_timeout_secs: default_request_timeout_secs(),
            req_limit: default_req_limit(),
            overlap_intervals: default_overlap_intervals(),
            concurrency: default_concurrency(),
            weight_budget_per_minute: default_weight_budget_per_minute(),
            weight_per_call: default_weight_per_call(),
            db_path: default_db_path(),
            output_dir: default_output_dir(),
            write_cache: default_write_cache(),
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.chunk_planner()?;
        self.rate_limiter()?;
        Ok(())
    }

    pub fn chunk_planner(&self) -> Result<ChunkPlanner> {
        ChunkPlanner::new(self.req_limit, self.overlap_intervals)
    }

    pub fn rate_limiter(&self) -> Result<RateLimiter> {
        RateLimiter::from_weights(self.weight_budget_per_minute, self.weight_per_call)
    }

    /// Ensure output directory exists
    pub fn ensure_output_dir(&self) -> Result<()> {
        if !self.output_dir.exists() {
            std::fs::create_dir_all(&self.output_dir)?;
        }
        Ok(())
    }

    /// Default CSV path for a symbol and interval, stamped with the current time
    pub fn get_output_path(&self, symbol: &str, interval: &str) -> PathBuf {
        let filename = format!(
            "{}_{}_{}_klines.csv",
            Utc::now().format("%Y-%m-%d_%H%M%S"),
            symbol,
            interval
        );

        self.output_dir.join(filename)
    }
}
