//! Historical kline backfill: plans a requested window into request-sized
//! chunks, skips what the local cache already holds, fetches the rest under a
//! shared rate limit and exports the merged series.

pub mod api;
pub mod cache_index;
pub mod chunk_planner;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod models;
pub mod rate_limiter;
pub mod storage;
pub mod time_range;
pub mod utils;

pub use api::{BinanceApi, KlineSource};
pub use chunk_planner::ChunkPlanner;
pub use config::Config;
pub use db::{Database, KlineStore};
pub use downloader::{Downloader, FetchCoordinator, FetchOutcome, PlanResult};
pub use error::{AppError, Result};
pub use models::{Interval, Kline, Series, TimeRange};
pub use rate_limiter::RateLimiter;
pub use storage::Exporter;
