use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Interval, Kline};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Where klines come from.
///
/// Any error returned by an implementation is treated as a failed chunk; the
/// engine never retries on its own.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Klines with open times in `[start_ms, end_ms]`, at most `limit` of them
    async fn fetch_chunk(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Kline>>;

    /// Open time of the first kline the source has for this pair, `None` if it
    /// has none at all
    async fn earliest_available(&self, symbol: &str, interval: Interval) -> Result<Option<i64>>;
}

/// Binance spot REST client
#[derive(Clone, Debug)]
pub struct BinanceApi {
    client: Client,
    api_url: String,
}

impl BinanceApi {
    /// Create a new API client from the configured endpoint, proxy and timeout
    pub fn new(config: &Config) -> Result<Self> {
        let mut client_builder = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10));

        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                AppError::ConfigError(format!("Invalid proxy '{}': {}", proxy_url, e))
            })?;
            info!("Using proxy: {}", proxy_url);
            client_builder = client_builder.proxy(proxy);
        }

        let client = client_builder.build()?;
        let api_url = config.api_base_url.trim_end_matches('/').to_string();
        debug!("Initialized API client for {}", api_url);

        Ok(Self { client, api_url })
    }

    async fn get_klines(&self, params: &[(&str, String)]) -> Result<Vec<Kline>> {
        let url = format!("{}/api/v3/klines", self.api_url);
        debug!("GET {} {:?}", url, params);

        let response = self.client.get(&url).query(params).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            error!("Kline request failed: {} - {}", status, text);
            return Err(AppError::ApiError(format!(
                "Kline request failed: {} - {}",
                status, text
            )));
        }

        let raw_klines: Vec<Vec<Value>> = response.json().await?;
        let klines = raw_klines
            .iter()
            .filter_map(|raw| Kline::from_raw_kline(raw))
            .collect::<Vec<Kline>>();

        if klines.len() != raw_klines.len() {
            return Err(AppError::DataError(format!(
                "Failed to parse some klines: parsed {}/{}",
                klines.len(),
                raw_klines.len()
            )));
        }

        Ok(klines)
    }
}

#[async_trait]
impl KlineSource for BinanceApi {
    async fn fetch_chunk(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Kline>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", limit.to_string()),
        ];
        let klines = self.get_klines(&params).await?;
        debug!(
            "Received {} klines for {}/{} from {} to {}",
            klines.len(),
            symbol,
            interval,
            start_ms,
            end_ms
        );
        Ok(klines)
    }

    async fn earliest_available(&self, symbol: &str, interval: Interval) -> Result<Option<i64>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("startTime", "0".to_string()),
            ("limit", "1".to_string()),
        ];
        let klines = self.get_klines(&params).await?;

        let earliest = klines.first().map(|k| k.open_time);
        if earliest.is_none() {
            warn!("Source has no {} klines for {}", interval, symbol);
        }
        Ok(earliest)
    }
}
