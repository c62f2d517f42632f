use crate::db::KlineStore;
use crate::error::Result;
use crate::models::{Interval, Kline, Series, TimeRange};
use csv::Writer;
use log::{debug, info};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Hands a fetched series to durable storage: the kline cache and CSV files
pub struct Exporter {
    store: Arc<dyn KlineStore>,
}

impl Exporter {
    pub fn new(store: Arc<dyn KlineStore>) -> Self {
        Self { store }
    }

    /// Merge `series` into the cache. An empty series is skipped.
    pub fn write_to_cache(&self, series: &Series, symbol: &str, interval: Interval) -> Result<usize> {
        if series.is_empty() {
            info!("No klines to save for {}/{}", symbol, interval);
            return Ok(0);
        }

        let count = self.store.write(series, symbol, interval)?;
        info!("{}/{}: {} K-lines saved to cache", symbol, interval, count);
        Ok(count)
    }

    /// Rows of `window` from the cache merged with the `fresh` rows in it, so
    /// runs that skip the cache write still export what they fetched.
    pub fn collect_window(
        &self,
        symbol: &str,
        interval: Interval,
        window: TimeRange,
        fresh: &Series,
    ) -> Result<Series> {
        let cached = self.store.range(symbol, interval, window)?;
        Ok(cached.merge(fresh.slice(window).iter().cloned()))
    }

    /// Write `window` to a CSV file at `path`. Returns `false` and writes
    /// nothing when the window has no rows.
    pub fn export_csv<P: AsRef<Path>>(
        &self,
        symbol: &str,
        interval: Interval,
        window: TimeRange,
        fresh: &Series,
        path: P,
    ) -> Result<bool> {
        let rows = self.collect_window(symbol, interval, window, fresh)?;
        if rows.is_empty() {
            info!("No {}/{} klines in {}, CSV not written", symbol, interval, window);
            return Ok(false);
        }

        Self::save_klines_to_csv(rows.as_slice(), path)?;
        Ok(true)
    }

    /// Save klines to a CSV file, replacing any existing file
    pub fn save_klines_to_csv<P: AsRef<Path>>(klines: &[Kline], path: P) -> Result<()> {
        let path = path.as_ref();
        debug!("Writing {} klines to {}", klines.len(), path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let mut writer = Writer::from_writer(file);

        writer.write_record(Kline::csv_headers())?;
        for kline in klines {
            writer.write_record(&kline.to_csv_record())?;
        }
        writer.flush()?;

        info!("Successfully wrote {} klines to {}", klines.len(), path.display());
        Ok(())
    }
}
