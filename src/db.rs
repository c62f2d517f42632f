use crate::error::{AppError, Result};
use crate::models::{Interval, Kline, Series, TimeRange};
use log::{debug, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Local persistence for klines, one series per (symbol, interval).
///
/// A pair with nothing stored reads as an empty series, never as an error.
pub trait KlineStore: Send + Sync {
    /// Full cached series
    fn read_series(&self, symbol: &str, interval: Interval) -> Result<Series>;

    /// Whether a kline with exactly this open time is cached
    fn point_exists(&self, symbol: &str, interval: Interval, open_time: i64) -> Result<bool>;

    /// Cached klines with open times inside `range`
    fn range(&self, symbol: &str, interval: Interval, range: TimeRange) -> Result<Series>;

    /// Merge `series` into the cache, replacing rows with the same open time.
    /// Returns the number of rows written.
    fn write(&self, series: &Series, symbol: &str, interval: Interval) -> Result<usize>;
}

const KLINE_COLUMNS: &str = "open_time, open, high, low, close, volume, close_time, \
     quote_asset_volume, number_of_trades, taker_buy_base_asset_volume, \
     taker_buy_quote_asset_volume, ignore";

/// SQLite backed kline cache
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) the database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;"));
        let pool = Pool::new(manager).map_err(|e| {
            AppError::DatabaseError(format!("Failed to create connection pool: {}", e))
        })?;

        info!("Database initialized at {}", db_path.display());
        Ok(Self { pool })
    }

    fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))
    }

    /// Table name for a pair, e.g. `k_btcusdt_1m`. Only alphanumerics survive,
    /// so the name is always safe to splice into SQL.
    fn table_name(symbol: &str, interval: Interval) -> String {
        let symbol_lower: String = symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("k_{}_{}", symbol_lower, interval.as_str())
    }

    fn table_exists(&self, table_name: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                params![table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn ensure_symbol_table(&self, table_name: &str) -> Result<()> {
        let conn = self.get_connection()?;

        let create_table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                open_time INTEGER PRIMARY KEY,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                close_time INTEGER NOT NULL,
                quote_asset_volume TEXT NOT NULL,
                number_of_trades INTEGER NOT NULL,
                taker_buy_base_asset_volume TEXT NOT NULL,
                taker_buy_quote_asset_volume TEXT NOT NULL,
                ignore TEXT
            )",
            table_name
        );

        conn.execute(&create_table_sql, []).map_err(|e| {
            AppError::DatabaseError(format!("Failed to create table {}: {}", table_name, e))
        })?;
        Ok(())
    }

    fn row_to_kline(row: &Row<'_>) -> rusqlite::Result<Kline> {
        Ok(Kline {
            open_time: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
            close_time: row.get(6)?,
            quote_asset_volume: row.get(7)?,
            number_of_trades: row.get(8)?,
            taker_buy_base_asset_volume: row.get(9)?,
            taker_buy_quote_asset_volume: row.get(10)?,
            ignore: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        })
    }

    fn query_klines(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Series> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(sql)?;
        let klines = stmt
            .query_map(args, Self::row_to_kline)?
            .collect::<rusqlite::Result<Vec<Kline>>>()?;
        Ok(Series::from_rows(klines))
    }

    /// Number of cached klines for a pair
    pub fn get_kline_count(&self, symbol: &str, interval: Interval) -> Result<i64> {
        let table_name = Self::table_name(symbol, interval);
        if !self.table_exists(&table_name)? {
            return Ok(0);
        }

        let conn = self.get_connection()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Earliest and latest cached open time, if anything is cached
    pub fn get_cached_bounds(&self, symbol: &str, interval: Interval) -> Result<Option<(i64, i64)>> {
        let table_name = Self::table_name(symbol, interval);
        if !self.table_exists(&table_name)? {
            return Ok(None);
        }

        let conn = self.get_connection()?;
        let bounds: (Option<i64>, Option<i64>) = conn.query_row(
            &format!("SELECT MIN(open_time), MAX(open_time) FROM {}", table_name),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(match bounds {
            (Some(earliest), Some(latest)) => Some((earliest, latest)),
            _ => None,
        })
    }
}

impl KlineStore for Database {
    fn read_series(&self, symbol: &str, interval: Interval) -> Result<Series> {
        let table_name = Self::table_name(symbol, interval);
        if !self.table_exists(&table_name)? {
            debug!("No cached klines for {}/{}", symbol, interval);
            return Ok(Series::new());
        }

        let sql = format!("SELECT {} FROM {} ORDER BY open_time", KLINE_COLUMNS, table_name);
        let series = self.query_klines(&sql, &[])?;
        debug!("Read {} cached klines for {}/{}", series.len(), symbol, interval);
        Ok(series)
    }

    fn point_exists(&self, symbol: &str, interval: Interval, open_time: i64) -> Result<bool> {
        let table_name = Self::table_name(symbol, interval);
        if !self.table_exists(&table_name)? {
            return Ok(false);
        }

        let conn = self.get_connection()?;
        let exists = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE open_time = ?", table_name),
                params![open_time],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn range(&self, symbol: &str, interval: Interval, range: TimeRange) -> Result<Series> {
        let table_name = Self::table_name(symbol, interval);
        if !self.table_exists(&table_name)? {
            return Ok(Series::new());
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE open_time >= ? AND open_time <= ? ORDER BY open_time",
            KLINE_COLUMNS, table_name
        );
        self.query_klines(&sql, &[&range.start_ms, &range.end_ms])
    }

    fn write(&self, series: &Series, symbol: &str, interval: Interval) -> Result<usize> {
        if series.is_empty() {
            return Ok(0);
        }

        let table_name = Self::table_name(symbol, interval);
        self.ensure_symbol_table(&table_name)?;

        let mut conn = self.get_connection()?;
        let tx = conn.transaction().map_err(|e| {
            AppError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        let mut count = 0;
        {
            let insert_sql = format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                table_name, KLINE_COLUMNS
            );
            let mut stmt = tx.prepare(&insert_sql)?;

            for kline in series {
                count += stmt.execute(params![
                    kline.open_time,
                    kline.open,
                    kline.high,
                    kline.low,
                    kline.close,
                    kline.volume,
                    kline.close_time,
                    kline.quote_asset_volume,
                    kline.number_of_trades,
                    kline.taker_buy_base_asset_volume,
                    kline.taker_buy_quote_asset_volume,
                    kline.ignore,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

        debug!("Saved {} klines into {}", count, table_name);
        Ok(count)
    }
}
