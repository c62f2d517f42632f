use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents a Binance kline/candlestick
///
/// Field order matters: the derived ordering compares `open_time` first, which
/// is what [`Series`] relies on to sort and to pick a single survivor among rows
/// sharing an open time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kline {
    /// Kline open time
    pub open_time: i64,
    /// Open price
    pub open: String,
    /// High price
    pub high: String,
    /// Low price
    pub low: String,
    /// Close price
    pub close: String,
    /// Volume
    pub volume: String,
    /// Kline close time
    pub close_time: i64,
    /// Quote asset volume
    pub quote_asset_volume: String,
    /// Number of trades
    pub number_of_trades: i64,
    /// Taker buy base asset volume
    pub taker_buy_base_asset_volume: String,
    /// Taker buy quote asset volume
    pub taker_buy_quote_asset_volume: String,
    /// Ignore
    pub ignore: String,
}

impl Kline {
    /// Convert a raw kline array from Binance API to a Kline struct
    pub fn from_raw_kline(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 11 {
            return None;
        }

        // Prices normally arrive as strings but some mirrors send bare numbers
        let to_string = |v: &serde_json::Value| -> Option<String> {
            if v.is_string() {
                Some(v.as_str()?.to_string())
            } else if v.is_number() {
                Some(v.to_string())
            } else {
                None
            }
        };

        Some(Kline {
            open_time: raw[0].as_i64()?,
            open: to_string(&raw[1])?,
            high: to_string(&raw[2])?,
            low: to_string(&raw[3])?,
            close: to_string(&raw[4])?,
            volume: to_string(&raw[5])?,
            close_time: raw[6].as_i64()?,
            quote_asset_volume: to_string(&raw[7])?,
            number_of_trades: raw[8].as_i64()?,
            taker_buy_base_asset_volume: to_string(&raw[9])?,
            taker_buy_quote_asset_volume: to_string(&raw[10])?,
            ignore: raw.get(11).and_then(to_string).unwrap_or_default(),
        })
    }

    /// Convert to CSV record
    pub fn to_csv_record(&self) -> Vec<String> {
        vec![
            self.open_time.to_string(),
            self.open.clone(),
            self.high.clone(),
            self.low.clone(),
            self.close.clone(),
            self.volume.clone(),
            self.close_time.to_string(),
            self.quote_asset_volume.clone(),
            self.number_of_trades.to_string(),
            self.taker_buy_base_asset_volume.clone(),
            self.taker_buy_quote_asset_volume.clone(),
            self.ignore.clone(),
        ]
    }

    /// Get CSV headers
    pub fn csv_headers() -> [&'static str; 12] {
        [
            "open_time",
            "open",
            "high",
            "low",
            "close",
            "volume",
            "close_time",
            "quote_asset_volume",
            "number_of_trades",
            "taker_buy_base_asset_volume",
            "taker_buy_quote_asset_volume",
            "ignore",
        ]
    }
}

/// Kline intervals with a fixed duration.
///
/// Monthly candles (`1M`) have no fixed length and are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    OneSecond,
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    EightHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Interval::OneSecond,
        Interval::OneMinute,
        Interval::ThreeMinutes,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::TwoHours,
        Interval::FourHours,
        Interval::SixHours,
        Interval::EightHours,
        Interval::TwelveHours,
        Interval::OneDay,
        Interval::ThreeDays,
        Interval::OneWeek,
    ];

    /// Label used by the REST API and in table names
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneSecond => "1s",
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
        }
    }

    /// Candle duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        const SECOND: i64 = 1_000;
        const MINUTE: i64 = 60 * SECOND;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;

        match self {
            Interval::OneSecond => SECOND,
            Interval::OneMinute => MINUTE,
            Interval::ThreeMinutes => 3 * MINUTE,
            Interval::FiveMinutes => 5 * MINUTE,
            Interval::FifteenMinutes => 15 * MINUTE,
            Interval::ThirtyMinutes => 30 * MINUTE,
            Interval::OneHour => HOUR,
            Interval::TwoHours => 2 * HOUR,
            Interval::FourHours => 4 * HOUR,
            Interval::SixHours => 6 * HOUR,
            Interval::EightHours => 8 * HOUR,
            Interval::TwelveHours => 12 * HOUR,
            Interval::OneDay => DAY,
            Interval::ThreeDays => 3 * DAY,
            Interval::OneWeek => 7 * DAY,
        }
    }
}

impl FromStr for Interval {
    type Err = AppError;

    fn from_str(label: &str) -> Result<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == label)
            .ok_or_else(|| AppError::InvalidInterval(label.to_string()))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed range of candle open times, in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        debug_assert!(start_ms <= end_ms, "time range start after end");
        Self { start_ms, end_ms }
    }

    /// Number of candle open times inside the range
    pub fn candle_count(&self, interval: Interval) -> i64 {
        (self.end_ms - self.start_ms) / interval.duration_ms() + 1
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_ms, self.end_ms)
    }
}

/// Klines unique by open time, sorted ascending.
///
/// Every constructor deduplicates, so a `Series` can be built from overlapping
/// chunks in any order and always comes out the same.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Series {
    klines: Vec<Kline>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts and deduplicates by open time. Among rows sharing an open time the
    /// smallest under `Kline`'s ordering survives, independent of input order.
    pub fn from_rows(mut klines: Vec<Kline>) -> Self {
        klines.sort_unstable();
        klines.dedup_by_key(|k| k.open_time);
        Self { klines }
    }

    /// Merge another batch of rows into this series
    pub fn merge<I: IntoIterator<Item = Kline>>(self, rows: I) -> Self {
        let mut klines = self.klines;
        klines.extend(rows);
        Self::from_rows(klines)
    }

    pub fn len(&self) -> usize {
        self.klines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klines.is_empty()
    }

    /// Exact open time lookup
    pub fn contains(&self, open_time: i64) -> bool {
        self.get(open_time).is_some()
    }

    pub fn get(&self, open_time: i64) -> Option<&Kline> {
        self.klines
            .binary_search_by_key(&open_time, |k| k.open_time)
            .ok()
            .map(|idx| &self.klines[idx])
    }

    pub fn first(&self) -> Option<&Kline> {
        self.klines.first()
    }

    pub fn last(&self) -> Option<&Kline> {
        self.klines.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Kline> {
        self.klines.iter()
    }

    pub fn as_slice(&self) -> &[Kline] {
        &self.klines
    }

    pub fn into_vec(self) -> Vec<Kline> {
        self.klines
    }

    /// Rows whose open time falls inside `range`
    pub fn slice(&self, range: TimeRange) -> &[Kline] {
        let lo = self.klines.partition_point(|k| k.open_time < range.start_ms);
        let hi = self.klines.partition_point(|k| k.open_time <= range.end_ms);
        &self.klines[lo..hi.max(lo)]
    }
}

impl FromIterator<Kline> for Series {
    fn from_iter<I: IntoIterator<Item = Kline>>(iter: I) -> Self {
        Self::from_rows(iter.into_iter().collect())
    }
}

impl IntoIterator for Series {
    type Item = Kline;
    type IntoIter = std::vec::IntoIter<Kline>;

    fn into_iter(self) -> Self::IntoIter {
        self.klines.into_iter()
    }
}

impl<'a> IntoIterator for &'a Series {
    type Item = &'a Kline;
    type IntoIter = std::slice::Iter<'a, Kline>;

    fn into_iter(self) -> Self::IntoIter {
        self.klines.iter()
    }
}
