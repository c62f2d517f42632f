//! Resolving the requested window into fetchable bounds.
//!
//! All functions take "now" explicitly so callers (and tests) control the clock.

use crate::models::{Interval, TimeRange};
use log::{info, warn};

/// Fill in omitted bounds with a span of exactly `req_limit` candles, anchored
/// at whichever bound is present, or at `now_ms` if neither is.
pub fn fill_defaults(
    start: Option<i64>,
    end: Option<i64>,
    req_limit: u32,
    interval: Interval,
    now_ms: i64,
) -> (i64, i64) {
    let span = i64::from(req_limit) * interval.duration_ms();

    match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (Some(start), None) => {
            info!("Found start date but no end: fetching {} klines", req_limit);
            (start, start + span)
        }
        (None, Some(end)) => {
            info!("Found end date but no start: fetching previous {} klines", req_limit);
            (end - span, end)
        }
        (None, None) => {
            info!("Neither start nor end given: fetching most recent {} klines", req_limit);
            (now_ms - span, now_ms)
        }
    }
}

/// The end bound can not be in the future, and it is expressed as the open time
/// of the last wanted candle, one interval before the clamped boundary.
pub fn clamp_end(requested_end: i64, interval: Interval, now_ms: i64) -> i64 {
    requested_end.min(now_ms) - interval.duration_ms()
}

/// The start bound can not precede the first candle the source has.
pub fn clamp_start(requested_start: i64, earliest_available: i64) -> i64 {
    requested_start.max(earliest_available)
}

/// Apply both clamps. `None` means nothing can be fetched in the window.
pub fn resolve_range(
    requested: (i64, i64),
    interval: Interval,
    earliest_available: i64,
    now_ms: i64,
) -> Option<TimeRange> {
    let (requested_start, requested_end) = requested;
    let start = clamp_start(requested_start, earliest_available);
    let end = clamp_end(requested_end, interval, now_ms);

    if start > requested_start {
        warn!(
            "First available kline starts at {}",
            crate::utils::format_ms(start)
        );
    }

    if start >= end {
        return None;
    }
    Some(TimeRange::new(start, end))
}
