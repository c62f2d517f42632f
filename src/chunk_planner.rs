use crate::error::{AppError, Result};
use crate::models::{Interval, TimeRange};
use log::debug;

/// Candles shared by consecutive chunks. The source occasionally shifts or
/// revises candles near a request boundary; the duplicates are merged away.
pub const DEFAULT_OVERLAP_INTERVALS: u32 = 10;

/// Splits a window into request-sized chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    req_limit: u32,
    overlap_intervals: u32,
}

impl ChunkPlanner {
    /// Each chunk advances by `req_limit - 1 - overlap_intervals` candles, which
    /// therefore has to be positive.
    pub fn new(req_limit: u32, overlap_intervals: u32) -> Result<Self> {
        if req_limit < 2 || req_limit - 1 <= overlap_intervals {
            return Err(AppError::ConfigError(format!(
                "req_limit ({}) must exceed overlap_intervals ({}) + 1",
                req_limit, overlap_intervals
            )));
        }
        Ok(Self {
            req_limit,
            overlap_intervals,
        })
    }

    pub fn req_limit(&self) -> u32 {
        self.req_limit
    }

    pub fn overlap_intervals(&self) -> u32 {
        self.overlap_intervals
    }

    /// Chunks covering `[start_ms, end_ms]`, in ascending order.
    ///
    /// Each chunk spans at most `req_limit - 1` intervals, the next one starts
    /// `overlap_intervals` candles before the previous end, and the last chunk
    /// ends exactly at `end_ms`. Returns an empty plan when `start_ms >= end_ms`.
    pub fn plan(&self, start_ms: i64, end_ms: i64, interval: Interval) -> Vec<TimeRange> {
        let interval_ms = interval.duration_ms();
        let chunk_span = i64::from(self.req_limit - 1) * interval_ms;
        let overlap = i64::from(self.overlap_intervals) * interval_ms;

        let mut chunks = Vec::new();
        let mut chunk_start = start_ms;
        let mut chunk_end = start_ms;

        while chunk_end < end_ms {
            chunk_end = (chunk_start + chunk_span).min(end_ms);
            chunks.push(TimeRange::new(chunk_start, chunk_end));
            chunk_start = chunk_end - overlap;
        }

        debug!(
            "Planned {} chunks of up to {} {} klines from {} to {}",
            chunks.len(),
            self.req_limit,
            interval,
            start_ms,
            end_ms
        );
        chunks
    }
}
