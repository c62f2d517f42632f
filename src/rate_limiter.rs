use crate::error::{AppError, Result};
use log::debug;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Caps how many calls may start in any rolling window, shared by every worker
/// holding a reference to it.
///
/// Keeps the start instants of the last `max_per_window` calls. A caller over
/// budget sleeps until the oldest of those leaves the window; calls are only
/// ever delayed, never rejected.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_second` call starts per rolling second
    pub fn new(max_per_second: u32) -> Result<Self> {
        Self::with_window(max_per_second, Duration::from_secs(1))
    }

    /// Derive the per-second call budget from the source's request weights:
    /// `floor(weight_budget_per_minute / 60 / weight_per_call)`.
    pub fn from_weights(weight_budget_per_minute: u32, weight_per_call: u32) -> Result<Self> {
        if weight_per_call == 0 {
            return Err(AppError::ConfigError(
                "weight_per_call must be at least 1".to_string(),
            ));
        }
        let max_per_second = weight_budget_per_minute / 60 / weight_per_call;
        debug!(
            "Rate limit: {} calls/s from a budget of {} weight/min at {} weight/call",
            max_per_second, weight_budget_per_minute, weight_per_call
        );
        Self::new(max_per_second)
    }

    pub fn with_window(max_per_window: u32, window: Duration) -> Result<Self> {
        if max_per_window == 0 {
            return Err(AppError::ConfigError(
                "rate limit allows no calls; raise the weight budget or lower the weight per call"
                    .to_string(),
            ));
        }
        if window.is_zero() {
            return Err(AppError::ConfigError(
                "rate limit window must be non-zero".to_string(),
            ));
        }
        let max_per_window = max_per_window as usize;
        Ok(Self {
            max_per_window,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max_per_window)),
        })
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for a free slot and claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();

                while let Some(oldest) = starts.front() {
                    if now.duration_since(*oldest) >= self.window {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }

                if starts.len() < self.max_per_window {
                    starts.push_back(now);
                    return;
                }

                // Full: the front entry is the next one to expire
                let oldest = starts[0];
                self.window.saturating_sub(now.duration_since(oldest))
            };

            sleep(wait).await;
        }
    }
}
