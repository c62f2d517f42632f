use crate::api::KlineSource;
use crate::cache_index::uncached;
use crate::chunk_planner::ChunkPlanner;
use crate::config::Config;
use crate::db::KlineStore;
use crate::error::{AppError, Result};
use crate::models::{Interval, Kline, Series, TimeRange};
use crate::rate_limiter::RateLimiter;
use crate::time_range::{fill_defaults, resolve_range};
use crate::utils::{format_duration_ms, format_ms, now_ms};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Result of running a list of chunks through the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum PlanResult {
    /// There were no chunks, nothing was fetched
    NothingToDo,
    /// Every chunk was fetched; rows merged, deduplicated and sorted
    Merged(Series),
}

/// Result of [`Downloader::plan_and_fetch`]
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The resolved window holds no candles the source can serve
    EmptyRange,
    /// Every planned chunk is already in the cache
    AllCached { range: TimeRange, chunks: usize },
    /// Missing chunks were fetched. `series` holds only the fetched rows.
    Fetched {
        range: TimeRange,
        series: Series,
        chunks: usize,
    },
}

impl FetchOutcome {
    /// The resolved window, if there is one
    pub fn range(&self) -> Option<TimeRange> {
        match self {
            FetchOutcome::EmptyRange => None,
            FetchOutcome::AllCached { range, .. } | FetchOutcome::Fetched { range, .. } => {
                Some(*range)
            }
        }
    }
}

enum ChunkOutcome {
    Done(Vec<Kline>),
    Failed(AppError),
    Skipped,
}

/// Runs chunk fetches through a bounded pool, every start gated by a shared
/// rate limiter.
///
/// After the first failure no further chunk is started; chunks already past
/// the limiter are allowed to finish before the failure is reported.
pub struct FetchCoordinator {
    source: Arc<dyn KlineSource>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
    req_limit: u32,
}

impl FetchCoordinator {
    pub fn new(
        source: Arc<dyn KlineSource>,
        limiter: Arc<RateLimiter>,
        concurrency: usize,
        req_limit: u32,
    ) -> Self {
        Self {
            source,
            limiter,
            concurrency: concurrency.max(1),
            req_limit,
        }
    }

    /// Fetch every chunk and merge the rows.
    ///
    /// On failure returns [`AppError::ChunkFetch`] for the earliest failed
    /// chunk in plan order.
    pub async fn run_plan(
        &self,
        symbol: &str,
        interval: Interval,
        chunks: Vec<TimeRange>,
    ) -> Result<PlanResult> {
        if chunks.is_empty() {
            debug!("No chunks to fetch for {}/{}", symbol, interval);
            return Ok(PlanResult::NothingToDo);
        }

        let total_chunks = chunks.len();
        let abort = AtomicBool::new(false);
        let start_time = Instant::now();

        let mut outcomes = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| {
                let abort = &abort;
                async move {
                    if abort.load(Ordering::SeqCst) {
                        return (index, chunk, ChunkOutcome::Skipped);
                    }
                    self.limiter.acquire().await;
                    // A failure may have landed while this task waited for a slot
                    if abort.load(Ordering::SeqCst) {
                        return (index, chunk, ChunkOutcome::Skipped);
                    }

                    debug!(
                        "Fetching {}/{} chunk {} to {}",
                        symbol,
                        interval,
                        format_ms(chunk.start_ms),
                        format_ms(chunk.end_ms)
                    );

                    match self
                        .source
                        .fetch_chunk(symbol, interval, chunk.start_ms, chunk.end_ms, self.req_limit)
                        .await
                    {
                        Ok(klines) => (index, chunk, ChunkOutcome::Done(klines)),
                        Err(e) => {
                            error!("Chunk {} of {}/{} failed: {}", chunk, symbol, interval, e);
                            abort.store(true, Ordering::SeqCst);
                            (index, chunk, ChunkOutcome::Failed(e))
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        // Plan order, so the first failure reported is the earliest chunk
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut rows = Vec::new();
        let mut completed = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();

        for (_, chunk, outcome) in outcomes {
            match outcome {
                ChunkOutcome::Done(klines) => {
                    completed += 1;
                    rows.extend(klines);
                }
                ChunkOutcome::Failed(e) => failures.push((chunk, e)),
                ChunkOutcome::Skipped => skipped += 1,
            }
        }

        let failed = failures.len();
        if let Some((chunk, source)) = failures.into_iter().next() {
            warn!(
                "{}/{}: {} chunks completed, {} failed, {} skipped",
                symbol, interval, completed, failed, skipped
            );
            return Err(AppError::ChunkFetch {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                start_ms: chunk.start_ms,
                end_ms: chunk.end_ms,
                completed,
                failed,
                skipped,
                source: Box::new(source),
            });
        }

        let series = Series::from_rows(rows);
        info!(
            "Downloaded {} chunks ({} klines) for {}/{} in {}",
            total_chunks,
            series.len(),
            symbol,
            interval,
            format_duration_ms(start_time.elapsed().as_millis() as i64)
        );

        Ok(PlanResult::Merged(series))
    }
}

/// Backfill engine: resolves the window, plans chunks, skips what the cache
/// already has and fetches the rest.
pub struct Downloader {
    source: Arc<dyn KlineSource>,
    store: Arc<dyn KlineStore>,
    planner: ChunkPlanner,
    coordinator: FetchCoordinator,
}

impl Downloader {
    /// Create a new downloader
    pub fn new(
        config: &Config,
        source: Arc<dyn KlineSource>,
        store: Arc<dyn KlineStore>,
    ) -> Result<Self> {
        config.validate()?;
        let planner = config.chunk_planner()?;
        let limiter = Arc::new(config.rate_limiter()?);
        let coordinator = FetchCoordinator::new(
            Arc::clone(&source),
            limiter,
            config.concurrency,
            config.req_limit,
        );

        Ok(Self {
            source,
            store,
            planner,
            coordinator,
        })
    }

    /// Fetch whatever `[start, end]` is missing from the cache, using the
    /// current time as "now".
    pub async fn plan_and_fetch(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<FetchOutcome> {
        self.plan_and_fetch_at(symbol, interval, start, end, now_ms())
            .await
    }

    pub async fn plan_and_fetch_at(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        now_ms: i64,
    ) -> Result<FetchOutcome> {
        let interval: Interval = interval.parse()?;
        let requested = fill_defaults(start, end, self.planner.req_limit(), interval, now_ms);

        let earliest = match self.source.earliest_available(symbol, interval).await? {
            Some(earliest) => earliest,
            None => return Ok(FetchOutcome::EmptyRange),
        };

        let range = match resolve_range(requested, interval, earliest, now_ms) {
            Some(range) => range,
            None => {
                warn!(
                    "Nothing to fetch for {}/{} between {} and {}",
                    symbol,
                    interval,
                    format_ms(requested.0),
                    format_ms(requested.1)
                );
                return Ok(FetchOutcome::EmptyRange);
            }
        };

        let chunks = self.planner.plan(range.start_ms, range.end_ms, interval);
        let cached = self.store.read_series(symbol, interval)?;
        let needed = uncached(&chunks, &cached);

        if needed.is_empty() {
            info!("All requested chunks already cached");
            return Ok(FetchOutcome::AllCached {
                range,
                chunks: chunks.len(),
            });
        }

        info!(
            "Downloading {} chunks of {}/{} from {} to {}",
            needed.len(),
            symbol,
            interval,
            format_ms(range.start_ms),
            format_ms(range.end_ms)
        );

        let fetched_chunks = needed.len();
        match self.coordinator.run_plan(symbol, interval, needed).await? {
            PlanResult::NothingToDo => Ok(FetchOutcome::AllCached {
                range,
                chunks: chunks.len(),
            }),
            PlanResult::Merged(series) => Ok(FetchOutcome::Fetched {
                range,
                series,
                chunks: fetched_chunks,
            }),
        }
    }
}
