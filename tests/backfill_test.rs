use async_trait::async_trait;
use kline_backfill::{
    AppError, Config, Database, Downloader, Exporter, FetchCoordinator, FetchOutcome, Interval,
    Kline, KlineSource, KlineStore, PlanResult, RateLimiter, Result, Series, TimeRange,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const MINUTE: i64 = 60_000;
const START: i64 = 26_000_000 * MINUTE;

fn kline(open_time: i64, interval_ms: i64, close: &str) -> Kline {
    Kline {
        open_time,
        open: "100.0".to_string(),
        high: "101.0".to_string(),
        low: "99.0".to_string(),
        close: close.to_string(),
        volume: "12.5".to_string(),
        close_time: open_time + interval_ms - 1,
        quote_asset_volume: "1250.0".to_string(),
        number_of_trades: 7,
        taker_buy_base_asset_volume: "6.0".to_string(),
        taker_buy_quote_asset_volume: "600.0".to_string(),
        ignore: "0".to_string(),
    }
}

/// Serves one kline per interval for any requested window and records what it
/// was asked for.
struct FakeSource {
    earliest: Option<i64>,
    fail_start: Option<i64>,
    delay: Duration,
    fail_delay: Duration,
    probes: AtomicUsize,
    calls: Mutex<Vec<(i64, i64)>>,
    call_starts: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    finished: AtomicUsize,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            earliest: Some(0),
            fail_start: None,
            delay: Duration::ZERO,
            fail_delay: Duration::ZERO,
            probes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            call_starts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> Vec<(i64, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KlineSource for FakeSource {
    async fn fetch_chunk(
        &self,
        _symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Kline>> {
        self.calls.lock().unwrap().push((start_ms, end_ms));
        self.call_starts.lock().unwrap().push(Instant::now());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let failing = self.fail_start == Some(start_ms);
        let delay = if failing { self.fail_delay } else { self.delay };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if failing {
            return Err(AppError::ApiError("429 Too Many Requests".to_string()));
        }
        self.finished.fetch_add(1, Ordering::SeqCst);

        let interval_ms = interval.duration_ms();
        Ok((start_ms..=end_ms)
            .step_by(interval_ms as usize)
            .take(limit as usize)
            .map(|t| kline(t, interval_ms, "100.5"))
            .collect())
    }

    async fn earliest_available(&self, _symbol: &str, _interval: Interval) -> Result<Option<i64>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.earliest)
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "kline_backfill_it_{}_{}",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn setup(name: &str, source: Arc<FakeSource>) -> (Downloader, Arc<Database>, PathBuf) {
    let dir = temp_dir(name);
    let store = Arc::new(Database::new(dir.join("klines.db")).unwrap());
    let downloader = Downloader::new(&Config::default(), source, store.clone()).unwrap();
    (downloader, store, dir)
}

fn chunk_ranges(count: i64) -> Vec<TimeRange> {
    (0..count)
        .map(|i| TimeRange::new(START + i * 10 * MINUTE, START + (i * 10 + 9) * MINUTE))
        .collect()
}

#[tokio::test]
async fn backfill_fetches_three_chunks_then_serves_from_cache() {
    let source = Arc::new(FakeSource::new());
    let (downloader, store, dir) = setup("e2e", source.clone());
    let exporter = Exporter::new(store.clone());
    let now = START + 10_000 * MINUTE;

    let outcome = downloader
        .plan_and_fetch_at("ABCUSD", "1m", Some(START), Some(START + 2500 * MINUTE), now)
        .await
        .unwrap();

    let (range, series) = match outcome {
        FetchOutcome::Fetched { range, series, chunks } => {
            assert_eq!(chunks, 3);
            (range, series)
        }
        other => panic!("unexpected outcome: {:?}", other),
    };

    assert_eq!(range, TimeRange::new(START, START + 2499 * MINUTE));
    assert_eq!(
        source.calls(),
        vec![
            (START, START + 999 * MINUTE),
            (START + 989 * MINUTE, START + 1988 * MINUTE),
            (START + 1978 * MINUTE, START + 2499 * MINUTE),
        ]
    );
    assert_eq!(series.len(), 2500);
    assert!(series
        .as_slice()
        .windows(2)
        .all(|pair| pair[1].open_time - pair[0].open_time == MINUTE));

    assert_eq!(exporter.write_to_cache(&series, "ABCUSD", Interval::OneMinute).unwrap(), 2500);

    let second = downloader
        .plan_and_fetch_at("ABCUSD", "1m", Some(START), Some(START + 2500 * MINUTE), now)
        .await
        .unwrap();
    assert_eq!(second, FetchOutcome::AllCached { range, chunks: 3 });
    assert_eq!(source.calls().len(), 3);

    let csv_path = dir.join("out").join("abcusd.csv");
    assert!(exporter
        .export_csv("ABCUSD", Interval::OneMinute, range, &Series::new(), &csv_path)
        .unwrap());
    let content = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(content.lines().count(), 2501);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn only_chunks_missing_from_cache_are_fetched() {
    let source = Arc::new(FakeSource::new());
    let (downloader, store, dir) = setup("partial", source.clone());
    let now = START + 10_000 * MINUTE;

    let first_chunk: Series = (0..1000).map(|m| kline(START + m * MINUTE, MINUTE, "1")).collect();
    store.write(&first_chunk, "ABCUSD", Interval::OneMinute).unwrap();

    let outcome = downloader
        .plan_and_fetch_at("ABCUSD", "1m", Some(START), Some(START + 2500 * MINUTE), now)
        .await
        .unwrap();

    match outcome {
        FetchOutcome::Fetched { chunks, series, .. } => {
            assert_eq!(chunks, 2);
            assert_eq!(series.first().unwrap().open_time, START + 989 * MINUTE);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(source.calls().len(), 2);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn unknown_interval_fails_before_any_request() {
    let source = Arc::new(FakeSource::new());
    let (downloader, _store, dir) = setup("bad_interval", source.clone());

    let err = downloader
        .plan_and_fetch_at("ABCUSD", "7m", None, None, START)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidInterval(ref label) if label == "7m"));
    assert_eq!(source.probes.load(Ordering::SeqCst), 0);
    assert!(source.calls().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn window_without_data_is_an_empty_range() {
    let now = START + 10_000 * MINUTE;

    // Window entirely in the future
    let source = Arc::new(FakeSource::new());
    let (downloader, _store, dir) = setup("future", source.clone());
    let outcome = downloader
        .plan_and_fetch_at("ABCUSD", "1h", Some(now + MINUTE), None, now)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::EmptyRange);
    assert!(source.calls().is_empty());
    let _ = std::fs::remove_dir_all(dir);

    // Source has nothing for the pair
    let source = Arc::new(FakeSource {
        earliest: None,
        ..FakeSource::new()
    });
    let (downloader, _store, dir) = setup("no_data", source.clone());
    let outcome = downloader
        .plan_and_fetch_at("ABCUSD", "1m", None, None, now)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::EmptyRange);
    assert!(source.calls().is_empty());
    let _ = std::fs::remove_dir_all(dir);

    // Listing happened after the requested window
    let source = Arc::new(FakeSource {
        earliest: Some(now - 10 * MINUTE),
        ..FakeSource::new()
    });
    let (downloader, _store, dir) = setup("late_listing", source.clone());
    let outcome = downloader
        .plan_and_fetch_at("ABCUSD", "1m", Some(START), Some(START + 100 * MINUTE), now)
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::EmptyRange);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(start_paused = true)]
async fn failure_drains_in_flight_chunks_and_skips_the_rest() {
    let chunks = chunk_ranges(10);
    let source = Arc::new(FakeSource {
        fail_start: Some(chunks[1].start_ms),
        delay: Duration::from_millis(100),
        fail_delay: Duration::from_millis(10),
        ..FakeSource::new()
    });
    let coordinator = FetchCoordinator::new(
        source.clone(),
        Arc::new(RateLimiter::new(100).unwrap()),
        3,
        1000,
    );

    let err = coordinator
        .run_plan("ABCUSD", Interval::OneMinute, chunks.clone())
        .await
        .unwrap_err();

    match err {
        AppError::ChunkFetch {
            ref symbol,
            start_ms,
            end_ms,
            completed,
            failed,
            skipped,
            ..
        } => {
            assert_eq!(symbol, "ABCUSD");
            assert_eq!((start_ms, end_ms), (chunks[1].start_ms, chunks[1].end_ms));
            assert_eq!((completed, failed, skipped), (2, 1, 7));
        }
        ref other => panic!("unexpected error: {:?}", other),
    }

    // Chunks 0 and 2 were already running and were allowed to finish
    assert_eq!(source.calls().len(), 3);
    assert_eq!(source.finished.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_configured_concurrency() {
    let source = Arc::new(FakeSource {
        delay: Duration::from_millis(50),
        ..FakeSource::new()
    });
    let coordinator = FetchCoordinator::new(
        source.clone(),
        Arc::new(RateLimiter::new(100).unwrap()),
        3,
        1000,
    );

    let result = coordinator
        .run_plan("ABCUSD", Interval::OneMinute, chunk_ranges(10))
        .await
        .unwrap();

    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 3);
    match result {
        PlanResult::Merged(series) => assert_eq!(series.len(), 100),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn limiter_caps_starts_per_second_across_workers() {
    let source = Arc::new(FakeSource {
        delay: Duration::from_millis(10),
        ..FakeSource::new()
    });
    // 240 weight per minute at 1 weight per call: 4 calls per second
    let limiter = Arc::new(RateLimiter::from_weights(240, 1).unwrap());
    let coordinator = FetchCoordinator::new(source.clone(), limiter, 8, 1000);
    let begin = Instant::now();

    coordinator
        .run_plan("ABCUSD", Interval::OneMinute, chunk_ranges(12))
        .await
        .unwrap();

    let mut starts = source.call_starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 12);
    for window in starts.windows(5) {
        assert!(window[4] - window[0] >= Duration::from_secs(1));
    }
    assert!(Instant::now() - begin >= Duration::from_secs(2));
}

#[test]
fn merge_is_idempotent_and_order_independent() {
    let rows: Vec<Kline> = (0..50)
        .flat_map(|m| {
            vec![
                kline(START + m * MINUTE, MINUTE, "1.0"),
                kline(START + m * MINUTE, MINUTE, "2.0"),
            ]
        })
        .collect();

    let forward = Series::from_rows(rows.clone());
    let mut reversed_rows = rows.clone();
    reversed_rows.reverse();
    let reversed = Series::from_rows(reversed_rows);
    let mut rotated_rows = rows.clone();
    rotated_rows.rotate_left(37);
    let rotated = Series::from_rows(rotated_rows);

    assert_eq!(forward.len(), 50);
    assert_eq!(forward, reversed);
    assert_eq!(forward, rotated);
    assert_eq!(forward.clone().merge(forward.clone().into_vec()), forward);
}
