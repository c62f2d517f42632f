use anyhow::Result;
use clap::Parser;
use kline_backfill::utils::{format_ms, parse_time_arg};
use kline_backfill::{
    BinanceApi, Config, Database, Downloader, Exporter, FetchOutcome, Interval, KlineSource,
    KlineStore, Series,
};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backfill historical klines into a local cache and CSV.", long_about = None)]
struct Args {
    /// Trading pair, e.g. BTCUSDT
    symbol: String,

    /// Kline interval, e.g. 1m, 4h, 1d
    interval: String,

    /// Window start: YYYY-MM-DD, "YYYY-MM-DD HH:MM:SS" (UTC) or epoch ms
    #[arg(long)]
    start: Option<String>,

    /// Window end, same formats as --start
    #[arg(long)]
    end: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export the window to CSV, optionally at the given path
    #[arg(long, num_args = 0..=1)]
    csv: Option<Option<PathBuf>>,

    /// Do not persist fetched klines into the cache
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Chunk fetches in flight at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.no_cache {
        config.write_cache = false;
    }
    config.validate()?;

    let interval: Interval = args.interval.parse()?;
    let start = args.start.as_deref().map(parse_time_arg).transpose()?;
    let end = args.end.as_deref().map(parse_time_arg).transpose()?;

    info!("Starting kline backfill for {}/{}", args.symbol, interval);

    let source: Arc<dyn KlineSource> = Arc::new(BinanceApi::new(&config)?);
    let db = Arc::new(Database::new(&config.db_path)?);
    let store: Arc<dyn KlineStore> = db.clone();
    let downloader = Downloader::new(&config, source, Arc::clone(&store))?;
    let exporter = Exporter::new(store);

    let outcome = match downloader
        .plan_and_fetch(&args.symbol, interval.as_str(), start, end)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Backfill failed: {}", e);
            if e.is_retryable() {
                warn!("The error looks transient; rerunning later fetches only the missing chunks");
            }
            return Err(e.into());
        }
    };

    let (range, fresh) = match outcome {
        FetchOutcome::EmptyRange => {
            warn!("No klines available for {}/{} in the requested window", args.symbol, interval);
            return Ok(());
        }
        FetchOutcome::AllCached { range, chunks } => {
            info!("All {} chunks already cached", chunks);
            (range, Series::new())
        }
        FetchOutcome::Fetched { range, series, chunks } => {
            info!("Fetched {} chunks, {} klines", chunks, series.len());
            if config.write_cache {
                exporter.write_to_cache(&series, &args.symbol, interval)?;
            }
            (range, series)
        }
    };

    info!(
        "Window {} to {} for {}/{}",
        format_ms(range.start_ms),
        format_ms(range.end_ms),
        args.symbol,
        interval
    );
    if let Some((earliest, latest)) = db.get_cached_bounds(&args.symbol, interval)? {
        info!(
            "Cache holds {} klines from {} to {}",
            db.get_kline_count(&args.symbol, interval)?,
            format_ms(earliest),
            format_ms(latest)
        );
    }

    if let Some(csv) = args.csv {
        let path = match csv {
            Some(path) => path,
            None => {
                config.ensure_output_dir()?;
                config.get_output_path(&args.symbol, interval.as_str())
            }
        };
        exporter.export_csv(&args.symbol, interval, range, &fresh, &path)?;
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let env = env_logger::Env::default()
        .filter_or("LOG_LEVEL", if verbose { "debug" } else { "info" });

    env_logger::init_from_env(env);
}
