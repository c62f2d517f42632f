use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Config file error: {0}")]
    ConfigFileError(#[from] toml::de::Error),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// The interval label is not one the source understands.
    #[error("'{0}' is not a recognized kline interval")]
    InvalidInterval(String),

    /// A chunk could not be fetched. Carries the chunk bounds so the caller
    /// can retry that window by hand, plus how the rest of the plan fared.
    #[error(
        "failed to fetch {symbol}/{interval} chunk [{start_ms}, {end_ms}] \
         ({completed} completed, {failed} failed, {skipped} skipped): {source}"
    )]
    ChunkFetch {
        symbol: String,
        interval: String,
        start_ms: i64,
        end_ms: i64,
        completed: usize,
        failed: usize,
        skipped: usize,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Whether repeating the failed operation later has a reasonable chance of
    /// succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(_) | AppError::ApiError(_) | AppError::IoError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            }
            AppError::SqliteError(_) => true,

            AppError::ChunkFetch { source, .. } => source.is_retryable(),

            AppError::JsonError(_)
            | AppError::CsvError(_)
            | AppError::TimeParseError(_)
            | AppError::ConfigError(_)
            | AppError::ConfigFileError(_)
            | AppError::DataError(_)
            | AppError::InvalidInterval(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
