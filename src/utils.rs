use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert milliseconds to DateTime
pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Format milliseconds as a human-readable date string
pub fn format_ms(ms: i64) -> String {
    match ms_to_datetime(ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("{}ms", ms),
    }
}

/// Parse a user supplied point in time (UTC).
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or a raw
/// epoch millisecond value.
pub fn parse_time_arg(value: &str) -> Result<i64> {
    let value = value.trim();

    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .map_err(|e| AppError::ConfigError(format!("Invalid timestamp '{}': {}", value, e)));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    let naive_date = NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::ConfigError(format!("Invalid time: {}", value)))?;

    Ok(naive_datetime.and_utc().timestamp_millis())
}

/// Format duration in milliseconds as a human-readable string
pub fn format_duration_ms(ms: i64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours % 24, minutes % 60, seconds % 60)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}.{:03}s", seconds, ms % 1000)
    }
}
