//! Human-friendly duration parsing for TTLs and caps

use chrono::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid duration '{0}' (expected <n>s, <n>m, <n>h, or <n>d, e.g. 30m or 9h)")]
pub struct DurationParseError(String);

/// Parse durations like `90s`, `30m`, `9h`, `2d`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(DurationParseError(s.to_string()));
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let n: i64 = num
        .parse()
        .map_err(|_| DurationParseError(s.to_string()))?;
    if n < 0 {
        return Err(DurationParseError(s.to_string()));
    }
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(DurationParseError(s.to_string())),
    }
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_duration(d: Duration) -> String {
    let secs = d.num_seconds();
    if secs % 86_400 == 0 && secs != 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 && secs != 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 && secs != 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
