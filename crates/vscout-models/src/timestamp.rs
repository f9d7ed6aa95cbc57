//! Timestamp parsing and formatting.
//!
//! Analysis output reports chunk-relative times as `SS`, `MM:SS` or
//! `HH:MM:SS`, each optionally with a fractional part.

use thiserror::Error;

/// Timestamp parsing error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimestampError {
    #[error("Timestamp cannot be empty")]
    Empty,

    #[error("Timestamp cannot be negative")]
    Negative,

    #[error("Invalid {0} value: {1}")]
    InvalidValue(&'static str, String),

    #[error("Invalid timestamp format '{0}'. Use HH:MM:SS, MM:SS or SS")]
    InvalidFormat(String),
}

/// Parse a timestamp string to total seconds.
///
/// # Examples
/// ```
/// use vscout_models::timestamp::parse_timestamp;
/// assert_eq!(parse_timestamp("01:30:00").unwrap(), 5400.0);
/// assert_eq!(parse_timestamp("05:30").unwrap(), 330.0);
/// assert_eq!(parse_timestamp("90").unwrap(), 90.0);
/// ```
pub fn parse_timestamp(ts: &str) -> Result<f64, TimestampError> {
    let ts = ts.trim();
    if ts.is_empty() {
        return Err(TimestampError::Empty);
    }

    const UNITS: [&str; 3] = ["hours", "minutes", "seconds"];
    let parts: Vec<&str> = ts.split(':').collect();
    if parts.len() > UNITS.len() {
        return Err(TimestampError::InvalidFormat(ts.to_string()));
    }

    // Align the parts to the right so "MM:SS" maps onto minutes/seconds.
    let units = &UNITS[UNITS.len() - parts.len()..];
    let mut total = 0.0;
    for (part, unit) in parts.iter().zip(units) {
        let value: f64 = part
            .trim()
            .parse()
            .map_err(|_| TimestampError::InvalidValue(unit, part.to_string()))?;
        if !value.is_finite() {
            return Err(TimestampError::InvalidValue(unit, part.to_string()));
        }
        if value < 0.0 {
            return Err(TimestampError::Negative);
        }
        total = total * 60.0 + value;
    }
    Ok(total)
}

/// Format seconds into HH:MM:SS or HH:MM:SS.mmm string.
pub fn format_seconds(total_secs: f64) -> String {
    let total_secs = total_secs.max(0.0);
    let hours = (total_secs / 3600.0).floor() as u32;
    let mins = ((total_secs % 3600.0) / 60.0).floor() as u32;
    let secs = total_secs % 60.0;

    // Include milliseconds if present
    if (secs - secs.floor()).abs() > 0.0001 {
        format!("{:02}:{:02}:{:06.3}", hours, mins, secs)
    } else {
        format!("{:02}:{:02}:{:02}", hours, mins, secs.floor() as u32)
    }
}
