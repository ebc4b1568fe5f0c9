//! Telemetry payload formatting
//!
//! Formatting is synchronous and never panics: strftime strings are checked
//! up front, and an unparseable input timestamp is reported as a
//! [`PayloadError`] for the caller to skip.

use crate::source::Measurement;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use thiserror::Error;

pub const DEFAULT_INPUT_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_OUTPUT_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Timestamp '{timestamp}' does not match input format '{format}': {source}")]
    TimestampParse {
        timestamp: String,
        format: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("Invalid timestamp format '{0}'")]
    InvalidFormat(String),
    #[error("Measurement value {0} is not a finite number")]
    NonFinite(f64),
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How timestamps are produced for outgoing telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadOptions {
    /// Reformat the measurement's own timestamp instead of using wall-clock time
    pub use_input_timestamp: bool,
    pub input_ts_format: String,
    pub output_ts_format: String,
}

impl Default for PayloadOptions {
    fn default() -> Self {
        Self {
            use_input_timestamp: false,
            input_ts_format: DEFAULT_INPUT_TS_FORMAT.to_string(),
            output_ts_format: DEFAULT_OUTPUT_TS_FORMAT.to_string(),
        }
    }
}

impl PayloadOptions {
    pub fn validate(&self) -> Result<(), PayloadError> {
        validate_format(&self.input_ts_format)?;
        validate_format(&self.output_ts_format)
    }
}

/// Wire shape of one telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub timestamp: String,
    pub value: f64,
}

impl TelemetryPayload {
    pub fn to_json(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Reject strftime strings chrono cannot render
pub fn validate_format(format: &str) -> Result<(), PayloadError> {
    if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(PayloadError::InvalidFormat(format.to_string()));
    }
    Ok(())
}

/// Build the payload for one measurement.
///
/// `now` is used as the timestamp unless `use_input_timestamp` is set, in
/// which case the measurement's timestamp is reparsed with the input format.
pub fn format_payload(
    measurement: &Measurement,
    options: &PayloadOptions,
    now: DateTime<Utc>,
) -> Result<TelemetryPayload, PayloadError> {
    if !measurement.value.is_finite() {
        return Err(PayloadError::NonFinite(measurement.value));
    }

    let instant = if options.use_input_timestamp {
        parse_timestamp(&measurement.timestamp, &options.input_ts_format)?
    } else {
        now.with_timezone(&Utc.fix())
    };

    Ok(TelemetryPayload {
        timestamp: render_timestamp(&instant, &options.output_ts_format)?,
        value: measurement.value,
    })
}

/// Parse with or without an offset; date-only formats resolve to midnight UTC
fn parse_timestamp(raw: &str, format: &str) -> Result<DateTime<FixedOffset>, PayloadError> {
    validate_format(format)?;
    let raw = raw.trim();

    if let Ok(with_offset) = DateTime::parse_from_str(raw, format) {
        return Ok(with_offset);
    }
    let naive = match NaiveDateTime::parse_from_str(raw, format) {
        Ok(naive) => naive,
        Err(source) => NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| PayloadError::TimestampParse {
                timestamp: raw.to_string(),
                format: format.to_string(),
                source,
            })?,
    };
    Ok(Utc.fix().from_utc_datetime(&naive))
}

fn render_timestamp(instant: &DateTime<FixedOffset>, format: &str) -> Result<String, PayloadError> {
    validate_format(format)?;
    let mut rendered = String::new();
    write!(
        rendered,
        "{}",
        instant.format_with_items(StrftimeItems::new(format))
    )
    .map_err(|_| PayloadError::InvalidFormat(format.to_string()))?;
    Ok(rendered)
}
