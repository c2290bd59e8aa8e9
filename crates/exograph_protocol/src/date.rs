//! ISO-8601 dates as they appear on the wire.
//!
//! Dates are always sent as `YYYY-MM-DDTHH:MM:SS.mmmZ` and restored to
//! native values on receipt. Strings that do not match the pattern
//! exactly are left alone.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a date in the wire format.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns true if `s` has the exact shape of a wire date.
pub fn is_wire_date(s: &str) -> bool {
    const SHAPE: &[u8] = b"dddd-dd-ddTdd:dd:dd.dddZ";
    let bytes = s.as_bytes();
    bytes.len() == SHAPE.len()
        && bytes.iter().zip(SHAPE).all(|(&b, &shape)| match shape {
            b'd' => b.is_ascii_digit(),
            other => b == other,
        })
}

/// Parses a wire date, returning `None` for anything else.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if !is_wire_date(s) {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Parses a wire date, failing with [`ProtocolError::InvalidDate`].
pub fn require_date(s: &str) -> ProtocolResult<DateTime<Utc>> {
    parse_date(s).ok_or_else(|| ProtocolError::InvalidDate(s.to_string()))
}
