use chrono::{DateTime, Utc};

/// Current time as an RFC 3339 string, the wire/storage format used
/// throughout the core for timestamps (VM/Execution/Worker/Task records).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current time as a [`DateTime<Utc>`].
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a stored RFC 3339 timestamp, falling back to `None` rather than
/// erroring — timestamps are advisory fields, not integrity-critical ones.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Seconds elapsed since a stored timestamp, or `None` if unparsable.
pub fn elapsed_secs_since(s: &str) -> Option<i64> {
    parse_iso(s).map(|t| (now() - t).num_seconds())
}
