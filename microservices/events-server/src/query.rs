//! Time-range query expressions
//!
//! `since:YYYY-MM-DD HH:MM:SS until:YYYY-MM-DD HH:MM:SS`, times in UTC.

use chrono::NaiveDateTime;

use events_core::{EventsError, Result};

const QUERY_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";
const QUERY_SINCE: &str = "since:";
const QUERY_UNTIL: &str = "until:";

/// Half-open range `[since, until)` in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub since: i64,
    pub until: i64,
}

fn parse_error(msg: &str) -> EventsError {
    EventsError::QueryParse(msg.to_string())
}

fn parse_timestamp(value: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(value, QUERY_LAYOUT)
        .map(|t| t.and_utc().timestamp())
        .map_err(|_| parse_error("invalid query"))
}

pub fn parse_query(query: &str) -> Result<TimeRange> {
    if !query.starts_with(QUERY_SINCE) || !query.contains(QUERY_UNTIL) {
        return Err(parse_error("missing query"));
    }

    let parts: Vec<&str> = query.split(QUERY_UNTIL).collect();
    let [since, until] = parts.as_slice() else {
        return Err(parse_error("invalid length"));
    };

    let since = since.strip_prefix(QUERY_SINCE).unwrap_or(since).trim_matches(' ');
    let until = until.trim_matches(' ');
    if since.is_empty() || until.is_empty() {
        return Err(parse_error("empty query"));
    }

    Ok(TimeRange {
        since: parse_timestamp(since)?,
        until: parse_timestamp(until)?,
    })
}
