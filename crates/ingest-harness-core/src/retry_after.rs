//! `Retry-After` header parsing.
//!
//! The header carries either a number of seconds or an HTTP-date
//! (`Wed, 21 Oct 2015 07:28:00 GMT`). Anything else, including a missing or
//! empty header and dates already in the past, resolves to no wait at all.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub fn parse_retry_after(value: Option<&str>, now: DateTime<Utc>) -> Duration {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Duration::ZERO;
    };
    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    match DateTime::parse_from_rfc2822(value) {
        Ok(at) => (at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO),
        Err(_) => Duration::ZERO,
    }
}
