//! Incremental-mode resolution.
//!
//! Decides, from the previous [`CollectionState`] and the caller's
//! [`SyncPolicy`], whether a run is incremental and what its since-cursor is,
//! and computes the state to persist once the run completes cleanly.
//!
//! | Situation | Incremental | Since |
//! |-----------|-------------|-------|
//! | full sync requested | no | policy `time_after` |
//! | no previous successful run | no | policy `time_after` |
//! | subtask config changed | no | policy `time_after` |
//! | policy `time_after` earlier than the stored one | no | policy `time_after` |
//! | otherwise | yes | stored `since_cursor` |
//!
//! When that yields no since at all, the stored `time_after` is used.

use chrono::{DateTime, Utc};

use crate::models::CollectionState;

/// Caller-supplied sync options for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Ignore the stored cursor and re-collect everything.
    pub full_sync: bool,
    /// Explicit inclusive lower bound on data recency.
    pub time_after: Option<DateTime<Utc>>,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalMode {
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

pub fn resolve(policy: &SyncPolicy, previous: Option<&CollectionState>, config: &str) -> IncrementalMode {
    let full = IncrementalMode {
        incremental: false,
        since: policy.time_after,
    };
    let mode = match previous {
        _ if policy.full_sync => full,
        None => full,
        Some(prev) if prev.since_cursor.is_none() => full,
        Some(prev) if !prev.config.is_empty() && prev.config != config => full,
        Some(prev) => match (policy.time_after, prev.time_after) {
            (Some(requested), Some(stored)) if requested < stored => full,
            _ => IncrementalMode {
                incremental: true,
                since: prev.since_cursor,
            },
        },
    };
    if mode.since.is_none() {
        return IncrementalMode {
            since: previous.and_then(|p| p.time_after),
            ..mode
        };
    }
    mode
}

/// The state to persist after a successful run that started at `started_at`.
///
/// The cursor never moves backwards: a run whose start time is earlier than
/// the stored cursor (clock skew, a replayed run) keeps the stored value.
pub fn advance(
    previous: Option<&CollectionState>,
    table: &str,
    fingerprint: &str,
    mode: IncrementalMode,
    policy: &SyncPolicy,
    config: &str,
    started_at: DateTime<Utc>,
) -> CollectionState {
    let prev_cursor = previous.and_then(|p| p.since_cursor);
    let mut time_after = previous.and_then(|p| p.time_after);
    if !mode.incremental && policy.time_after.is_some() {
        time_after = policy.time_after;
    }
    CollectionState {
        table: table.to_string(),
        fingerprint: fingerprint.to_string(),
        since_cursor: Some(prev_cursor.map_or(started_at, |c| c.max(started_at))),
        time_after,
        config: config.to_string(),
        updated_at: started_at,
    }
}
