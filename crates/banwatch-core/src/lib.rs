//! Core domain model for banwatch.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "banwatch-core";

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Width of the recency window used to classify an entry as newly banned.
pub const RECENCY_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// How far past the recency cutoff a first-population record is back-dated,
/// so a cold-started store does not report its entire baseline as new.
pub const BOOTSTRAP_PREAGE_MS: i64 = 1_000;

/// One persisted observation: an entry and the time we first saw it.
/// `first_seen` is set once and never changes; records are never deleted,
/// even when the entry later disappears from the upstream list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry: String,
    pub first_seen: i64,
}

impl EntryRecord {
    pub fn new(entry: impl Into<String>, first_seen: i64) -> Self {
        Self {
            entry: entry.into(),
            first_seen,
        }
    }
}

/// The reconciled result of one fetch cycle, serialized with the field names
/// the page script expects in `window.__BAN_DATA__`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanSnapshot {
    /// Full current list from the latest fetch, upstream order preserved.
    pub banned: Vec<String>,
    /// Subset of `banned` first seen within the recency window.
    #[serde(rename = "new")]
    pub newly_banned: Vec<String>,
    /// Minimum first-seen across the store before this fetch, 0 if empty.
    #[serde(rename = "cacheTimestamp")]
    pub cache_timestamp: i64,
    /// Wall-clock time of this reconciliation, epoch milliseconds.
    #[serde(rename = "fetchTimestamp")]
    pub fetch_timestamp: i64,
}

impl BanSnapshot {
    /// Recency cutoff for a reconciliation happening at `now_ms`.
    pub fn recent_cutoff(now_ms: i64) -> i64 {
        now_ms - RECENCY_WINDOW_MS
    }
}
