//! Relay statistics — atomic counters shared across workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Session-wide counters. One instance is shared by every worker; all
/// increments are relaxed — counters are informational, not control flow.
#[derive(Debug, Default)]
pub struct RelayStats {
    observed: AtomicU64,
    filtered_out: AtomicU64,
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    ai_fallbacks: AtomicU64,
    caption_resummarized: AtomicU64,
    caption_truncated: AtomicU64,
    media_failures: AtomicU64,
    send_failures: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_observed(&self) {
        self.observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered_out(&self) {
        self.filtered_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ai_fallback(&self) {
        self.ai_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_caption_resummarized(&self) {
        self.caption_resummarized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_caption_truncated(&self) {
        self.caption_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_media_failure(&self) {
        self.media_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            observed: self.observed.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            ai_fallbacks: self.ai_fallbacks.load(Ordering::Relaxed),
            caption_resummarized: self.caption_resummarized.load(Ordering::Relaxed),
            caption_truncated: self.caption_truncated.load(Ordering::Relaxed),
            media_failures: self.media_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub observed: u64,
    pub filtered_out: u64,
    pub duplicates: u64,
    pub forwarded: u64,
    pub ai_fallbacks: u64,
    pub caption_resummarized: u64,
    pub caption_truncated: u64,
    pub media_failures: u64,
    pub send_failures: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "observed {}, forwarded {}, filtered {}, duplicates {}, \
             ai fallbacks {}, resummarized {}, truncated {}, \
             media failures {}, send failures {}",
            self.observed,
            self.forwarded,
            self.filtered_out,
            self.duplicates,
            self.ai_fallbacks,
            self.caption_resummarized,
            self.caption_truncated,
            self.media_failures,
            self.send_failures,
        )
    }
}
