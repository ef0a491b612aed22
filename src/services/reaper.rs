//! Stale track reaper
//!
//! Bounds per-zone memory by dropping tracking state for people the upstream
//! tracker no longer reports. Reaping never produces count events: a session
//! that ages out without a confirmed exit is discarded silently.

use crate::domain::types::{seconds_between, PersonId, Timestamp};
use crate::services::debounce::DebounceFilter;
use crate::services::dwell::DwellTracker;
use rustc_hash::FxHashSet;
use tracing::debug;

/// Entries removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub debounce_removed: usize,
    pub dwell_removed: usize,
}

impl ReapStats {
    #[inline]
    pub fn total(&self) -> usize {
        self.debounce_removed + self.dwell_removed
    }

    pub fn merge(&mut self, other: ReapStats) {
        self.debounce_removed += other.debounce_removed;
        self.dwell_removed += other.dwell_removed;
    }
}

/// Staleness windows for the two per-zone tables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaleTrackReaper {
    /// Max age of a debounce entry's last update (seconds)
    debounce_stale_secs: f64,
    /// Max age of a dwell record's last activity (seconds)
    dwell_stale_secs: f64,
}

impl StaleTrackReaper {
    pub fn new(debounce_stale_secs: f64, dwell_stale_secs: f64) -> Self {
        Self { debounce_stale_secs, dwell_stale_secs }
    }

    /// Sweep one zone's tables
    ///
    /// Debounce entries go when the person is missing from `active_ids` or
    /// was last updated more than `debounce_stale_secs` ago. Dwell records go
    /// when their last activity is older than `dwell_stale_secs`.
    pub fn sweep(
        &self,
        debounce: &mut DebounceFilter,
        dwell: &mut DwellTracker,
        active_ids: &FxHashSet<PersonId>,
        now: Timestamp,
    ) -> ReapStats {
        let debounce_removed = debounce.retain(|id, state| {
            active_ids.contains(&id) && seconds_between(state.last_update, now) <= self.debounce_stale_secs
        });

        let dwell_removed = dwell.retain(|id, record| {
            let keep = seconds_between(record.last_activity(), now) <= self.dwell_stale_secs;
            if !keep {
                debug!(
                    person = %id,
                    lifecycle = %record.lifecycle.as_str(),
                    counted = %record.counted,
                    "dwell_record_reaped"
                );
            }
            keep
        });

        ReapStats { debounce_removed, dwell_removed }
    }

    #[inline]
    pub fn debounce_stale_secs(&self) -> f64 {
        self.debounce_stale_secs
    }

    #[inline]
    pub fn dwell_stale_secs(&self) -> f64 {
        self.dwell_stale_secs
    }
}
