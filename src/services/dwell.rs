//! Per-zone dwell state machine
//!
//! Turns stable containment transitions into qualified entry/exit events.
//!
//! Lifecycle per person:
//! - Absent: no record
//! - Inside: entered, dwell accumulating (`counted` flips once dwell >= min)
//! - Exiting: left, waiting out the exit grace window
//!
//! Key behaviors:
//! - An entry is counted only after `min_dwell_secs` inside, at most once per session
//! - An exit is confirmed only after `exit_grace_secs` outside without return
//! - Re-entry during the grace window resumes the session; entry_time is kept
//! - Confirmed exits always drop the record, but only counted sessions emit an exit

use crate::domain::types::{seconds_between, PersonId, Timestamp};
use crate::domain::zone::{DwellDetail, DwellStats};
use rustc_hash::FxHashMap;

/// Where a tracked person is in their dwell session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Inside,
    Exiting,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Inside => "inside",
            Lifecycle::Exiting => "exiting",
        }
    }
}

/// Dwell session for one (camera, zone, person)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellRecord {
    pub entry_time: Timestamp,
    pub last_seen: Timestamp,
    /// Whether this session already produced an Entered event
    pub counted: bool,
    pub exit_time: Option<Timestamp>,
    pub lifecycle: Lifecycle,
}

impl DwellRecord {
    fn new(now: Timestamp) -> Self {
        Self { entry_time: now, last_seen: now, counted: false, exit_time: None, lifecycle: Lifecycle::Inside }
    }

    /// Most recent activity: exit time while exiting, else last sighting inside
    #[inline]
    pub fn last_activity(&self) -> Timestamp {
        match (self.lifecycle, self.exit_time) {
            (Lifecycle::Exiting, Some(exit_time)) => exit_time,
            _ => self.last_seen,
        }
    }
}

/// Transition taken by a single update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellAction {
    /// Outside with no session
    None,
    /// Session created
    Entered,
    /// Dwell reached the minimum; counts as an entry
    QualifiedEntry,
    /// Still inside, nothing to count
    Dwelling,
    /// Left the zone, grace window started
    Exiting,
    /// Came back within the grace window
    ReEntered,
    /// Grace window elapsed; session removed
    ConfirmedExit,
    /// Still outside, grace window running
    Outside,
}

impl DwellAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DwellAction::None => "none",
            DwellAction::Entered => "entered",
            DwellAction::QualifiedEntry => "qualified_entry",
            DwellAction::Dwelling => "dwelling",
            DwellAction::Exiting => "exiting",
            DwellAction::ReEntered => "re_entered",
            DwellAction::ConfirmedExit => "confirmed_exit",
            DwellAction::Outside => "outside",
        }
    }
}

/// Result of feeding one stable signal into the state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellOutcome {
    pub action: DwellAction,
    /// Dwell in seconds relevant to the action (0.0 where not meaningful)
    pub dwell_secs: f64,
    /// True for a count-affecting QualifiedEntry/ConfirmedExit.
    /// For Exiting it only reports whether the pending exit will count.
    pub should_count: bool,
    /// Time to stamp on a history event: now, or the exit time for confirmed exits
    pub event_time: Timestamp,
}

impl DwellOutcome {
    fn new(action: DwellAction, dwell_secs: f64, should_count: bool, event_time: Timestamp) -> Self {
        Self { action, dwell_secs, should_count, event_time }
    }

    /// True if this outcome must increment in_count
    #[inline]
    pub fn counts_entry(&self) -> bool {
        self.action == DwellAction::QualifiedEntry && self.should_count
    }

    /// True if this outcome must increment out_count
    #[inline]
    pub fn counts_exit(&self) -> bool {
        self.action == DwellAction::ConfirmedExit && self.should_count
    }
}

/// Dwell table for a single zone
#[derive(Debug, Clone)]
pub struct DwellTracker {
    records: FxHashMap<PersonId, DwellRecord>,
    /// Seconds inside before an entry counts
    min_dwell_secs: f64,
    /// Seconds outside before an exit is confirmed
    exit_grace_secs: f64,
}

impl DwellTracker {
    pub fn new(min_dwell_secs: f64, exit_grace_secs: f64) -> Self {
        Self { records: FxHashMap::default(), min_dwell_secs, exit_grace_secs }
    }

    /// Feed one stable containment signal for `person` at `now`
    pub fn update(&mut self, person: PersonId, inside: bool, now: Timestamp) -> DwellOutcome {
        let Some(record) = self.records.get_mut(&person) else {
            if inside {
                self.records.insert(person, DwellRecord::new(now));
                return DwellOutcome::new(DwellAction::Entered, 0.0, false, now);
            }
            return DwellOutcome::new(DwellAction::None, 0.0, false, now);
        };

        if inside {
            if record.lifecycle == Lifecycle::Exiting {
                // Resume the session; entry_time is not reset
                record.lifecycle = Lifecycle::Inside;
                record.exit_time = None;
                record.last_seen = now;
                return DwellOutcome::new(DwellAction::ReEntered, 0.0, false, now);
            }

            record.last_seen = now;
            let dwell_secs = seconds_between(record.entry_time, now);
            if !record.counted && dwell_secs >= self.min_dwell_secs {
                record.counted = true;
                return DwellOutcome::new(DwellAction::QualifiedEntry, dwell_secs, true, now);
            }
            return DwellOutcome::new(DwellAction::Dwelling, dwell_secs, false, now);
        }

        match (record.lifecycle, record.exit_time) {
            (Lifecycle::Inside, _) => {
                record.lifecycle = Lifecycle::Exiting;
                record.exit_time = Some(now);
                let dwell_secs = seconds_between(record.entry_time, now);
                DwellOutcome::new(DwellAction::Exiting, dwell_secs, record.counted, now)
            }
            (Lifecycle::Exiting, Some(exit_time)) => {
                if seconds_between(exit_time, now) < self.exit_grace_secs {
                    return DwellOutcome::new(DwellAction::Outside, 0.0, false, now);
                }
                let dwell_secs = seconds_between(record.entry_time, exit_time);
                let counted = record.counted;
                self.records.remove(&person);
                DwellOutcome::new(DwellAction::ConfirmedExit, dwell_secs, counted, exit_time)
            }
            (Lifecycle::Exiting, None) => {
                // Unreachable through `update`; treat as an exit starting now
                record.exit_time = Some(now);
                DwellOutcome::new(DwellAction::Outside, 0.0, false, now)
            }
        }
    }

    pub fn get(&self, person: PersonId) -> Option<&DwellRecord> {
        self.records.get(&person)
    }

    pub fn contains(&self, person: PersonId) -> bool {
        self.records.contains_key(&person)
    }

    /// Ids with an open session (inside or in grace)
    pub fn tracked_ids(&self) -> Vec<PersonId> {
        let mut ids: Vec<PersonId> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Keep only records for which `keep` returns true; returns removed count
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(PersonId, &DwellRecord) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|&id, record| keep(id, record));
        before - self.records.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Dwell aggregates over people currently inside (exiting people excluded)
    pub fn stats(&self, now: Timestamp) -> DwellStats {
        let mut stats = DwellStats::default();
        let mut total = 0.0;

        for record in self.records.values().filter(|r| r.lifecycle == Lifecycle::Inside) {
            let dwell = seconds_between(record.entry_time, now);
            total += dwell;
            stats.max_dwell = if stats.active == 0 { dwell } else { stats.max_dwell.max(dwell) };
            stats.active += 1;
            if record.counted {
                stats.qualified += 1;
            }
        }

        if stats.active > 0 {
            stats.avg_dwell = total / stats.active as f64;
        }
        stats
    }

    /// Per-person dwell list, longest current dwell first
    pub fn details(&self, now: Timestamp) -> Vec<DwellDetail> {
        let mut details: Vec<DwellDetail> = self
            .records
            .iter()
            .map(|(&id, record)| DwellDetail {
                id,
                dwell_secs: seconds_between(record.entry_time, now),
                counted: record.counted,
                state: record.lifecycle.as_str(),
            })
            .collect();

        details.sort_by(|a, b| b.dwell_secs.total_cmp(&a.dwell_secs).then(a.id.cmp(&b.id)));
        details
    }

    #[inline]
    pub fn min_dwell_secs(&self) -> f64 {
        self.min_dwell_secs
    }

    #[inline]
    pub fn exit_grace_secs(&self) -> f64 {
        self.exit_grace_secs
    }
}
