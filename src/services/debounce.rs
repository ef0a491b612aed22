//! Per-person hysteresis on raw containment signals
//!
//! A raw per-frame inside/outside flag only becomes "stable" after the same
//! value has been observed `stability_threshold` frames in a row. A flip
//! resets the run to 1. Sub-threshold flicker therefore never reaches the
//! dwell state machine.

use crate::domain::types::{PersonId, Timestamp};
use rustc_hash::FxHashMap;

/// Debounce state for one (camera, zone, person)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceState {
    /// Most recent raw value (the candidate stable state)
    pub stable_state: bool,
    /// Consecutive frames with `stable_state`, always >= 1
    pub consecutive_count: u32,
    /// Refreshed on every observation; read by the stale track reaper
    pub last_update: Timestamp,
}

impl DebounceState {
    fn new(raw: bool, now: Timestamp) -> Self {
        Self { stable_state: raw, consecutive_count: 1, last_update: now }
    }
}

/// Debounce table for a single zone
#[derive(Debug, Clone)]
pub struct DebounceFilter {
    states: FxHashMap<PersonId, DebounceState>,
    stability_threshold: u32,
}

impl DebounceFilter {
    pub fn new(stability_threshold: u32) -> Self {
        Self { states: FxHashMap::default(), stability_threshold }
    }

    /// Feed one raw containment flag, returning true once it is stable
    pub fn observe(&mut self, person: PersonId, raw_inside: bool, now: Timestamp) -> bool {
        let Some(state) = self.states.get_mut(&person) else {
            self.states.insert(person, DebounceState::new(raw_inside, now));
            return false;
        };

        if state.stable_state != raw_inside {
            *state = DebounceState::new(raw_inside, now);
            return false;
        }

        state.consecutive_count = state.consecutive_count.saturating_add(1);
        state.last_update = now;
        state.consecutive_count >= self.stability_threshold
    }

    pub fn get(&self, person: PersonId) -> Option<&DebounceState> {
        self.states.get(&person)
    }

    /// Keep only entries for which `keep` returns true; returns removed count
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(PersonId, &DebounceState) -> bool,
    {
        let before = self.states.len();
        self.states.retain(|&id, state| keep(id, state));
        before - self.states.len()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[inline]
    pub fn stability_threshold(&self) -> u32 {
        self.stability_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t(ms: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_first_observation_not_stable() {
        let mut filter = DebounceFilter::new(3);
        assert!(!filter.observe(PersonId(1), true, t(0)));
        let state = filter.get(PersonId(1)).unwrap();
        assert!(state.stable_state);
        assert_eq!(state.consecutive_count, 1);
    }

    #[test]
    fn test_stable_at_threshold() {
        let mut filter = DebounceFilter::new(3);
        assert!(!filter.observe(PersonId(1), true, t(0)));
        assert!(!filter.observe(PersonId(1), true, t(100)));
        assert!(filter.observe(PersonId(1), true, t(200)));
        // Stays stable while the signal holds
        assert!(filter.observe(PersonId(1), true, t(300)));
        assert_eq!(filter.get(PersonId(1)).unwrap().consecutive_count, 4);
    }

    #[test]
    fn test_flip_resets_run() {
        let mut filter = DebounceFilter::new(3);
        filter.observe(PersonId(1), true, t(0));
        filter.observe(PersonId(1), true, t(100));
        assert!(!filter.observe(PersonId(1), false, t(200)));

        let state = filter.get(PersonId(1)).unwrap();
        assert!(!state.stable_state);
        assert_eq!(state.consecutive_count, 1);

        assert!(!filter.observe(PersonId(1), false, t(300)));
        assert!(filter.observe(PersonId(1), false, t(400)));
    }

    #[test]
    fn test_alternating_flicker_never_stable() {
        let mut filter = DebounceFilter::new(2);
        for i in 0..20 {
            assert!(!filter.observe(PersonId(9), i % 2 == 0, t(i * 33)));
        }
    }

    #[test]
    fn test_last_update_refreshed_on_every_call() {
        let mut filter = DebounceFilter::new(3);
        filter.observe(PersonId(1), true, t(0));
        filter.observe(PersonId(1), true, t(500));
        assert_eq!(filter.get(PersonId(1)).unwrap().last_update, t(500));
        filter.observe(PersonId(1), false, t(900));
        assert_eq!(filter.get(PersonId(1)).unwrap().last_update, t(900));
    }

    #[test]
    fn test_threshold_one_stable_on_second_matching_frame() {
        // The first sighting only creates the record
        let mut filter = DebounceFilter::new(1);
        assert!(!filter.observe(PersonId(1), true, t(0)));
        assert!(filter.observe(PersonId(1), true, t(10)));
    }

    #[test]
    fn test_retain_reports_removed() {
        let mut filter = DebounceFilter::new(3);
        filter.observe(PersonId(1), true, t(0));
        filter.observe(PersonId(2), true, t(0));
        filter.observe(PersonId(3), false, t(0));

        let removed = filter.retain(|id, _| id != PersonId(2));
        assert_eq!(removed, 1);
        assert_eq!(filter.len(), 2);
        assert!(filter.get(PersonId(2)).is_none());
    }
}
