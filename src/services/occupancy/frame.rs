//! Per-frame pass over one zone
//!
//! Classifier -> debounce -> dwell for every observation, then the
//! track-lost pass, then the batch is applied to the zone record and the
//! reaper sweeps the zone's tables.

use super::CountEvent;
use crate::domain::types::{PersonId, Point, Timestamp};
use crate::domain::zone::HistoryAction;
use crate::infra::config::CountingConfig;
use crate::services::containment::is_inside;
use crate::services::dwell::{DwellAction, DwellOutcome};
use crate::services::reaper::{ReapStats, StaleTrackReaper};
use crate::services::registry::ZoneState;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, info};

/// Everything a zone pass needs to know about the current frame
pub(crate) struct FrameInput<'a> {
    pub camera_id: &'a str,
    pub positions: &'a [(PersonId, Point)],
    pub active_ids: &'a FxHashSet<PersonId>,
    pub now: Timestamp,
}

/// What one zone pass did to its zone
#[derive(Debug, Default)]
pub(crate) struct ZonePassOutcome {
    /// Counts, history or occupancy changed
    pub changed: bool,
    pub reaped: ReapStats,
}

pub(crate) fn run_zone_pass(
    zone_name: &str,
    zone: &mut ZoneState,
    frame: &FrameInput<'_>,
    counting: &CountingConfig,
    reaper: &StaleTrackReaper,
    events: &mut SmallVec<[CountEvent; 4]>,
) -> ZonePassOutcome {
    let rect = *zone.rect();
    let first_event = events.len();
    let mut inside: SmallVec<[PersonId; 16]> = SmallVec::new();

    for &(person, point) in frame.positions {
        let raw_inside = is_inside(point, &rect, counting.zone_padding());
        if !zone.debounce.observe(person, raw_inside, frame.now) {
            continue;
        }
        if raw_inside {
            inside.push(person);
        }
        let outcome = zone.dwell.update(person, raw_inside, frame.now);
        collect(frame.camera_id, zone_name, person, outcome, events);
    }

    // Tracks missing from this frame count as outside so they can finish exiting
    for person in zone.dwell.tracked_ids() {
        if frame.active_ids.contains(&person) {
            continue;
        }
        let outcome = zone.dwell.update(person, false, frame.now);
        collect(frame.camera_id, zone_name, person, outcome, events);
    }

    for event in &events[first_event..] {
        zone.apply_count(event.person, event.action, event.at);
        info!(
            camera = %frame.camera_id,
            zone = %zone_name,
            person = %event.person,
            dwell_secs = format!("{:.2}", event.dwell_secs),
            in_count = %zone.record.in_count,
            out_count = %zone.record.out_count,
            action = %event.action.as_str(),
            "zone_count"
        );
    }

    inside.sort_unstable();
    inside.dedup();
    let occupancy_changed = zone.set_inside_ids(inside.into_vec());

    let reaped = reaper.sweep(&mut zone.debounce, &mut zone.dwell, frame.active_ids, frame.now);

    ZonePassOutcome { changed: occupancy_changed || events.len() > first_event, reaped }
}

fn collect(
    camera_id: &str,
    zone_name: &str,
    person: PersonId,
    outcome: DwellOutcome,
    events: &mut SmallVec<[CountEvent; 4]>,
) {
    let action = if outcome.counts_entry() {
        HistoryAction::Entered
    } else if outcome.counts_exit() {
        HistoryAction::Exited
    } else {
        if matches!(
            outcome.action,
            DwellAction::Entered | DwellAction::Exiting | DwellAction::ReEntered | DwellAction::ConfirmedExit
        ) {
            debug!(
                camera = %camera_id,
                zone = %zone_name,
                person = %person,
                action = %outcome.action.as_str(),
                dwell_secs = format!("{:.2}", outcome.dwell_secs),
                pending_count = %outcome.should_count,
                "dwell_transition"
            );
        }
        return;
    };

    events.push(CountEvent {
        zone: zone_name.to_string(),
        person,
        action,
        at: outcome.event_time,
        dwell_secs: outcome.dwell_secs,
    });
}
