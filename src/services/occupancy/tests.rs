//! Tests for the OccupancyService module

use super::*;
use crate::domain::types::history_time;
use crate::domain::zone::DEFAULT_ZONE_RECT;
use crate::io::egress_channel::{create_egress_channel, EgressMessage};
use chrono::{Duration, TimeZone};

const CAM: &str = "camera1";
const ZONE: &str = "zone1";

fn t(ms: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
}

fn create_service() -> OccupancyService {
    OccupancyService::new(CountingConfig::default(), Arc::new(Metrics::new()), None)
}

/// Well inside the default zone, clear of the padding
fn inside(id: i64) -> Observation {
    Observation::point(id, 960.0, 500.0)
}

fn outside(id: i64) -> Observation {
    Observation::point(id, 100.0, 100.0)
}

fn feed(service: &OccupancyService, frames: &[(i64, Vec<Observation>)]) -> Vec<BatchReport> {
    frames.iter().map(|(ms, obs)| service.process_at(CAM, obs, t(*ms))).collect()
}

fn zone_counts(service: &OccupancyService) -> (u64, u64) {
    let stats = service.zone_stats_at(CAM, ZONE, t(0)).unwrap();
    (stats.in_count, stats.out_count)
}

/// Person 7 stabilises inside at 200ms and qualifies at 1200ms
fn qualify_person_7(service: &OccupancyService) {
    let reports = feed(
        service,
        &[
            (0, vec![inside(7)]),
            (100, vec![inside(7)]),
            (200, vec![inside(7)]),
            (1200, vec![inside(7)]),
        ],
    );
    assert_eq!(reports[3].entries(), 1);
}

/// Three outside frames: exit starts at 1500ms
fn leave_person_7(service: &OccupancyService) {
    feed(service, &[(1300, vec![outside(7)]), (1400, vec![outside(7)]), (1500, vec![outside(7)])]);
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_a_single_qualified_entry() {
    let service = create_service();
    let reports = feed(
        &service,
        &[
            (0, vec![inside(7)]),
            (100, vec![inside(7)]),
            (200, vec![inside(7)]),
            (700, vec![inside(7)]),
            (1200, vec![inside(7)]),
        ],
    );

    let entries: usize = reports.iter().map(|r| r.entries()).sum();
    assert_eq!(entries, 1);
    assert_eq!(zone_counts(&service), (1, 0));

    let counts = service.counts(Some(CAM)).unwrap();
    let history = &counts[CAM][ZONE].history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, PersonId(7));
    assert_eq!(history[0].action, HistoryAction::Entered);
}

#[test]
fn test_dwell_measured_from_stable_frame() {
    let service = create_service();
    // Stable at 600ms; 1200ms is only 0.6s of dwell
    feed(
        &service,
        &[
            (0, vec![inside(7)]),
            (300, vec![inside(7)]),
            (600, vec![inside(7)]),
            (900, vec![inside(7)]),
            (1200, vec![inside(7)]),
        ],
    );
    assert_eq!(zone_counts(&service), (0, 0));

    service.process_at(CAM, &[inside(7)], t(1600));
    assert_eq!(zone_counts(&service), (1, 0));
}

#[test]
fn test_scenario_b_short_visit_not_counted() {
    let service = create_service();
    feed(
        &service,
        &[
            (0, vec![inside(7)]),
            (300, vec![inside(7)]),
            (400, vec![outside(7)]),
            (500, vec![outside(7)]),
            (600, vec![outside(7)]),
            (2000, vec![outside(7)]),
        ],
    );
    assert_eq!(zone_counts(&service), (0, 0));
    assert!(service.dwell_details_at(CAM, ZONE, t(2000)).unwrap().is_empty());
}

#[test]
fn test_scenario_c_reentry_within_grace() {
    let service = create_service();
    qualify_person_7(&service);
    leave_person_7(&service);

    let reports = feed(
        &service,
        &[(1800, vec![inside(7)]), (1900, vec![inside(7)]), (2000, vec![inside(7)]), (4000, vec![inside(7)])],
    );
    assert!(reports.iter().all(|r| r.events.is_empty()));
    assert_eq!(zone_counts(&service), (1, 0));

    let details = service.dwell_details_at(CAM, ZONE, t(4000)).unwrap();
    assert_eq!(details.len(), 1);
    assert!(details[0].counted);
    assert_eq!(details[0].state, "inside");
}

#[test]
fn test_scenario_d_confirmed_exit() {
    let service = create_service();
    qualify_person_7(&service);
    leave_person_7(&service);

    let waiting = service.process_at(CAM, &[outside(7)], t(2000));
    assert!(waiting.events.is_empty());

    let report = service.process_at(CAM, &[outside(7)], t(3000));
    assert_eq!(report.exits(), 1);
    assert_eq!(report.events[0].at, t(1500));
    assert!((report.events[0].dwell_secs - 1.3).abs() < 1e-9);

    assert_eq!(zone_counts(&service), (1, 1));
    assert!(service.dwell_details_at(CAM, ZONE, t(3000)).unwrap().is_empty());

    let counts = service.counts(Some(CAM)).unwrap();
    let last = counts[CAM][ZONE].history.last().cloned().unwrap();
    assert_eq!(last.action, HistoryAction::Exited);
    assert_eq!(last.time, history_time(t(1500)));
}

// ============================================================================
// State machine properties through the service
// ============================================================================

#[test]
fn test_flicker_never_counts() {
    let service = create_service();
    for i in 0..40 {
        let obs = if i % 2 == 0 { inside(3) } else { outside(3) };
        let report = service.process_at(CAM, &[obs], t(i * 100));
        assert!(report.events.is_empty());
    }
    assert_eq!(zone_counts(&service), (0, 0));
}

#[test]
fn test_track_lost_exit_completes() {
    let service = create_service();
    qualify_person_7(&service);

    // Person vanishes from the frame: exiting at 1300, confirmed at 2300
    assert!(service.process_at(CAM, &[], t(1300)).events.is_empty());
    assert!(service.process_at(CAM, &[], t(1800)).events.is_empty());
    let report = service.process_at(CAM, &[inside(8)], t(2300));
    assert_eq!(report.exits(), 1);
    assert_eq!(report.events[0].person, PersonId(7));
    assert_eq!(zone_counts(&service), (1, 1));
}

#[test]
fn test_requalifies_after_confirmed_exit() {
    let service = create_service();
    qualify_person_7(&service);
    leave_person_7(&service);
    service.process_at(CAM, &[outside(7)], t(2500));

    feed(
        &service,
        &[
            (3000, vec![inside(7)]),
            (3100, vec![inside(7)]),
            (3200, vec![inside(7)]),
            (4200, vec![inside(7)]),
        ],
    );
    assert_eq!(zone_counts(&service), (2, 1));
}

#[test]
fn test_in_out_balance_bounded_by_qualified_dwellers() {
    let service = create_service();
    let mut ms = 0;
    for round in 0..5 {
        let crowd: Vec<Observation> = (0..4).map(|i| inside(round * 10 + i)).collect();
        for _ in 0..15 {
            service.process_at(CAM, &crowd, t(ms));
            ms += 100;
        }
        let stats = service.zone_stats_at(CAM, ZONE, t(ms)).unwrap();
        let open = (stats.in_count - stats.out_count) as usize;
        assert!(open <= stats.dwell_stats.qualified);
    }
    // Everybody leaves the frame and the grace window elapses
    for _ in 0..30 {
        service.process_at(CAM, &[], t(ms));
        ms += 100;
    }
    let (in_count, out_count) = zone_counts(&service);
    assert_eq!(in_count, 20);
    assert_eq!(out_count, 20);
}

#[test]
fn test_occupancy_reflects_stable_inside_only() {
    let service = create_service();
    feed(&service, &[(0, vec![inside(1), inside(2)]), (100, vec![inside(1), inside(2)])]);
    assert_eq!(service.zone_stats_at(CAM, ZONE, t(100)).unwrap().current_occupancy, 0);

    service.process_at(CAM, &[inside(1), outside(2)], t(200));
    let stats = service.zone_stats_at(CAM, ZONE, t(200)).unwrap();
    assert_eq!(stats.inside_ids, vec![PersonId(1)]);
    assert_eq!(stats.current_occupancy, 1);
    assert_eq!(stats.dwell_stats.active, 1);
    assert_eq!(stats.coordinates, DEFAULT_ZONE_RECT);
}

#[test]
fn test_untracked_duplicates_share_one_entity() {
    let service = create_service();
    let frame = vec![inside(-1), inside(-1)];
    // Two identical -1 detections advance one debounce run twice per frame
    service.process_at(CAM, &frame, t(0));
    service.process_at(CAM, &frame, t(100));
    let stats = service.zone_stats_at(CAM, ZONE, t(100)).unwrap();
    assert_eq!(stats.inside_ids, vec![PersonId(-1)]);
    assert_eq!(stats.dwell_stats.active, 1);
}

#[test]
fn test_zones_are_independent() {
    let service = create_service();
    // Provision the camera with zone1, then add a second zone
    service.process_at(CAM, &[], t(0));
    service.create_or_update_zone(CAM, "left", [0, 0], [400, 400]).unwrap();
    let left_point = Observation::point(5, 200.0, 200.0);
    let frames: Vec<(i64, Vec<Observation>)> =
        [0, 100, 200, 1200].iter().map(|&ms| (ms, vec![left_point])).collect();
    feed(&service, &frames);

    assert_eq!(service.zone_stats_at(CAM, "left", t(0)).unwrap().in_count, 1);
    assert_eq!(service.zone_stats_at(CAM, ZONE, t(0)).unwrap().in_count, 0);
}

#[test]
fn test_bounding_box_uses_bottom_center() {
    let service = create_service();
    // Box centre is outside the zone, the feet are inside
    let obs = Observation::bbox(4, 900.0, 100.0, 1000.0, 500.0);
    for ms in [0, 100, 200, 1200] {
        service.process_at(CAM, &[obs], t(ms));
    }
    assert_eq!(zone_counts(&service), (1, 0));
}

// ============================================================================
// Batch report and failure isolation
// ============================================================================

#[test]
fn test_malformed_observation_isolated() {
    let service = create_service();
    let frame = vec![Observation::point(1, f64::NAN, 5.0), inside(2)];
    let mut report = BatchReport::default();
    for ms in [0, 100, 200, 1200] {
        report = service.process_at(CAM, &frame, t(ms));
    }
    assert_eq!(report.skipped, vec![ObservationError::NonFiniteCoordinate(PersonId(1))]);
    assert_eq!(report.entries(), 1);
    assert_eq!(report.events[0].person, PersonId(2));
}

#[test]
fn test_unknown_camera_provisioned_with_default_zone() {
    let service = create_service();
    let report = service.process_at("lobby", &[inside(1)], t(0));
    assert!(report.provisioned);
    assert_eq!(report.camera_id, "lobby");

    let snapshot = service.camera_snapshot("lobby").unwrap();
    assert_eq!(snapshot.zones.keys().cloned().collect::<Vec<_>>(), vec!["zone1".to_string()]);
    assert_eq!(snapshot.zones["zone1"].rect, DEFAULT_ZONE_RECT);

    assert!(!service.process_at("lobby", &[inside(1)], t(100)).provisioned);
}

#[test]
fn test_reaper_drops_absent_debounce_entries() {
    let service = create_service();
    service.process_at(CAM, &[inside(1), outside(2)], t(0));
    let report = service.process_at(CAM, &[inside(1)], t(100));
    assert_eq!(report.reaped.debounce_removed, 1);
}

#[test]
fn test_reaper_drops_stale_dwell_without_exit() {
    let service = create_service();
    qualify_person_7(&service);
    // Present but flickering: the debounce never settles, so the dwell record
    // only ages until the reaper drops it, without an exit
    let mut ms = 1300;
    while ms < 1300 + 125_000 {
        let obs = if (ms / 100) % 2 == 0 { outside(7) } else { inside(7) };
        service.process_at(CAM, &[obs], t(ms));
        ms += 100;
    }
    assert!(service.dwell_details_at(CAM, ZONE, t(ms)).unwrap().is_empty());
    assert_eq!(zone_counts(&service), (1, 0));
}

#[test]
fn test_metrics_recorded() {
    let metrics = Arc::new(Metrics::new());
    let service = OccupancyService::new(CountingConfig::default(), metrics.clone(), None);
    for ms in [0, 100, 200, 1200] {
        service.process_at(CAM, &[inside(1), Observation::point(2, f64::INFINITY, 0.0)], t(ms));
    }
    assert_eq!(metrics.frames_total(), 4);
    assert_eq!(metrics.observations_total(), 4);
    assert_eq!(metrics.observations_skipped(), 4);
    assert_eq!(metrics.entries_total(), 1);
}

// ============================================================================
// Zone management
// ============================================================================

#[test]
fn test_create_round_trip() {
    let service = create_service();
    let change = service.create_or_update_zone("cam2", "door", [10, 10], [200, 300]).unwrap();
    assert_eq!(change, ZoneChange::Created);

    let snapshot = service.camera_snapshot("cam2").unwrap();
    let record = &snapshot.zones["door"];
    assert_eq!(record.rect.top_left, [10, 10]);
    assert_eq!(record.rect.bottom_right, [200, 300]);
    assert_eq!((record.in_count, record.out_count), (0, 0));
    // Explicitly created cameras have no default zone
    assert_eq!(snapshot.zones.len(), 1);
}

#[test]
fn test_invalid_create_leaves_no_camera() {
    let service = create_service();
    let err = service.create_or_update_zone("cam2", "door", [10, 10], [10, 300]).unwrap_err();
    assert!(matches!(err, ZoneError::InvalidRectangle { .. }));
    assert!(service.cameras().is_empty());

    assert_eq!(
        service.create_or_update_zone("cam2", "", [0, 0], [1, 1]),
        Err(ZoneError::MissingField("zone"))
    );
}

#[test]
fn test_update_preserves_counts() {
    let service = create_service();
    qualify_person_7(&service);
    let change = service.create_or_update_zone(CAM, ZONE, [600, 300], [1300, 720]).unwrap();
    assert_eq!(change, ZoneChange::Updated);
    assert_eq!(zone_counts(&service), (1, 0));
    assert!(service.dwell_details_at(CAM, ZONE, t(1300)).unwrap().is_empty());
}

#[test]
fn test_reset_idempotent() {
    let service = create_service();
    qualify_person_7(&service);

    service.reset_zone_counts(CAM, ZONE).unwrap();
    let once = service.full_snapshot();
    service.reset_zone_counts(CAM, ZONE).unwrap();
    let twice = service.full_snapshot();

    assert_eq!(once, twice);
    assert_eq!(zone_counts(&service), (0, 0));
    assert_eq!(twice[CAM].zones[ZONE].rect, DEFAULT_ZONE_RECT);
}

#[test]
fn test_declined_operations() {
    let service = create_service();
    assert_eq!(service.delete_zone("nope", ZONE), Err(ZoneError::CameraNotFound("nope".into())));
    assert_eq!(
        service.reset_zone_counts("nope", ZONE),
        Err(ZoneError::CameraNotFound("nope".into()))
    );

    service.process_at(CAM, &[], t(0));
    assert!(matches!(service.delete_zone(CAM, "nope"), Err(ZoneError::ZoneNotFound { .. })));
    assert!(matches!(service.zone_stats(CAM, "nope"), Err(ZoneError::ZoneNotFound { .. })));
    assert!(service.counts(Some("nope")).is_err());
    assert!(service.delete_zone(CAM, ZONE).is_ok());
    assert!(service.camera_snapshot(CAM).unwrap().zones.is_empty());
}

#[test]
fn test_active_camera() {
    let service = create_service();
    assert_eq!(service.active_camera(), DEFAULT_CAMERA_ID);
    assert_eq!(service.set_active_camera("cam9"), Err(ZoneError::CameraNotFound("cam9".into())));

    service.process_at("cam9", &[], t(0));
    assert!(service.set_active_camera("cam9").is_ok());
    assert_eq!(service.active_camera(), "cam9");
}

#[test]
fn test_counts_all_cameras() {
    let service = create_service();
    service.process_at("b", &[], t(0));
    service.process_at("a", &[], t(0));
    let counts = service.counts(None).unwrap();
    assert_eq!(counts.keys().cloned().collect::<Vec<_>>(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(service.cameras(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_from_snapshot_restores_counts() {
    let service = create_service();
    qualify_person_7(&service);
    service.create_or_update_zone("alpha", "door", [0, 0], [50, 50]).unwrap();
    let snapshot = service.full_snapshot();

    let restored =
        OccupancyService::from_snapshot(snapshot, CountingConfig::default(), Arc::new(Metrics::new()), None);
    assert_eq!(restored.active_camera(), "alpha");
    assert_eq!(zone_counts(&restored), (1, 0));
    // Tracking is not persisted
    assert_eq!(restored.tracked_people(), 0);
}

// ============================================================================
// Notifications and egress
// ============================================================================

#[test]
fn test_changes_notified_on_mutation() {
    let service = create_service();
    let mut changes = service.subscribe_changes();

    service.process_at(CAM, &[], t(0));
    assert!(changes.has_changed().unwrap());
    changes.borrow_and_update();

    // Nothing changes on an empty frame for a known camera
    service.process_at(CAM, &[], t(100));
    assert!(!changes.has_changed().unwrap());

    service.reset_zone_counts(CAM, ZONE).unwrap();
    assert!(changes.has_changed().unwrap());
}

#[tokio::test]
async fn test_events_published_to_egress() {
    let metrics = Arc::new(Metrics::new());
    let (sender, mut rx) = create_egress_channel(16, "site".to_string(), metrics.clone());
    let service = OccupancyService::new(CountingConfig::default(), metrics, Some(sender));

    for ms in [0, 100, 200, 1200] {
        service.process_at(CAM, &[inside(7)], t(ms));
    }

    match rx.recv().await {
        Some(EgressMessage::ZoneEvent(payload)) => {
            assert_eq!(payload.cam, CAM);
            assert_eq!(payload.zone, ZONE);
            assert_eq!(payload.tid, 7);
            assert_eq!(payload.t, "entered");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn test_cameras_processed_in_parallel() {
    let service = Arc::new(create_service());
    std::thread::scope(|scope| {
        for cam in 0..4 {
            let service = service.clone();
            scope.spawn(move || {
                let camera_id = format!("cam{cam}");
                for ms in [0, 100, 200, 1200] {
                    service.process_at(&camera_id, &[inside(1), inside(2)], t(ms));
                }
            });
        }
    });

    for cam in 0..4 {
        let stats = service.zone_stats_at(&format!("cam{cam}"), ZONE, t(1200)).unwrap();
        assert_eq!(stats.in_count, 2);
    }
}
