//! Zone registry: per-camera ownership of zones and their tracking tables
//!
//! `CameraState` owns every zone of one camera; each `ZoneState` owns its
//! aggregate record plus the debounce and dwell tables for that zone. The
//! occupancy service holds one `CameraState` per camera behind a mutex, so
//! nothing here is shared or synchronised on its own.

use crate::domain::types::{history_time, PersonId, Timestamp};
use crate::domain::zone::{
    CameraRecord, DwellDetail, HistoryAction, HistoryEvent, ZoneCounts, ZoneError, ZoneRecord,
    ZoneRect, ZoneStats, DEFAULT_ZONE_NAME, DEFAULT_ZONE_RECT,
};
use crate::infra::config::CountingConfig;
use crate::services::debounce::DebounceFilter;
use crate::services::dwell::DwellTracker;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Whether an upsert created a zone or replaced an existing rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneChange {
    Created,
    Updated,
}

impl ZoneChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneChange::Created => "created",
            ZoneChange::Updated => "updated",
        }
    }
}

/// One zone: persisted record plus transient tracking sub-state
#[derive(Debug, Clone)]
pub struct ZoneState {
    pub(crate) record: ZoneRecord,
    pub(crate) debounce: DebounceFilter,
    pub(crate) dwell: DwellTracker,
}

impl ZoneState {
    pub fn new(rect: ZoneRect, counting: &CountingConfig) -> Self {
        Self::from_record(ZoneRecord::new(rect), counting)
    }

    /// Rebuild from a persisted record; tracking starts empty
    pub fn from_record(mut record: ZoneRecord, counting: &CountingConfig) -> Self {
        record.inside_ids.clear();
        Self {
            record,
            debounce: DebounceFilter::new(counting.stability_threshold()),
            dwell: DwellTracker::new(counting.min_dwell_secs(), counting.exit_grace_secs()),
        }
    }

    #[inline]
    pub fn rect(&self) -> &ZoneRect {
        &self.record.rect
    }

    #[inline]
    pub fn record(&self) -> &ZoneRecord {
        &self.record
    }

    #[inline]
    pub fn dwell(&self) -> &DwellTracker {
        &self.dwell
    }

    #[inline]
    pub fn debounce(&self) -> &DebounceFilter {
        &self.debounce
    }

    /// Drop all debounce and dwell state and the derived occupancy
    pub fn clear_tracking(&mut self) {
        self.debounce.clear();
        self.dwell.clear();
        self.record.inside_ids.clear();
    }

    /// Apply one count event: bump the counter and append to history
    pub fn apply_count(&mut self, person: PersonId, action: HistoryAction, at: Timestamp) {
        match action {
            HistoryAction::Entered => self.record.in_count += 1,
            HistoryAction::Exited => self.record.out_count += 1,
        }
        self.record.history.push(HistoryEvent { id: person, action, time: history_time(at) });
    }

    /// Replace the occupancy snapshot; returns true if it changed
    pub fn set_inside_ids(&mut self, inside: Vec<PersonId>) -> bool {
        if self.record.inside_ids == inside {
            return false;
        }
        self.record.inside_ids = inside;
        true
    }

    pub fn counts(&self) -> ZoneCounts {
        ZoneCounts {
            in_count: self.record.in_count,
            out_count: self.record.out_count,
            history: self.record.history.clone(),
        }
    }

    pub fn stats(&self, now: Timestamp) -> ZoneStats {
        ZoneStats {
            in_count: self.record.in_count,
            out_count: self.record.out_count,
            current_occupancy: self.record.inside_ids.len(),
            inside_ids: self.record.inside_ids.clone(),
            dwell_stats: self.dwell.stats(now),
            coordinates: self.record.rect,
        }
    }
}

/// All zones of one camera
#[derive(Debug, Clone)]
pub struct CameraState {
    camera_id: String,
    zones: BTreeMap<String, ZoneState>,
    counting: CountingConfig,
}

impl CameraState {
    /// Camera with no zones (explicit zone creation for a new camera)
    pub fn new(camera_id: &str, counting: CountingConfig) -> Self {
        Self { camera_id: camera_id.to_string(), zones: BTreeMap::new(), counting }
    }

    /// Camera provisioned on first detections, with the default zone
    pub fn with_default_zone(camera_id: &str, counting: CountingConfig) -> Self {
        let mut camera = Self::new(camera_id, counting);
        camera
            .zones
            .insert(DEFAULT_ZONE_NAME.to_string(), ZoneState::new(DEFAULT_ZONE_RECT, &camera.counting));
        camera
    }

    /// Restore from a persisted record, skipping zones whose rectangle is invalid
    pub fn from_record(camera_id: &str, record: CameraRecord, counting: CountingConfig) -> Self {
        let mut camera = Self::new(camera_id, counting);
        for (name, zone) in record.zones {
            if let Err(e) = zone.rect.validate() {
                warn!(camera = %camera_id, zone = %name, error = %e, "zone_restore_skipped");
                continue;
            }
            camera.zones.insert(name, ZoneState::from_record(zone, &camera.counting));
        }
        camera
    }

    #[inline]
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    #[inline]
    pub fn counting(&self) -> &CountingConfig {
        &self.counting
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneState> {
        self.zones.get(name)
    }

    pub fn zone_names(&self) -> Vec<String> {
        self.zones.keys().cloned().collect()
    }

    pub(crate) fn zones_mut(&mut self) -> impl Iterator<Item = (&String, &mut ZoneState)> {
        self.zones.iter_mut()
    }

    #[inline]
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Open dwell sessions across all zones
    pub fn tracked_people(&self) -> usize {
        self.zones.values().map(|z| z.dwell.len()).sum()
    }

    /// Create a zone or replace an existing zone's rectangle
    ///
    /// Creation starts from zero counts. An update keeps counts and history.
    /// Either way the zone's tracking tables start over, since debounce and
    /// dwell state against the old rectangle no longer mean anything.
    /// An invalid rectangle is rejected with the zone untouched.
    pub fn upsert_zone(
        &mut self,
        name: &str,
        top_left: [i32; 2],
        bottom_right: [i32; 2],
    ) -> Result<ZoneChange, ZoneError> {
        if name.trim().is_empty() {
            return Err(ZoneError::MissingField("zone"));
        }
        let rect = ZoneRect::new(top_left, bottom_right)?;

        let change = match self.zones.get_mut(name) {
            Some(zone) => {
                zone.record.rect = rect;
                zone.clear_tracking();
                ZoneChange::Updated
            }
            None => {
                self.zones.insert(name.to_string(), ZoneState::new(rect, &self.counting));
                ZoneChange::Created
            }
        };

        info!(
            camera = %self.camera_id,
            zone = %name,
            top_left = ?rect.top_left,
            bottom_right = ?rect.bottom_right,
            change = change.as_str(),
            "zone_upserted"
        );
        Ok(change)
    }

    /// Remove a zone together with its tracking state
    pub fn delete_zone(&mut self, name: &str) -> Result<(), ZoneError> {
        self.zones.remove(name).ok_or_else(|| self.zone_not_found(name))?;
        info!(camera = %self.camera_id, zone = %name, "zone_deleted");
        Ok(())
    }

    /// Zero in/out/occupancy and drop tracking; rectangle and history are kept
    pub fn reset_zone(&mut self, name: &str) -> Result<(), ZoneError> {
        let Some(zone) = self.zones.get_mut(name) else {
            return Err(self.zone_not_found(name));
        };
        zone.record.in_count = 0;
        zone.record.out_count = 0;
        zone.clear_tracking();
        info!(camera = %self.camera_id, zone = %name, "zone_counts_reset");
        Ok(())
    }

    pub fn zone_stats(&self, name: &str, now: Timestamp) -> Result<ZoneStats, ZoneError> {
        self.zones.get(name).map(|z| z.stats(now)).ok_or_else(|| self.zone_not_found(name))
    }

    pub fn dwell_details(&self, name: &str, now: Timestamp) -> Result<Vec<DwellDetail>, ZoneError> {
        self.zones
            .get(name)
            .map(|z| z.dwell.details(now))
            .ok_or_else(|| self.zone_not_found(name))
    }

    /// Counts-only view of every zone
    pub fn counts(&self) -> BTreeMap<String, ZoneCounts> {
        self.zones.iter().map(|(name, zone)| (name.clone(), zone.counts())).collect()
    }

    /// Persistable copy of the camera
    pub fn snapshot(&self) -> CameraRecord {
        CameraRecord {
            zones: self.zones.iter().map(|(name, zone)| (name.clone(), zone.record.clone())).collect(),
        }
    }

    fn zone_not_found(&self, name: &str) -> ZoneError {
        ZoneError::ZoneNotFound { camera_id: self.camera_id.clone(), zone: name.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t(ms: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn camera() -> CameraState {
        CameraState::new("camera1", CountingConfig::default())
    }

    #[test]
    fn test_default_zone_provisioning() {
        let camera = CameraState::with_default_zone("camera9", CountingConfig::default());
        assert_eq!(camera.zone_names(), vec![DEFAULT_ZONE_NAME.to_string()]);
        assert_eq!(*camera.zone(DEFAULT_ZONE_NAME).unwrap().rect(), DEFAULT_ZONE_RECT);
    }

    #[test]
    fn test_create_round_trip() {
        let mut camera = camera();
        let change = camera.upsert_zone("door", [10, 20], [300, 400]).unwrap();
        assert_eq!(change, ZoneChange::Created);

        let stats = camera.zone_stats("door", t(0)).unwrap();
        assert_eq!(stats.coordinates, ZoneRect::new([10, 20], [300, 400]).unwrap());
        assert_eq!(stats.in_count, 0);
        assert_eq!(stats.out_count, 0);
        assert_eq!(stats.current_occupancy, 0);
    }

    #[test]
    fn test_invalid_rectangle_leaves_zone_untouched() {
        let mut camera = camera();
        camera.upsert_zone("door", [10, 20], [300, 400]).unwrap();

        let err = camera.upsert_zone("door", [300, 20], [10, 400]).unwrap_err();
        assert!(matches!(err, ZoneError::InvalidRectangle { .. }));
        assert_eq!(camera.zone("door").unwrap().rect().top_left, [10, 20]);

        assert!(camera.upsert_zone("new", [5, 5], [5, 6]).is_err());
        assert!(camera.zone("new").is_none());
    }

    #[test]
    fn test_missing_zone_name() {
        let mut camera = camera();
        assert_eq!(camera.upsert_zone(" ", [0, 0], [1, 1]), Err(ZoneError::MissingField("zone")));
    }

    #[test]
    fn test_update_preserves_counts_and_clears_tracking() {
        let mut camera = camera();
        camera.upsert_zone("door", [0, 0], [100, 100]).unwrap();
        {
            let zone = camera.zones.get_mut("door").unwrap();
            zone.apply_count(PersonId(1), HistoryAction::Entered, t(0));
            zone.debounce.observe(PersonId(1), true, t(0));
            zone.dwell.update(PersonId(1), true, t(0));
            zone.set_inside_ids(vec![PersonId(1)]);
        }

        let change = camera.upsert_zone("door", [0, 0], [200, 200]).unwrap();
        assert_eq!(change, ZoneChange::Updated);

        let zone = camera.zone("door").unwrap();
        assert_eq!(zone.record().in_count, 1);
        assert_eq!(zone.record().history.len(), 1);
        assert!(zone.debounce().is_empty());
        assert!(zone.dwell().is_empty());
        assert!(zone.record().inside_ids.is_empty());
    }

    #[test]
    fn test_delete_zone() {
        let mut camera = camera();
        camera.upsert_zone("door", [0, 0], [100, 100]).unwrap();
        assert!(camera.delete_zone("door").is_ok());
        assert_eq!(
            camera.delete_zone("door"),
            Err(ZoneError::ZoneNotFound { camera_id: "camera1".into(), zone: "door".into() })
        );
    }

    #[test]
    fn test_reset_is_idempotent_and_keeps_rect_and_history() {
        let mut camera = camera();
        camera.upsert_zone("door", [0, 0], [100, 100]).unwrap();
        {
            let zone = camera.zones.get_mut("door").unwrap();
            zone.apply_count(PersonId(1), HistoryAction::Entered, t(0));
            zone.apply_count(PersonId(1), HistoryAction::Exited, t(2000));
            zone.dwell.update(PersonId(2), true, t(0));
        }

        camera.reset_zone("door").unwrap();
        let once = camera.snapshot();
        camera.reset_zone("door").unwrap();
        let twice = camera.snapshot();
        assert_eq!(once, twice);

        let record = &twice.zones["door"];
        assert_eq!(record.in_count, 0);
        assert_eq!(record.out_count, 0);
        assert!(record.inside_ids.is_empty());
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.rect, ZoneRect::new([0, 0], [100, 100]).unwrap());
        assert!(camera.zone("door").unwrap().dwell().is_empty());
    }

    #[test]
    fn test_reset_unknown_zone_declined() {
        let mut camera = camera();
        assert!(matches!(camera.reset_zone("nope"), Err(ZoneError::ZoneNotFound { .. })));
    }

    #[test]
    fn test_restore_skips_invalid_rectangles() {
        let json = r#"{"zones": {
            "ok": {"top_left": [0, 0], "bottom_right": [10, 10], "in_count": 4, "inside_ids": [3]},
            "bad": {"top_left": [10, 10], "bottom_right": [0, 0]}
        }}"#;
        let record: CameraRecord = serde_json::from_str(json).unwrap();
        let camera = CameraState::from_record("camera1", record, CountingConfig::default());

        assert_eq!(camera.zone_names(), vec!["ok".to_string()]);
        let zone = camera.zone("ok").unwrap();
        assert_eq!(zone.record().in_count, 4);
        // Occupancy is derived from tracking, which is not persisted
        assert!(zone.record().inside_ids.is_empty());
    }

    #[test]
    fn test_apply_count_history_format() {
        let mut zone = ZoneState::new(DEFAULT_ZONE_RECT, &CountingConfig::default());
        zone.apply_count(PersonId(7), HistoryAction::Entered, t(0));
        let event = &zone.record().history[0];
        assert_eq!(event.id, PersonId(7));
        assert_eq!(event.action, HistoryAction::Entered);
        assert_eq!(event.time.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn test_set_inside_ids_reports_change() {
        let mut zone = ZoneState::new(DEFAULT_ZONE_RECT, &CountingConfig::default());
        assert!(!zone.set_inside_ids(vec![]));
        assert!(zone.set_inside_ids(vec![PersonId(1)]));
        assert!(!zone.set_inside_ids(vec![PersonId(1)]));
    }
}
