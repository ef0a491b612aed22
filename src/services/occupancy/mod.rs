//! Zone occupancy orchestration
//!
//! The OccupancyService is the single entry point for detections and for
//! zone management:
//! - Per-camera state lives behind its own mutex; cameras never contend
//! - `process()` runs one frame through every zone of its camera atomically
//! - Reads take the same per-camera lock and return owned copies
//! - Egress and persistence are notified after the lock is released

mod frame;
#[cfg(test)]
mod tests;

use crate::domain::types::{Observation, ObservationError, PersonId, Point, Timestamp};
use crate::domain::zone::{
    CameraRecord, DwellDetail, HistoryAction, Snapshot, ZoneCounts, ZoneError, ZoneRect, ZoneStats,
    DEFAULT_ZONE_NAME,
};
use crate::infra::config::CountingConfig;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::{EgressSender, ZoneEventPayload};
use crate::services::reaper::{ReapStats, StaleTrackReaper};
use crate::services::registry::{CameraState, ZoneChange};
use chrono::Utc;
use frame::{run_zone_pass, FrameInput};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Camera selected for display when nothing else is known
pub const DEFAULT_CAMERA_ID: &str = "camera1";

/// Counts-only view of every zone of a camera
pub type CameraCounts = BTreeMap<String, ZoneCounts>;

/// A qualified entry or confirmed exit produced by one frame
#[derive(Debug, Clone, PartialEq)]
pub struct CountEvent {
    pub zone: String,
    pub person: PersonId,
    pub action: HistoryAction,
    /// Entry: the qualifying frame. Exit: when the person left.
    pub at: Timestamp,
    pub dwell_secs: f64,
}

/// Result of processing one frame for one camera
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub camera_id: String,
    pub events: SmallVec<[CountEvent; 4]>,
    /// Observations that could not be positioned; the rest of the frame still ran
    pub skipped: Vec<ObservationError>,
    pub reaped: ReapStats,
    /// True if this frame provisioned the camera with its default zone
    pub provisioned: bool,
}

impl BatchReport {
    pub fn entries(&self) -> usize {
        self.events.iter().filter(|e| e.action == HistoryAction::Entered).count()
    }

    pub fn exits(&self) -> usize {
        self.events.iter().filter(|e| e.action == HistoryAction::Exited).count()
    }
}

/// Per-zone gauge values for metrics exposition
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneGauge {
    pub camera_id: String,
    pub zone: String,
    pub in_count: u64,
    pub out_count: u64,
    pub occupancy: usize,
}

/// Owns all cameras and drives the occupancy state machine
pub struct OccupancyService {
    cameras: RwLock<FxHashMap<String, Arc<Mutex<CameraState>>>>,
    active_camera: RwLock<String>,
    counting: CountingConfig,
    reaper: StaleTrackReaper,
    metrics: Arc<Metrics>,
    egress: Option<EgressSender>,
    /// Bumped after every mutation; store and snapshot egress coalesce on it
    changes: watch::Sender<u64>,
}

impl OccupancyService {
    /// Create an empty service
    pub fn new(counting: CountingConfig, metrics: Arc<Metrics>, egress: Option<EgressSender>) -> Self {
        let (changes, _) = watch::channel(0u64);
        Self {
            cameras: RwLock::new(FxHashMap::default()),
            active_camera: RwLock::new(DEFAULT_CAMERA_ID.to_string()),
            counting,
            reaper: StaleTrackReaper::new(counting.debounce_stale_secs(), counting.dwell_stale_secs()),
            metrics,
            egress,
            changes,
        }
    }

    /// Create a service restored from a persisted snapshot
    ///
    /// Zones with invalid rectangles are skipped. The active camera is the
    /// first restored camera, or the default one if the snapshot is empty.
    pub fn from_snapshot(
        snapshot: Snapshot,
        counting: CountingConfig,
        metrics: Arc<Metrics>,
        egress: Option<EgressSender>,
    ) -> Self {
        let service = Self::new(counting, metrics, egress);
        {
            let mut cameras = service.cameras.write();
            for (camera_id, record) in snapshot {
                let camera = CameraState::from_record(&camera_id, record, counting);
                info!(camera = %camera_id, zones = %camera.zone_count(), "camera_restored");
                cameras.insert(camera_id, Arc::new(Mutex::new(camera)));
            }
        }
        if let Some(first) = service.cameras().into_iter().next() {
            *service.active_camera.write() = first;
        }
        service
    }

    #[inline]
    pub fn counting(&self) -> &CountingConfig {
        &self.counting
    }

    /// Process one frame of detections for `camera_id` at the current time
    pub fn process(&self, camera_id: &str, observations: &[Observation]) -> BatchReport {
        self.process_at(camera_id, observations, Utc::now())
    }

    /// Process one frame of detections for `camera_id` at `now`
    ///
    /// Unknown cameras are provisioned with the default zone. A malformed
    /// observation is skipped and reported; the person still counts as
    /// present in the frame.
    pub fn process_at(&self, camera_id: &str, observations: &[Observation], now: Timestamp) -> BatchReport {
        let started = Instant::now();
        let method = self.counting.position_method();

        let mut positions: SmallVec<[(PersonId, Point); 16]> = SmallVec::with_capacity(observations.len());
        let mut active_ids = FxHashSet::default();
        let mut skipped = Vec::new();
        for observation in observations {
            let person = observation.person_id();
            active_ids.insert(person);
            match observation.position(method) {
                Ok(point) => positions.push((person, point)),
                Err(e) => {
                    warn!(camera = %camera_id, person = %person, error = %e, "observation_skipped");
                    skipped.push(e);
                }
            }
        }

        let (camera, provisioned) = self.camera_or_provision(camera_id);
        let mut events: SmallVec<[CountEvent; 4]> = SmallVec::new();
        let mut reaped = ReapStats::default();
        let mut changed = provisioned;

        {
            let mut camera = camera.lock();
            let frame = FrameInput { camera_id, positions: &positions, active_ids: &active_ids, now };
            for (zone_name, zone) in camera.zones_mut() {
                let outcome = run_zone_pass(zone_name, zone, &frame, &self.counting, &self.reaper, &mut events);
                changed |= outcome.changed;
                reaped.merge(outcome.reaped);
            }
        }

        let report = BatchReport { camera_id: camera_id.to_string(), events, skipped, reaped, provisioned };

        self.metrics.record_observations(positions.len() as u64, report.skipped.len() as u64);
        self.metrics.record_counts(report.entries() as u64, report.exits() as u64);
        self.metrics.record_reaped(reaped.total() as u64);

        if let Some(ref sender) = self.egress {
            for event in &report.events {
                sender.send_zone_event(ZoneEventPayload::new(
                    camera_id,
                    &event.zone,
                    event.person.0,
                    event.action,
                    event.at,
                    event.dwell_secs,
                ));
            }
        }
        if changed {
            self.notify_changed();
        }

        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_frame_processed(latency_us);
        debug!(
            camera = %camera_id,
            observations = %observations.len(),
            events = %report.events.len(),
            skipped = %report.skipped.len(),
            reaped = %reaped.total(),
            latency_us = %latency_us,
            "frame_processed"
        );
        report
    }

    /// Create a zone or update its rectangle, provisioning the camera if needed
    pub fn create_or_update_zone(
        &self,
        camera_id: &str,
        zone: &str,
        top_left: [i32; 2],
        bottom_right: [i32; 2],
    ) -> Result<ZoneChange, ZoneError> {
        if camera_id.trim().is_empty() {
            return Err(ZoneError::MissingField("camera_id"));
        }
        if zone.trim().is_empty() {
            return Err(ZoneError::MissingField("zone"));
        }
        // Validate before provisioning so a rejected request leaves no trace
        ZoneRect::new(top_left, bottom_right)?;

        let camera = {
            let mut cameras = self.cameras.write();
            cameras
                .entry(camera_id.to_string())
                .or_insert_with(|| {
                    info!(camera = %camera_id, "camera_created");
                    Arc::new(Mutex::new(CameraState::new(camera_id, self.counting)))
                })
                .clone()
        };

        let change = camera.lock().upsert_zone(zone, top_left, bottom_right)?;
        self.notify_changed();
        Ok(change)
    }

    pub fn delete_zone(&self, camera_id: &str, zone: &str) -> Result<(), ZoneError> {
        self.camera(camera_id)?.lock().delete_zone(zone)?;
        self.notify_changed();
        Ok(())
    }

    pub fn reset_zone_counts(&self, camera_id: &str, zone: &str) -> Result<(), ZoneError> {
        self.camera(camera_id)?.lock().reset_zone(zone)?;
        self.notify_changed();
        Ok(())
    }

    /// Copy of every camera's persisted state
    pub fn full_snapshot(&self) -> Snapshot {
        self.camera_handles()
            .into_iter()
            .map(|(camera_id, camera)| {
                let record = camera.lock().snapshot();
                (camera_id, record)
            })
            .collect()
    }

    pub fn camera_snapshot(&self, camera_id: &str) -> Result<CameraRecord, ZoneError> {
        Ok(self.camera(camera_id)?.lock().snapshot())
    }

    /// In/out counts and history, for one camera or for all of them
    pub fn counts(&self, camera_id: Option<&str>) -> Result<BTreeMap<String, CameraCounts>, ZoneError> {
        match camera_id {
            Some(camera_id) => {
                let counts = self.camera(camera_id)?.lock().counts();
                Ok(BTreeMap::from([(camera_id.to_string(), counts)]))
            }
            None => Ok(self
                .camera_handles()
                .into_iter()
                .map(|(camera_id, camera)| {
                    let counts = camera.lock().counts();
                    (camera_id, counts)
                })
                .collect()),
        }
    }

    pub fn zone_stats(&self, camera_id: &str, zone: &str) -> Result<ZoneStats, ZoneError> {
        self.zone_stats_at(camera_id, zone, Utc::now())
    }

    pub fn zone_stats_at(&self, camera_id: &str, zone: &str, now: Timestamp) -> Result<ZoneStats, ZoneError> {
        self.camera(camera_id)?.lock().zone_stats(zone, now)
    }

    /// Per-person dwell list, longest current dwell first
    pub fn dwell_details(&self, camera_id: &str, zone: &str) -> Result<Vec<DwellDetail>, ZoneError> {
        self.dwell_details_at(camera_id, zone, Utc::now())
    }

    pub fn dwell_details_at(
        &self,
        camera_id: &str,
        zone: &str,
        now: Timestamp,
    ) -> Result<Vec<DwellDetail>, ZoneError> {
        self.camera(camera_id)?.lock().dwell_details(zone, now)
    }

    /// Select the camera shown by default; unknown cameras are declined
    pub fn set_active_camera(&self, camera_id: &str) -> Result<(), ZoneError> {
        if !self.cameras.read().contains_key(camera_id) {
            warn!(camera = %camera_id, "active_camera_unknown");
            return Err(ZoneError::CameraNotFound(camera_id.to_string()));
        }
        *self.active_camera.write() = camera_id.to_string();
        info!(camera = %camera_id, "active_camera_set");
        Ok(())
    }

    pub fn active_camera(&self) -> String {
        self.active_camera.read().clone()
    }

    /// Sorted camera ids
    pub fn cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Open dwell sessions across all cameras and zones
    pub fn tracked_people(&self) -> usize {
        self.camera_handles().iter().map(|(_, camera)| camera.lock().tracked_people()).sum()
    }

    /// In/out counts and occupancy of every zone, sorted by camera then zone
    pub fn zone_gauges(&self) -> Vec<ZoneGauge> {
        let mut gauges = Vec::new();
        for (camera_id, camera) in self.camera_handles() {
            let camera = camera.lock();
            for name in camera.zone_names() {
                if let Some(zone) = camera.zone(&name) {
                    let record = zone.record();
                    gauges.push(ZoneGauge {
                        camera_id: camera_id.clone(),
                        zone: name,
                        in_count: record.in_count,
                        out_count: record.out_count,
                        occupancy: record.inside_ids.len(),
                    });
                }
            }
        }
        gauges
    }

    /// Receiver that changes whenever the aggregate state was mutated
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn camera(&self, camera_id: &str) -> Result<Arc<Mutex<CameraState>>, ZoneError> {
        self.cameras
            .read()
            .get(camera_id)
            .cloned()
            .ok_or_else(|| ZoneError::CameraNotFound(camera_id.to_string()))
    }

    /// Clone the camera handles so no map lock is held while a camera is locked
    fn camera_handles(&self) -> Vec<(String, Arc<Mutex<CameraState>>)> {
        let mut handles: Vec<_> =
            self.cameras.read().iter().map(|(id, camera)| (id.clone(), camera.clone())).collect();
        handles.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    fn camera_or_provision(&self, camera_id: &str) -> (Arc<Mutex<CameraState>>, bool) {
        if let Some(camera) = self.cameras.read().get(camera_id) {
            return (camera.clone(), false);
        }

        let mut cameras = self.cameras.write();
        if let Some(camera) = cameras.get(camera_id) {
            return (camera.clone(), false);
        }
        info!(camera = %camera_id, zone = %DEFAULT_ZONE_NAME, "camera_provisioned");
        let camera = Arc::new(Mutex::new(CameraState::with_default_zone(camera_id, self.counting)));
        cameras.insert(camera_id.to_string(), camera.clone());
        (camera, true)
    }
}
