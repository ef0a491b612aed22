//! Snapshot store - persists zone state to a JSON file
//!
//! Layout: camera_id -> {zones: name -> {top_left, bottom_right, in_count,
//! out_count, inside_ids, history}}. Writes go to a temp file first and are
//! renamed over the target so readers never see a partial file.

use crate::domain::zone::{CameraRecord, Snapshot, ZoneRecord, DEFAULT_ZONE_NAME, DEFAULT_ZONE_RECT};
use crate::infra::metrics::Metrics;
use crate::services::occupancy::{OccupancyService, DEFAULT_CAMERA_ID};
use anyhow::Context;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Snapshot with the default camera and its default zone
pub fn default_snapshot() -> Snapshot {
    let mut camera = CameraRecord::default();
    camera.zones.insert(DEFAULT_ZONE_NAME.to_string(), ZoneRecord::new(DEFAULT_ZONE_RECT));
    Snapshot::from([(DEFAULT_CAMERA_ID.to_string(), camera)])
}

/// JSON file holding the persisted snapshot
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file = %path.display(), "store_initialized");
        Self { path }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored snapshot; `Ok(None)` if the file does not exist
    pub fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read store file: {}", self.path.display()))
            }
        };
        let snapshot: Snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse store file: {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// Read the stored snapshot, falling back to the default camera and zone
    /// when the file is missing or unreadable
    pub fn load_or_default(&self) -> Snapshot {
        match self.load() {
            Ok(Some(snapshot)) => {
                info!(file = %self.path.display(), cameras = %snapshot.len(), "store_loaded");
                snapshot
            }
            Ok(None) => {
                info!(file = %self.path.display(), "store_missing_using_default");
                default_snapshot()
            }
            Err(e) => {
                warn!(file = %self.path.display(), error = %format!("{e:#}"), "store_corrupt_using_default");
                default_snapshot()
            }
        }
    }

    /// Atomically replace the store file with `snapshot`
    pub fn save(&self, snapshot: &Snapshot) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(file = %self.path.display(), bytes = %json.len(), "store_written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Persist the service state whenever it changes
///
/// Changes within `flush_interval` of each other are written once. A failed
/// write is logged and counted; the in-memory state stays authoritative and
/// the next change retries. A final write happens on shutdown.
pub async fn run_store_writer(
    service: Arc<OccupancyService>,
    store: SnapshotStore,
    metrics: Arc<Metrics>,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = service.subscribe_changes();
    info!(file = %store.path().display(), flush_ms = %flush_interval.as_millis(), "store_writer_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    flush(&service, &store, &metrics);
                    info!("store_writer_shutdown");
                    return;
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
                tokio::time::sleep(flush_interval).await;
                changes.borrow_and_update();
                flush(&service, &store, &metrics);
            }
        }
    }
}

fn flush(service: &OccupancyService, store: &SnapshotStore, metrics: &Metrics) {
    if let Err(e) = store.save(&service.full_snapshot()) {
        metrics.record_store_failure();
        error!(file = %store.path().display(), error = %e, "store_write_failed");
    }
}
