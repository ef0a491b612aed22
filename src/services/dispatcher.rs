//! Per-camera frame workers - one single-writer task per camera
//!
//! Ingest pushes every detection frame into one channel. The dispatcher fans
//! frames out to a worker per camera so that frames of one camera are
//! processed strictly in arrival order while cameras run in parallel.
//! Workers are spawned on the first frame of each camera.

use crate::domain::types::DetectionFrame;
use crate::infra::metrics::Metrics;
use crate::services::occupancy::OccupancyService;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Worker that owns the processing order of one camera
pub struct CameraWorker {
    camera_id: String,
    service: Arc<OccupancyService>,
    frame_rx: mpsc::Receiver<DetectionFrame>,
}

impl CameraWorker {
    pub fn new(camera_id: String, service: Arc<OccupancyService>, frame_rx: mpsc::Receiver<DetectionFrame>) -> Self {
        Self { camera_id, service, frame_rx }
    }

    /// Run the worker, processing frames until the channel closes
    pub async fn run(mut self) {
        info!(camera = %self.camera_id, "camera_worker_started");

        while let Some(frame) = self.frame_rx.recv().await {
            let report = self.service.process_at(&frame.camera_id, &frame.observations, frame.received_at);
            if !report.events.is_empty() || !report.skipped.is_empty() {
                debug!(
                    camera = %self.camera_id,
                    entries = %report.entries(),
                    exits = %report.exits(),
                    skipped = %report.skipped.len(),
                    "camera_frame_done"
                );
            }
        }

        info!(camera = %self.camera_id, "camera_worker_stopped");
    }
}

/// Routes frames to per-camera workers
pub struct FrameDispatcher {
    service: Arc<OccupancyService>,
    metrics: Arc<Metrics>,
    workers: FxHashMap<String, mpsc::Sender<DetectionFrame>>,
    buffer_size: usize,
    last_drop_warn: Instant,
}

impl FrameDispatcher {
    pub fn new(service: Arc<OccupancyService>, metrics: Arc<Metrics>, buffer_size: usize) -> Self {
        Self {
            service,
            metrics,
            workers: FxHashMap::default(),
            buffer_size,
            last_drop_warn: Instant::now() - Duration::from_secs(2),
        }
    }

    /// Hand a frame to its camera's worker, spawning it if needed
    ///
    /// Returns false if the frame was dropped because the worker is backlogged.
    pub fn dispatch(&mut self, frame: DetectionFrame) -> bool {
        if self.workers.get(&frame.camera_id).map_or(true, |tx| tx.is_closed()) {
            self.spawn_worker(&frame.camera_id);
        }
        let Some(tx) = self.workers.get(&frame.camera_id) else {
            return false;
        };

        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                self.metrics.record_frame_dropped();
                // Rate-limit drop warnings to 1 per second
                if self.last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(camera = %frame.camera_id, "camera_frame_dropped: worker queue full");
                    self.last_drop_warn = Instant::now();
                }
                false
            }
            Err(TrySendError::Closed(frame)) => {
                warn!(camera = %frame.camera_id, "camera_worker_closed");
                self.workers.remove(&frame.camera_id);
                false
            }
        }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&mut self, camera_id: &str) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let worker = CameraWorker::new(camera_id.to_string(), self.service.clone(), rx);
        tokio::spawn(worker.run());
        self.workers.insert(camera_id.to_string(), tx);
    }

    /// Consume ingest frames until the channel closes or shutdown is signalled
    ///
    /// Dropping the dispatcher closes every worker channel, so workers finish
    /// their queued frames and exit.
    pub async fn run(mut self, mut frame_rx: mpsc::Receiver<DetectionFrame>, mut shutdown: watch::Receiver<bool>) {
        info!("frame_dispatcher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(workers = %self.workers.len(), "frame_dispatcher_shutdown");
                        break;
                    }
                }
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            self.dispatch(frame);
                        }
                        None => break, // Channel closed
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Observation;
    use crate::infra::config::CountingConfig;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn frame(camera_id: &str, ms: i64, observations: Vec<Observation>) -> DetectionFrame {
        DetectionFrame {
            camera_id: camera_id.to_string(),
            observations,
            received_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::milliseconds(ms),
        }
    }

    fn create_service(metrics: Arc<Metrics>) -> Arc<OccupancyService> {
        Arc::new(OccupancyService::new(CountingConfig::default(), metrics, None))
    }

    #[tokio::test]
    async fn test_frames_processed_in_order_per_camera() {
        let metrics = Arc::new(Metrics::new());
        let service = create_service(metrics.clone());
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = FrameDispatcher::new(service.clone(), metrics.clone(), 64);
        let handle = tokio::spawn(dispatcher.run(frame_rx, shutdown_rx));

        let person = Observation::point(7, 960.0, 500.0);
        for cam in ["camera1", "camera2"] {
            for ms in [0, 100, 200, 1200] {
                frame_tx.send(frame(cam, ms, vec![person])).await.unwrap();
            }
        }

        // Wait for the workers to drain
        for _ in 0..100 {
            if metrics.frames_total() == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.frames_total(), 8);
        for cam in ["camera1", "camera2"] {
            assert_eq!(service.zone_stats(cam, "zone1").unwrap().in_count, 1);
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_one_worker_per_camera() {
        let metrics = Arc::new(Metrics::new());
        let mut dispatcher = FrameDispatcher::new(create_service(metrics.clone()), metrics, 8);
        assert!(dispatcher.dispatch(frame("a", 0, vec![])));
        assert!(dispatcher.dispatch(frame("a", 100, vec![])));
        assert!(dispatcher.dispatch(frame("b", 0, vec![])));
        assert_eq!(dispatcher.worker_count(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_worker_queue_drops_frame() {
        let metrics = Arc::new(Metrics::new());
        let mut dispatcher = FrameDispatcher::new(create_service(metrics.clone()), metrics.clone(), 1);
        // The worker cannot run before this task yields, so the queue stays full
        assert!(dispatcher.dispatch(frame("a", 0, vec![])));
        assert!(!dispatcher.dispatch(frame("a", 100, vec![])));
        assert_eq!(metrics.frames_dropped(), 1);
    }
}
