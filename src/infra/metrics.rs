//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention with the
//! per-camera locks. Reporting is the only operation that resets anything
//! (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Upper bounds of the finite latency buckets, in microseconds.
/// One more bucket catches everything above the last bound.
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = BUCKET_BOUNDS.len() + 1;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Frame latency histogram with running sum and max
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

/// Point-in-time copy of a `LatencyHistogram`
#[derive(Debug, Clone, Copy, Default)]
struct LatencyWindow {
    buckets: [u64; NUM_BUCKETS],
    sum_us: u64,
    max_us: u64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Read without resetting
    fn peek(&self) -> LatencyWindow {
        LatencyWindow {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            sum_us: self.sum_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }

    /// Read and zero every field
    fn take(&self) -> LatencyWindow {
        LatencyWindow {
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
        }
    }
}

impl LatencyWindow {
    /// Upper bound of the bucket holding the given quantile; the overflow
    /// bucket reports twice the last finite bound
    fn quantile(&self, q: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64 * q).ceil() as u64).max(1);
        let overflow_bound = BUCKET_BOUNDS[BUCKET_BOUNDS.len() - 1] * 2;

        let mut seen = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return BUCKET_BOUNDS.get(i).copied().unwrap_or(overflow_bound);
            }
        }
        overflow_bound
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total frames processed (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Frame processing latency for the current report window
    latency: LatencyHistogram,
    /// Frame processing latency since startup (never reset)
    latency_total: LatencyHistogram,
    /// Observations fed through the state machine (monotonic)
    observations_total: AtomicU64,
    /// Malformed observations skipped (monotonic)
    observations_skipped: AtomicU64,
    /// Qualified entries counted (monotonic)
    entries_total: AtomicU64,
    /// Confirmed exits counted (monotonic)
    exits_total: AtomicU64,
    /// Debounce + dwell entries dropped by the reaper (monotonic)
    reaped_total: AtomicU64,
    /// Detection frames dropped due to ingest channel full (monotonic)
    frames_dropped: AtomicU64,
    /// Egress messages dropped due to channel full (monotonic)
    egress_dropped: AtomicU64,
    /// Snapshot writes that failed (monotonic)
    store_failures: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
            latency_total: LatencyHistogram::new(),
            observations_total: AtomicU64::new(0),
            observations_skipped: AtomicU64::new(0),
            entries_total: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            reaped_total: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame was processed with given latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency_us);
        self.latency_total.record(latency_us);
    }

    #[inline]
    pub fn record_observations(&self, processed: u64, skipped: u64) {
        self.observations_total.fetch_add(processed, Ordering::Relaxed);
        if skipped > 0 {
            self.observations_skipped.fetch_add(skipped, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_counts(&self, entries: u64, exits: u64) {
        if entries > 0 {
            self.entries_total.fetch_add(entries, Ordering::Relaxed);
        }
        if exits > 0 {
            self.exits_total.fetch_add(exits, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_reaped(&self, removed: u64) {
        if removed > 0 {
            self.reaped_total.fetch_add(removed, Ordering::Relaxed);
        }
    }

    /// Record a detection frame dropped due to channel full
    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an egress message dropped due to channel full
    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn observations_total(&self) -> u64 {
        self.observations_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn observations_skipped(&self) -> u64 {
        self.observations_skipped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn entries_total(&self) -> u64 {
        self.entries_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn exits_total(&self) -> u64 {
        self.exits_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reaped_total(&self) -> u64 {
        self.reaped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Latency sum since startup
    pub fn latency_sum_us(&self) -> u64 {
        self.latency_total.peek().sum_us
    }

    /// Per-bucket latency counts since startup; `report()` does not touch these
    pub fn latency_buckets(&self) -> [u64; NUM_BUCKETS] {
        self.latency_total.peek().buckets
    }

    /// Summarise the window since the previous report and start a new one
    ///
    /// Monotonic totals are read, never reset.
    pub fn report(&self, cameras: usize, tracked_people: usize) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let window = self.latency.take();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            frames_total: self.frames_total(),
            frames_per_sec,
            avg_process_latency_us: window.sum_us.checked_div(frames_count).unwrap_or(0),
            max_process_latency_us: window.max_us,
            lat_buckets: window.buckets,
            lat_p50_us: window.quantile(0.50),
            lat_p95_us: window.quantile(0.95),
            lat_p99_us: window.quantile(0.99),
            cameras,
            tracked_people,
            observations_total: self.observations_total(),
            observations_skipped: self.observations_skipped(),
            entries_total: self.entries_total(),
            exits_total: self.exits_total(),
            reaped_total: self.reaped_total(),
            frames_dropped: self.frames_dropped(),
            egress_dropped: self.egress_dropped(),
            store_failures: self.store_failures(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Per-bucket frame counts, bounds as in `METRICS_BUCKET_BOUNDS` plus overflow
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    /// Cameras currently known to the service
    pub cameras: usize,
    /// Open dwell sessions across all zones
    pub tracked_people: usize,
    pub observations_total: u64,
    pub observations_skipped: u64,
    pub entries_total: u64,
    pub exits_total: u64,
    pub reaped_total: u64,
    pub frames_dropped: u64,
    pub egress_dropped: u64,
    pub store_failures: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p50_us = %self.lat_p50_us,
            p99_us = %self.lat_p99_us,
            cameras = %self.cameras,
            tracked = %self.tracked_people,
            entries = %self.entries_total,
            exits = %self.exits_total,
            skipped = %self.observations_skipped,
            dropped = %self.frames_dropped,
            "metrics"
        );
    }
}
