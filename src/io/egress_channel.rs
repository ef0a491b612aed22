//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::types::Timestamp;
use crate::domain::zone::HistoryAction;
use crate::infra::metrics::{Metrics, MetricsSummary};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Qualified entry or confirmed exit
    ZoneEvent(ZoneEventPayload),
    /// Full aggregate snapshot (retained)
    Snapshot(SnapshotPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Milliseconds since the Unix epoch, clamped at zero
#[inline]
pub fn epoch_ms(ts: Timestamp) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

/// Payload for count-affecting zone events
#[derive(Debug, Clone, Serialize)]
pub struct ZoneEventPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Camera ID
    pub cam: String,
    /// Zone name
    pub zone: String,
    /// Track ID from the inference pipeline
    pub tid: i64,
    /// Event type (entered, exited)
    pub t: &'static str,
    /// Event time (epoch ms); the exit time for exits
    pub ts: u64,
    /// Dwell in the zone at the time of the event (seconds)
    pub dwell_s: f64,
}

impl ZoneEventPayload {
    pub fn new(
        cam: &str,
        zone: &str,
        tid: i64,
        action: HistoryAction,
        at: Timestamp,
        dwell_s: f64,
    ) -> Self {
        Self {
            site: None,
            cam: cam.to_string(),
            zone: zone.to_string(),
            tid,
            t: action.as_str(),
            ts: epoch_ms(at),
            dwell_s,
        }
    }
}

/// Payload for the serialized full snapshot
#[derive(Debug, Serialize)]
pub struct SnapshotPayload {
    pub json: String,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    #[serde(flatten)]
    pub summary: MetricsSummary,
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped and counted.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    /// Create a new sender from an mpsc sender
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    #[inline]
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    fn try_send(&self, msg: EgressMessage) {
        // Use try_send to avoid blocking - drop if channel full
        if self.tx.try_send(msg).is_err() {
            self.metrics.record_egress_dropped();
        }
    }

    /// Send a zone event
    /// Injects site_id into the payload
    pub fn send_zone_event(&self, mut payload: ZoneEventPayload) {
        payload.site = Some(self.site_id.clone());
        self.try_send(EgressMessage::ZoneEvent(payload));
    }

    /// Send a serialized snapshot
    pub fn send_snapshot(&self, json: String) {
        self.try_send(EgressMessage::Snapshot(SnapshotPayload { json }));
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary, now: Timestamp) {
        let payload = MetricsPayload { site: self.site_id.clone(), ts: epoch_ms(now), summary };
        self.try_send(EgressMessage::Metrics(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, metrics), rx)
}
