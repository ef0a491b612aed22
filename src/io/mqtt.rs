//! MQTT client for receiving per-frame person detections

use crate::domain::types::{DetectionFrame, Observation, Timestamp};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::occupancy::DEFAULT_CAMERA_ID;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// One frame as published by the inference pipeline
#[derive(Debug, Deserialize)]
struct DetectionMessage {
    #[serde(default)]
    camera_id: Option<String>,
    #[serde(default)]
    detections: Vec<serde_json::Value>,
}

/// Accepted shapes of a single detection
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDetection {
    BoundingBox { id: i64, bbox: [f64; 4] },
    Point { id: i64, point: [f64; 2] },
    /// `[id, x1, y1, x2, y2]`
    BoxTuple(i64, f64, f64, f64, f64),
    /// `[id, x, y]`
    PointTuple(i64, f64, f64),
}

impl From<WireDetection> for Observation {
    fn from(wire: WireDetection) -> Self {
        match wire {
            WireDetection::BoundingBox { id, bbox: [x1, y1, x2, y2] }
            | WireDetection::BoxTuple(id, x1, y1, x2, y2) => Observation::bbox(id, x1, y1, x2, y2),
            WireDetection::Point { id, point: [x, y] } | WireDetection::PointTuple(id, x, y) => {
                Observation::point(id, x, y)
            }
        }
    }
}

/// A parsed frame plus the number of detections that had an unknown shape
#[derive(Debug)]
pub struct ParsedDetections {
    pub frame: DetectionFrame,
    /// Includes detections kept as `Observation::Unreadable`
    pub malformed: usize,
}

/// Integer id of a detection whose shape is otherwise unusable
fn salvage_id(raw: &serde_json::Value) -> Option<i64> {
    match raw {
        serde_json::Value::Object(fields) => fields.get("id")?.as_i64(),
        serde_json::Value::Array(items) => items.first()?.as_i64(),
        _ => None,
    }
}

/// Camera id carried by the topic suffix, e.g. `zone-counter/detections/camera2`
fn camera_from_topic(topic: &str) -> Option<&str> {
    let (_, suffix) = topic.rsplit_once('/')?;
    if suffix.is_empty() || suffix == "detections" || suffix == "#" || suffix == "+" {
        return None;
    }
    Some(suffix)
}

/// Parse a detection payload into a frame
///
/// The camera id comes from the payload, then the topic suffix, then the
/// default camera. Detections of unknown shape are counted; those that still
/// carry an integer id become `Observation::Unreadable` so the person stays
/// present in the frame.
pub fn parse_detection_message(
    topic: &str,
    json_str: &str,
    received_at: Timestamp,
) -> Result<ParsedDetections, serde_json::Error> {
    let message: DetectionMessage = serde_json::from_str(json_str)?;

    let camera_id = message
        .camera_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| camera_from_topic(topic).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string());

    let mut observations = Vec::with_capacity(message.detections.len());
    let mut malformed = 0;
    for raw in message.detections {
        let id = salvage_id(&raw);
        match serde_json::from_value::<WireDetection>(raw) {
            Ok(wire) => observations.push(Observation::from(wire)),
            Err(_) => {
                malformed += 1;
                if let Some(id) = id {
                    observations.push(Observation::unreadable(id));
                }
            }
        }
    }

    Ok(ParsedDetections { frame: DetectionFrame { camera_id, observations, received_at }, malformed })
}

/// Start the MQTT client and forward parsed frames to the channel
///
/// Frames are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped frames are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    frame_tx: mpsc::Sender<DetectionFrame>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("{}-ingest", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(1024 * 1024, 1024 * 1024);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_detections_topic(), QoS::AtMostOnce).await?;

    info!(
        topic = %config.mqtt_detections_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_ingest_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Utc::now();
                        let topic = &publish.topic;
                        let json_str = match std::str::from_utf8(&publish.payload) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(topic = %topic, error = %e, "detection_payload_invalid_utf8");
                                continue;
                            }
                        };

                        let parsed = match parse_detection_message(topic, json_str, received_at) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!(topic = %topic, error = %e, "detection_payload_unparseable");
                                continue;
                            }
                        };

                        if parsed.malformed > 0 {
                            warn!(
                                camera = %parsed.frame.camera_id,
                                malformed = %parsed.malformed,
                                "detection_malformed_skipped"
                            );
                        }
                        debug!(
                            camera = %parsed.frame.camera_id,
                            detections = %parsed.frame.observations.len(),
                            "detection_frame_received"
                        );

                        match frame_tx.try_send(parsed.frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                metrics.record_frame_dropped();
                                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                    warn!("mqtt_frame_dropped: channel full");
                                    last_drop_warn = Instant::now();
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("frame_channel_closed");
                                return Ok(());
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
