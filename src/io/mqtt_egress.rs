//! MQTT publisher for egress messages
//!
//! Publishes counter output to MQTT topics for downstream consumers:
//! - zone-counter/events - Qualified entries and confirmed exits (QoS 0)
//! - zone-counter/snapshot - Full aggregate snapshot after changes (QoS 1, retained)
//! - zone-counter/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::{EgressMessage, EgressSender};
use crate::services::occupancy::OccupancyService;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    events_topic: String,
    snapshot_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("{}-egress-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            events_topic: config.mqtt_egress_events_topic().to_string(),
            snapshot_topic: config.mqtt_egress_snapshot_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
        }
    }

    /// Run the publisher loop until shutdown, draining queued messages on exit
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            events = %self.events_topic,
            snapshot = %self.snapshot_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::ZoneEvent(payload) => {
                // Fire-and-forget; the snapshot carries the authoritative counts
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) =
                        self.client.publish(&self.events_topic, QoS::AtMostOnce, false, json.into_bytes()).await
                    {
                        debug!(error = %e, "mqtt_egress_event_failed");
                    }
                }
            }
            EgressMessage::Snapshot(payload) => {
                if let Err(e) = self
                    .client
                    .publish(&self.snapshot_topic, QoS::AtLeastOnce, true, payload.json.into_bytes())
                    .await
                {
                    error!(error = %e, "mqtt_egress_snapshot_failed");
                }
            }
            EgressMessage::Metrics(payload) => {
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) =
                        self.client.publish(&self.metrics_topic, QoS::AtMostOnce, false, json.into_bytes()).await
                    {
                        debug!(error = %e, "mqtt_egress_metrics_failed");
                    }
                }
            }
        }
    }
}

/// Publish the full snapshot whenever the service reports a change
///
/// Changes arriving within `min_interval` of the last publish are coalesced
/// into the next one. One snapshot is published at startup so the retained
/// message reflects the restored state.
pub async fn run_snapshot_egress(
    service: Arc<OccupancyService>,
    sender: EgressSender,
    min_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = service.subscribe_changes();
    publish_snapshot(&service, &sender);
    info!(interval_ms = %min_interval.as_millis(), "snapshot_egress_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    publish_snapshot(&service, &sender);
                    info!("snapshot_egress_shutdown");
                    return;
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
                tokio::time::sleep(min_interval).await;
                changes.borrow_and_update();
                publish_snapshot(&service, &sender);
            }
        }
    }
}

fn publish_snapshot(service: &OccupancyService, sender: &EgressSender) {
    match serde_json::to_string(&service.full_snapshot()) {
        Ok(json) => sender.send_snapshot(json),
        Err(e) => error!(error = %e, "snapshot_serialize_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Observation;
    use crate::infra::config::CountingConfig;
    use crate::infra::metrics::Metrics;
    use crate::io::egress_channel::create_egress_channel;

    #[tokio::test]
    async fn test_snapshot_egress_publishes_on_change() {
        let metrics = Arc::new(Metrics::new());
        let service = Arc::new(OccupancyService::new(CountingConfig::default(), metrics.clone(), None));
        let (sender, mut rx) = create_egress_channel(16, "site".to_string(), metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_snapshot_egress(
            service.clone(),
            sender,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        // Startup snapshot
        match rx.recv().await {
            Some(EgressMessage::Snapshot(payload)) => assert_eq!(payload.json, "{}"),
            other => panic!("unexpected message: {other:?}"),
        }

        service.process("camera1", &[Observation::point(1, 960.0, 500.0)]);
        match rx.recv().await {
            Some(EgressMessage::Snapshot(payload)) => {
                let value: serde_json::Value = serde_json::from_str(&payload.json).unwrap();
                assert!(value["camera1"]["zones"]["zone1"].is_object());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
