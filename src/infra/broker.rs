//! Embedded MQTT broker using rumqttd
//!
//! Lets a single box run the inference pipeline, the counter and the
//! dashboard without an external broker.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Largest publish accepted by the broker; full snapshots can be large
const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Build the rumqttd configuration for a single MQTT v4 listener
fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 104857600,
        max_segment_count: 10,
        max_connections: 256,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_BYTES,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread
///
/// Fails only if the configured bind address is invalid; a broker that
/// fails to start later is logged.
pub fn start_embedded_broker(app_config: &AppConfig) -> anyhow::Result<()> {
    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr =
        addr_str.parse().with_context(|| format!("invalid broker bind address: {addr_str}"))?;

    let config = broker_config(listen);
    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            // start() blocks for the lifetime of the broker
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("failed to spawn broker thread")?;

    // Give the listener time to bind before clients connect
    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    Ok(())
}
