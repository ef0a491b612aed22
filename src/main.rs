//! Zone counter - per-camera zone entry/exit counting from person detections
//!
//! Turns flicker-prone per-frame detections into debounced, dwell-qualified
//! zone entry and exit counts.
//!
//! Module structure:
//! - `domain/` - Core types (Observation, ZoneRect, ZoneRecord)
//! - `io/` - External interfaces (MQTT ingest/egress, HTTP API, snapshot store)
//! - `services/` - Occupancy state machine and per-camera workers
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use zone_counter::infra::metrics::MetricsSummary;
use zone_counter::infra::{Config, Metrics};
use zone_counter::io::{
    create_egress_channel, run_snapshot_egress, run_store_writer, start_http_server, ApiContext,
    MqttPublisher, SnapshotStore,
};
use zone_counter::services::{FrameDispatcher, OccupancyService};

/// Ingest frames buffered before the MQTT loop starts dropping
const FRAME_CHANNEL_SIZE: usize = 1000;
/// Frames buffered per camera worker
const CAMERA_QUEUE_SIZE: usize = 256;
const EGRESS_CHANNEL_SIZE: usize = 1000;

/// Zone counter - debounced zone entry/exit counting
#[derive(Parser, Debug)]
#[command(name = "zone-counter", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level, e.g. RUST_LOG=zone_counter=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "zone_counter_starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let counting = *config.counting();
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        detections_topic = %config.mqtt_detections_topic(),
        zone_padding = %counting.zone_padding(),
        stability_threshold = %counting.stability_threshold(),
        min_dwell_secs = %counting.min_dwell_secs(),
        exit_grace_secs = %counting.exit_grace_secs(),
        position_method = %counting.position_method().as_str(),
        store_file = %config.store_file(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    if config.broker_enabled() {
        zone_counter::infra::broker::start_embedded_broker(&config)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // MQTT egress publisher (if enabled)
    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(EGRESS_CHANNEL_SIZE, config.site_id().to_string(), metrics.clone());
        let publisher = MqttPublisher::new(&config, egress_rx);
        tokio::spawn(publisher.run(shutdown_rx.clone()));
        Some(egress_sender)
    } else {
        None
    };

    // Restore persisted state and build the service
    let store = SnapshotStore::new(config.store_file());
    let snapshot = store.load_or_default();
    let service =
        Arc::new(OccupancyService::from_snapshot(snapshot, counting, metrics.clone(), egress_sender.clone()));
    info!(cameras = ?service.cameras(), active_camera = %service.active_camera(), "occupancy_service_ready");

    let store_writer = tokio::spawn(run_store_writer(
        service.clone(),
        store,
        metrics.clone(),
        Duration::from_millis(config.store_flush_interval_ms()),
        shutdown_rx.clone(),
    ));

    // Metrics reporter; the latest summary is also handed to egress
    let (summary_tx, summary_rx) = watch::channel::<Option<MetricsSummary>>(None);
    let reporter_service = service.clone();
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary =
                reporter_metrics.report(reporter_service.cameras().len(), reporter_service.tracked_people());
            summary.log();
            let _ = summary_tx.send(Some(summary));
        }
    });

    if let Some(ref sender) = egress_sender {
        tokio::spawn(run_snapshot_egress(
            service.clone(),
            sender.clone(),
            Duration::from_millis(config.mqtt_egress_snapshot_interval_ms()),
            shutdown_rx.clone(),
        ));

        let metrics_egress = sender.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                let latest = summary_rx.borrow().clone();
                if let Some(summary) = latest {
                    metrics_egress.send_metrics(summary, Utc::now());
                }
            }
        });
    }

    // HTTP API (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let ctx = Arc::new(ApiContext {
            service: service.clone(),
            metrics: metrics.clone(),
            site_id: config.site_id().to_string(),
        });
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, ctx, http_shutdown).await {
                error!(error = %format!("{e:#}"), "http_api_error");
            }
        });
    }

    // MQTT detection ingest
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            zone_counter::io::mqtt::start_mqtt_client(&mqtt_config, frame_tx, mqtt_metrics, mqtt_shutdown).await
        {
            error!(error = %format!("{e:#}"), "mqtt_client_error");
        }
    });

    // Dispatch frames to per-camera workers until Ctrl+C or ingest stops
    let dispatcher = FrameDispatcher::new(service.clone(), metrics.clone(), CAMERA_QUEUE_SIZE);
    tokio::select! {
        _ = dispatcher.run(frame_rx, shutdown_rx.clone()) => {
            warn!("frame_dispatcher_stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
        }
    }
    let _ = shutdown_tx.send(true);

    // Final snapshot write
    if let Err(e) = store_writer.await {
        error!(error = %e, "store_writer_join_failed");
    }

    info!(
        entries = %metrics.entries_total(),
        exits = %metrics.exits_total(),
        frames = %metrics.frames_total(),
        "zone_counter_shutdown_complete"
    );
    Ok(())
}
