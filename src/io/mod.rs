//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving per-frame detections
//! - `mqtt_egress` - MQTT publisher for events, snapshots and metrics
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `store` - JSON snapshot persistence
//! - `http_api` - HTTP API for zone management, counts and Prometheus metrics

pub mod egress_channel;
pub mod http_api;
pub mod mqtt;
pub mod mqtt_egress;
pub mod store;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender, ZoneEventPayload};
pub use http_api::{start_http_server, ApiContext};
pub use mqtt_egress::{run_snapshot_egress, MqttPublisher};
pub use store::{run_store_writer, SnapshotStore};
