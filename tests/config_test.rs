//! Integration tests for configuration loading

use std::io::Write;
use tempfile::NamedTempFile;
use zone_counter::domain::types::PositionMethod;
use zone_counter::infra::Config;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[mqtt]
host = "test-host"
port = 1884
detections_topic = "cams/+/detections"
username = "counter"
password = "secret"

[counting]
zone_padding = 10
stability_threshold = 5
min_dwell_secs = 2.0
exit_grace_secs = 1.5
position_method = "center"

[store]
file = "/var/lib/zone-counter/zones.json"
flush_interval_ms = 250

[http]
port = 8080

[broker]
enabled = true
port = 1884

[mqtt_egress]
enabled = false
snapshot_interval_ms = 100
metrics_publish_interval_secs = 30

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_detections_topic(), "cams/+/detections");
    assert_eq!(config.mqtt_username(), Some("counter"));
    assert_eq!(config.mqtt_password(), Some("secret"));

    let counting = config.counting();
    assert_eq!(counting.zone_padding(), 10);
    assert_eq!(counting.stability_threshold(), 5);
    assert_eq!(counting.min_dwell_secs(), 2.0);
    assert_eq!(counting.exit_grace_secs(), 1.5);
    assert_eq!(counting.debounce_stale_secs(), 30.0);
    assert_eq!(counting.position_method(), PositionMethod::Center);

    assert_eq!(config.store_file(), "/var/lib/zone-counter/zones.json");
    assert_eq!(config.store_flush_interval_ms(), 250);
    assert_eq!(config.http_port(), 8080);
    assert!(config.broker_enabled());
    assert_eq!(config.broker_bind_address(), "0.0.0.0");
    assert_eq!(config.broker_port(), 1884);
    assert!(!config.mqtt_egress_enabled());
    assert_eq!(config.mqtt_egress_events_topic(), "zone-counter/events");
    assert_eq!(config.mqtt_egress_snapshot_interval_ms(), 100);
    assert_eq!(config.mqtt_egress_metrics_interval_secs(), 30);
    assert_eq!(config.metrics_interval_secs(), 15);
}

#[test]
fn test_invalid_counting_section_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[counting]\nmin_dwell_secs = 0.0\n").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("min_dwell_secs"));

    // load_from_path falls back to defaults
    let config = Config::load_from_path(temp_file.path().to_str().unwrap());
    assert_eq!(config.counting().min_dwell_secs(), 1.0);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_unparseable_file_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[counting\nzone_padding = ").unwrap();
    temp_file.flush().unwrap();
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.counting().stability_threshold(), 3);
    assert_eq!(config.store_file(), "zones.json");
}

#[test]
fn test_dev_config_parses() {
    let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml")).unwrap();
    assert_eq!(config.site_id(), "dev");
    assert_eq!(config.counting().zone_padding(), 30);
}
