//! Configuration loading and validation tests
//!
//! Tests focus on observable behaviour of loading a file: defaults, path
//! resolution and the errors a misconfigured device reports at startup.

use edge_telemetry::auth::SigningAlgorithm;
use edge_telemetry::config::{find_config_file, ConfigError, TelemetryConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

const FULL: &str = r#"
[device]
project_id = "my-project"
location = "europe-west1"
registry_id = "sensors"
device_id = "pump-7"
private_key_file = "keys/ec_private.pem"
algorithm = "ES256"
ca_certs = "/etc/ssl/roots.pem"

[broker]
url = "mqtts://mqtt.example.com:443"
keep_alive_secs = 30

[backoff]
min_secs = 2
max_secs = 64
jitter_ms = 250

[auth]
token_validity_mins = 60
rotation_margin_secs = 300

[telemetry]
events_sub_topic = "telemetry"
publish_interval_secs = 5
use_input_timestamp = true
input_ts_format = "%d/%m/%Y %H:%M"
output_ts_format = "%Y-%m-%dT%H:%M:%SZ"

[source]
path = "data/device_data.csv"
repeat = true
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("telemetry.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn test_config_loads_all_sections() {
    let dir = TempDir::new().unwrap();
    let config = TelemetryConfig::load_from_file(&write_config(&dir, FULL)).unwrap();

    assert_eq!(config.device.algorithm, SigningAlgorithm::Es256);
    assert_eq!(config.broker_settings().unwrap().port, 443);
    assert_eq!(config.topics().events(), "/devices/pump-7/telemetry");
    assert_eq!(config.publish_interval(), Duration::from_secs(5));
    assert!(config.source.repeat);

    let settings = config.connection_settings();
    assert_eq!(settings.min_backoff, Duration::from_secs(2));
    assert_eq!(settings.max_backoff, Duration::from_secs(64));
    assert_eq!(settings.max_jitter, Duration::from_millis(250));
    assert_eq!(settings.rotation_margin, Duration::from_secs(300));

    let options = config.payload_options();
    assert!(options.use_input_timestamp);
    assert_eq!(options.input_ts_format, "%d/%m/%Y %H:%M");
}

#[test]
fn test_relative_paths_resolve_against_config_dir() {
    let dir = TempDir::new().unwrap();
    let config = TelemetryConfig::load_from_file(&write_config(&dir, FULL)).unwrap();

    assert_eq!(
        config.device.private_key_file,
        dir.path().join("keys/ec_private.pem")
    );
    assert_eq!(config.source.path, dir.path().join("data/device_data.csv"));
    // Absolute paths are kept
    assert_eq!(
        config.device.ca_certs,
        std::path::PathBuf::from("/etc/ssl/roots.pem")
    );
}

#[test]
fn test_missing_file_is_read_error() {
    let result = TelemetryConfig::load_from_file(std::path::Path::new("/nonexistent/telemetry.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_is_parse_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[device\nproject_id = ").unwrap();
    assert!(matches!(
        TelemetryConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_missing_required_section() {
    let without_source = FULL.split("[source]").next().unwrap();
    assert!(matches!(
        TelemetryConfig::parse(without_source),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_unknown_algorithm_rejected() {
    let bad = FULL.replace("\"ES256\"", "\"HS256\"");
    assert!(TelemetryConfig::parse(&bad).is_err());
}

#[test]
fn test_validation_errors() {
    let cases = [
        FULL.replace("registry_id = \"sensors\"", "registry_id = \"\""),
        FULL.replace("events_sub_topic = \"telemetry\"", "events_sub_topic = \"events/+\""),
        FULL.replace("keep_alive_secs = 30", "keep_alive_secs = 2"),
        FULL.replace("min_secs = 2", "min_secs = 0"),
        FULL.replace("publish_interval_secs = 5", "publish_interval_secs = 0"),
        FULL.replace("rotation_margin_secs = 300", "rotation_margin_secs = 3600"),
        FULL.replace("%d/%m/%Y %H:%M", "%d/%m/%Y %H:%"),
        FULL.replace("mqtts://mqtt.example.com:443", "not a url"),
    ];

    for case in cases {
        assert!(TelemetryConfig::parse(&case).is_err(), "accepted:\n{case}");
    }
}

#[test]
fn test_explicit_config_path_wins() {
    let found = find_config_file(Some(std::path::Path::new("custom.toml"))).unwrap();
    assert_eq!(found, std::path::PathBuf::from("custom.toml"));
}
