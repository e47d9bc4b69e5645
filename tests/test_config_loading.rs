//! Configuration loading and validation tests
//!
//! Tests focus on the behavior of loading files from disk: defaults, overrides
//! and the errors a misconfigured device reports at startup.

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use trackerlink::config::{ConfigError, GenericDispatch, TrackerConfig};

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_minimal_config_gets_defaults() {
    let file = write_config(
        r#"
[device]
identity = "350457791234567"

[mqtt]
broker_url = "mqtt://broker.local:1883"
"#,
    );

    let config = TrackerConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.device.identity, "350457791234567");
    assert_eq!(config.transport.generic_topic, "data");
    assert_eq!(config.transport.queue_depth, 20);
    assert_eq!(config.settle_delay(), Duration::from_secs(5));
    assert_eq!(config.reconnect_timeout(), Duration::from_secs(60));
    assert_eq!(config.transport.generic_dispatch, GenericDispatch::Queued);
    assert!(config.location.fixes_file.is_none());

    let topics = config.topics().unwrap();
    assert_eq!(topics.login, "ind/350457791234567/login");
    assert_eq!(topics.generic, "ind/350457791234567/data");
}

#[test]
fn test_overrides_are_applied() {
    let file = write_config(
        r#"
[device]
identity = "tracker-7"

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
keep_alive_secs = 120

[transport]
generic_topic = "sensors"
settle_delay_secs = 0
reconnect_timeout_secs = 30
queue_depth = 8
generic_dispatch = "direct"

[update]
host = "https://fw.example.com"

[location]
fixes_file = "fixes.jsonl"
fix_interval_ms = 250
"#,
    );

    let config = TrackerConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.keep_alive(), Duration::from_secs(120));
    assert_eq!(config.settle_delay(), Duration::ZERO);
    assert_eq!(config.reconnect_timeout(), Duration::from_secs(30));
    assert_eq!(config.transport.queue_depth, 8);
    assert_eq!(config.transport.generic_dispatch, GenericDispatch::Direct);
    assert_eq!(config.update.host, "https://fw.example.com");
    assert_eq!(config.location.fix_interval_ms, 250);
    assert_eq!(config.topics().unwrap().generic, "ind/tracker-7/sensors");
}

#[test]
fn test_missing_file_reports_read_error() {
    let path = std::path::Path::new("/nonexistent/trackerlink.toml");
    let result = TrackerConfig::load_from_file(path);
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_missing_device_section_fails_to_parse() {
    let file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );
    assert!(matches!(
        TrackerConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_identity_that_overflows_topics_is_rejected() {
    let file = write_config(&format!(
        r#"
[device]
identity = "{}"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
        "9".repeat(80)
    ));
    assert!(matches!(
        TrackerConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidIdentity(_))
    ));
}

#[test]
fn test_bad_broker_url_is_rejected() {
    let file = write_config(
        r#"
[device]
identity = "350457791234567"

[mqtt]
broker_url = "http://localhost:1883"
"#,
    );
    assert!(matches!(
        TrackerConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidBrokerUrl(_))
    ));
}

#[test]
fn test_locate_prefers_explicit_path() {
    let file = write_config("");
    let located = TrackerConfig::locate(Some(file.path())).unwrap();
    assert_eq!(located, file.path());
}

#[test]
fn test_shown_config_round_trips_through_toml() {
    let config = trackerlink::testing::test_config();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = TrackerConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
