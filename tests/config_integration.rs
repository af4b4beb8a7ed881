//! Integration tests for configuration loading.
//!
//! These tests check that a `lodestar.toml` file feeds the explicit
//! settings each layer consumes.

use std::io::Write;
use std::time::Duration;

use lodestar::bson::binary::{DuplicateElementPolicy, decode_document_with};
use lodestar::bson::json::{JsonOutputMode, document_to_json};
use lodestar::bson::{GuidRepresentation, doc};
use lodestar::config::{ConfigError, LodestarConfig};
use pretty_assertions::assert_eq;

const FULL: &str = r#"
    [bson]
    max_document_size = 4096
    duplicate_element_policy = "reject"
    fix_old_binary_subtype_on_input = true
    guid_representation = "cSharpLegacy"

    [json]
    output_mode = "shell"
    indent = true
    indent_chars = "    "

    [translation]
    simplify = true

    [cluster]
    seeds = ["db1.example.com:27017", "db2.example.com:27018"]
    set_name = "rs0"
    server_selection_timeout_ms = 2000
    heartbeat_frequency_ms = 500
    local_threshold_ms = 20
    max_wait_queue_size = 50

    [environments.development.cluster]
    seeds = ["localhost:27017"]
    set_name = "dev"

    [environments.development.json]
    output_mode = "relaxed"
    indent = false
"#;

#[test]
fn test_config_full_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let config = LodestarConfig::from_file(file.path()).unwrap();
    let reader = config.reader_settings();
    assert_eq!(reader.max_document_size, 4096);
    assert_eq!(reader.duplicate_element_policy, DuplicateElementPolicy::Reject);
    assert!(reader.fix_old_binary_subtype_on_input);
    assert_eq!(config.writer_settings().max_document_size, 4096);
    assert_eq!(config.guid_representation(), GuidRepresentation::CSharpLegacy);

    let json = config.json_writer_settings();
    assert_eq!(json.output_mode, JsonOutputMode::Shell);
    assert_eq!(json.indent_chars, "    ");

    let cluster = config.cluster_settings().unwrap();
    assert_eq!(cluster.seeds.len(), 2);
    assert_eq!(cluster.seeds[1].port(), 27018);
    assert_eq!(cluster.set_name.as_deref(), Some("rs0"));
    assert_eq!(cluster.server_selection_timeout, Duration::from_secs(2));
    assert_eq!(cluster.heartbeat_frequency, Duration::from_millis(500));
    assert_eq!(cluster.local_threshold, Duration::from_millis(20));
    assert_eq!(cluster.max_wait_queue_size, 50);
    assert_eq!(cluster.connection.reader, reader);
}

#[test]
fn test_config_environment_override() {
    let config = LodestarConfig::from_str(FULL).unwrap().with_environment("development");
    let cluster = config.cluster_settings().unwrap();
    assert_eq!(cluster.seeds[0].to_string(), "localhost:27017");
    assert_eq!(cluster.set_name.as_deref(), Some("dev"));
    assert_eq!(config.json_writer_settings().output_mode, JsonOutputMode::Relaxed);
    assert!(!config.json_writer_settings().indent);
    // Untouched sections keep their file values.
    assert_eq!(config.reader_settings().max_document_size, 4096);
}

#[test]
fn test_config_missing_file() {
    let err = LodestarConfig::from_file("/nonexistent/lodestar.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/lodestar.toml"));
}

#[test]
fn test_config_rejects_unknown_keys() {
    let err = LodestarConfig::from_str("[cluster]\nseed = [\"a\"]").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_settings_drive_codecs() {
    let config = LodestarConfig::from_str("[bson]\nmax_document_size = 16\n[json]\noutput_mode = \"canonical\"").unwrap();
    let document = doc! { "n" => 1 };
    assert_eq!(document_to_json(&document, &config.json_writer_settings()), r#"{ "n" : { "$numberInt" : "1" } }"#);

    let big = doc! { "payload" => "0123456789abcdef" };
    let bytes = big.to_vec().unwrap();
    assert!(decode_document_with(&bytes, &config.reader_settings()).is_err());
}
