// Configuration system integration tests

use log_aggregator::config::{
    load_config, load_config_with_env, AggregatorConfig, FileFormat, RotatePeriod, StoreConfig,
};
use log_aggregator::store::StoreFactory;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_default_config() {
    let config_path = std::path::PathBuf::from("config/default.yaml");

    if config_path.exists() {
        let result = load_config(&config_path);
        assert!(result.is_ok(), "Failed to load default config: {:?}", result.err());

        let config = result.unwrap();

        assert_eq!(config.aggregator.check_interval_ms, 5000);
        assert_eq!(config.aggregator.max_msg_per_second, 0);
        assert!(config.aggregator.new_thread_per_category);
        assert_eq!(config.categories.len(), 2);
        assert_eq!(config.categories[0].names(), vec!["audit"]);
        assert_eq!(config.categories[1].names(), vec!["default"]);
        assert_eq!(config.logging.level, "info");

        // Every store tree in the shipped file must build
        for rule in &config.categories {
            for name in rule.names() {
                assert!(StoreFactory::build(&rule.store, name).is_ok());
            }
        }
    }
}

#[test]
fn test_config_with_env_vars() {
    let temp_config = r#"
server:
  listen: ${CFG_TEST_LISTEN:-127.0.0.1:9999}

categories:
  - category: audit
    store:
      type: file
      file_path: ${CFG_TEST_DIR}/audit
      rotate_period: hourly
  - category: "web.*"
    store:
      type: forward
      remote_host: ${CFG_TEST_UPSTREAM:-upstream.local}
      remote_port: 1463

logging:
  level: debug
  format: json
"#;

    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path().join("aggregator.yaml");
    fs::write(&temp_path, temp_config).expect("Failed to write temp config");

    std::env::set_var("CFG_TEST_DIR", "/data/logs");

    let result = load_config(&temp_path);
    assert!(result.is_ok(), "Failed to load config with env vars: {:?}", result.err());
    let config = result.unwrap();

    assert_eq!(config.server.listen, "127.0.0.1:9999");
    match &config.categories[0].store {
        StoreConfig::File(file) => {
            assert_eq!(file.file_path, "/data/logs/audit");
            assert_eq!(file.rotate_period, RotatePeriod::Hourly);
            assert_eq!(file.format, FileFormat::Plain);
        }
        other => panic!("Expected file store, got {}", other.type_name()),
    }
    match &config.categories[1].store {
        StoreConfig::Forward(forward) => {
            assert_eq!(forward.base_url(), "http://upstream.local:1463");
        }
        other => panic!("Expected forward store, got {}", other.type_name()),
    }
    assert_eq!(config.logging.format, "json");

    std::env::remove_var("CFG_TEST_DIR");
}

#[test]
fn test_env_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path().join("aggregator.yaml");
    fs::write(
        &temp_path,
        r#"
aggregator:
  max_msg_per_second: 10
categories:
  - category: default
    store:
      type: "null"
"#,
    )
    .unwrap();

    std::env::set_var("AGGREGATOR_MAX_MSG_PER_SECOND", "2500");
    let config = load_config_with_env(&temp_path).unwrap();
    assert_eq!(config.aggregator.max_msg_per_second, 2500);

    std::env::set_var("AGGREGATOR_MAX_MSG_PER_SECOND", "lots");
    assert!(load_config_with_env(&temp_path).is_err());
    std::env::remove_var("AGGREGATOR_MAX_MSG_PER_SECOND");
}

#[test]
fn test_config_validation() {
    let invalid_config = r#"
categories:
  - category: default
    queue:
      max_batch_size: 0  # INVALID: must be > 0
    store:
      type: "null"
"#;

    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path().join("invalid.yaml");
    fs::write(&temp_path, invalid_config).expect("Failed to write temp config");

    let result = load_config(&temp_path);
    assert!(result.is_err(), "Expected validation error for invalid config");
    assert!(format!("{:#}", result.unwrap_err()).contains("max_batch_size"));
}

#[test]
fn test_store_factory_rejects_bad_trees() {
    let yaml = r#"
categories:
  - category: sharded
    store:
      type: bucket
      bucket_type: key_hash
      num_buckets: 3
      buckets:
        - type: "null"
        - type: "null"
"#;
    let config: AggregatorConfig = serde_yaml::from_str(yaml).unwrap();
    let result = StoreFactory::build(&config.categories[0].store, "sharded");
    assert!(result.is_err());
    assert!(result.err().unwrap().to_string().contains("declares 3 buckets"));
}

#[test]
fn test_config_defaults() {
    let config = AggregatorConfig::default();

    assert_eq!(config.server.listen, "0.0.0.0:1463");
    assert_eq!(config.aggregator.check_interval_ms, 5_000);
    assert_eq!(config.aggregator.max_queue_size, 5_000_000);
    assert_eq!(config.aggregator.counters_interval_seconds, 60);
    assert!(config.aggregator.counters_publish_url.is_none());
    assert!(config.categories.is_empty());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "text");
}
