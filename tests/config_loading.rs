use std::io::Write;

use stepgraph_core::config::AppConfig;
use stepgraph_core::StepgraphError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 25
event_capacity = 64

[retry]
max_attempts = 5
base_delay_ms = 250

[store]
path = "/tmp/stepgraph-test/runs.db"

[log]
enabled = true
level = 3
dir = "/tmp/stepgraph-test/logs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 25);
    assert_eq!(config.engine.event_capacity, 64);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 250);
    assert_eq!(
        config.store_path().to_str(),
        Some("/tmp/stepgraph-test/runs.db")
    );
    let log = config.log.as_ref().expect("log present");
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir().as_deref().and_then(|p| p.to_str()),
        Some("/tmp/stepgraph-test/logs")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPGRAPH_TEST_DB_PATH", "/srv/stepgraph/history.db");

    let toml_content = r#"
[store]
path = "${STEPGRAPH_TEST_DB_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.path, "/srv/stepgraph/history.db");

    std::env::remove_var("STEPGRAPH_TEST_DB_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 100);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.base_delay_ms, 1000);
    assert!(config.store.path.ends_with("runs.db"));
    assert!(config.log.is_none());
}

#[test]
fn test_disabled_log_has_no_dir() {
    let toml_content = r#"
[log]
enabled = false
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log.is_some());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_invalid_log_level_rejected() {
    let toml_content = r#"
[log]
level = 9
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, StepgraphError::Config(msg) if msg.contains("log.level")));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        AppConfig::load(&path),
        Err(StepgraphError::ConfigNotFound(_))
    ));

    let config = AppConfig::load_or_default(&path).expect("defaults");
    assert_eq!(config.engine.max_steps, 100);
}
