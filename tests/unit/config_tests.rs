use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;

use managed_instance::config::{DEBUG_WAIT_ENV, EXTERNAL_SOCK_ENV, VALGRIND_ENV};
use managed_instance::profiling::ProfilingMode;
use managed_instance::{AppError, HarnessConfig};

fn sample_toml() -> &'static str {
    r#"
binary_name = "watchman"
repo_root = "/src/watchman"
log_level = 1
profiling = "callgrind"
valgrind_binary = "/usr/bin/valgrind"
debug = true

[server_config]
hint_num_dirs = 4
root_restrict_files = [".watchmanconfig"]

[timeouts]
connect_ms = 2000
io_ms = 10000
"#
}

#[test]
fn empty_document_uses_defaults() {
    let config = HarnessConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config, HarnessConfig::default());
    assert_eq!(config.binary_name, "watchman");
    assert_eq!(config.binary_env_var, "WATCHMAN_BINARY");
    assert_eq!(config.log_level, 2);
    assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    assert_eq!(config.io_timeout(), Duration::from_secs(20));
    assert_eq!(config.poll_interval(), Duration::from_millis(30));
    assert_eq!(config.lifecycle_timeout(), Duration::from_secs(5));
    assert_eq!(config.final_kill_timeout(), Duration::from_secs(5));
    assert!(config.server_config.as_object().is_some_and(serde_json::Map::is_empty));
}

#[test]
fn sample_document_parses_every_section() {
    let config = HarnessConfig::from_toml_str(sample_toml()).expect("sample parses");
    assert_eq!(config.repo_root, Some(PathBuf::from("/src/watchman")));
    assert_eq!(config.profiling, ProfilingMode::Callgrind);
    assert_eq!(config.valgrind_binary, "/usr/bin/valgrind");
    assert!(config.debug);
    assert_eq!(config.server_config["hint_num_dirs"], 4);
    assert_eq!(config.connect_timeout(), Duration::from_secs(2));
    assert_eq!(config.io_timeout(), Duration::from_secs(10));
    // Unset keys in a present table still default.
    assert_eq!(config.timeouts.poll_ms, 30);
}

#[test]
fn memcheck_stretches_the_lifecycle_timeout() {
    let config = HarnessConfig {
        profiling: ProfilingMode::Memcheck,
        ..HarnessConfig::default()
    };
    assert_eq!(config.lifecycle_timeout(), Duration::from_secs(20));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let err = HarnessConfig::from_toml_str("binary_name = [").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn blank_binary_name_is_rejected() {
    let err = HarnessConfig::from_toml_str("binary_name = \"  \"").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_poll_interval_is_rejected() {
    let err = HarnessConfig::from_toml_str("[timeouts]\npoll_ms = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("poll_ms")));
}

#[test]
fn connect_deadline_shorter_than_one_poll_is_rejected() {
    let err = HarnessConfig::from_toml_str("[timeouts]\nconnect_ms = 10\npoll_ms = 30").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn non_object_server_config_is_rejected() {
    let config = HarnessConfig {
        server_config: serde_json::json!([1, 2]),
        ..HarnessConfig::default()
    };
    assert!(matches!(config.validate(), Err(AppError::Config(_))));
}

#[test]
fn load_from_path_reads_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harness.toml");
    std::fs::write(&path, "log_level = 0\n").unwrap();
    let config = HarnessConfig::load_from_path(&path).expect("file loads");
    assert_eq!(config.log_level, 0);
}

#[test]
fn missing_file_is_a_config_error() {
    let err = HarnessConfig::load_from_path("/nonexistent/harness.toml").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("failed to read config")));
}

#[test]
fn aggregate_dir_defaults_to_temp_dir() {
    assert_eq!(HarnessConfig::default().aggregate_log_dir(), std::env::temp_dir());
}

// ── Environment overrides ────────────────────────────────────────────────────

fn clear_harness_env() {
    std::env::remove_var(VALGRIND_ENV);
    std::env::remove_var(DEBUG_WAIT_ENV);
    std::env::remove_var(EXTERNAL_SOCK_ENV);
}

#[test]
#[serial]
fn valgrind_env_forces_memcheck() {
    clear_harness_env();
    std::env::set_var(VALGRIND_ENV, "1");
    let config = HarnessConfig {
        profiling: ProfilingMode::Callgrind,
        ..HarnessConfig::default()
    }
    .apply_env();
    clear_harness_env();
    assert_eq!(config.profiling, ProfilingMode::Memcheck);
}

#[test]
#[serial]
fn zero_flag_value_is_off() {
    clear_harness_env();
    std::env::set_var(DEBUG_WAIT_ENV, "0");
    let config = HarnessConfig::default().apply_env();
    clear_harness_env();
    assert!(!config.debug_wait);
}

#[test]
#[serial]
fn external_socket_comes_from_env() {
    clear_harness_env();
    std::env::set_var(EXTERNAL_SOCK_ENV, "/tmp/other-harness/sock");
    let config = HarnessConfig::default().apply_env();
    clear_harness_env();
    assert_eq!(
        config.external_socket,
        Some(PathBuf::from("/tmp/other-harness/sock"))
    );
}

#[test]
#[serial]
fn unset_env_leaves_config_alone() {
    clear_harness_env();
    let config = HarnessConfig::default().apply_env();
    assert_eq!(config, HarnessConfig::default());
}
