//! Configuration loading tests

use phenosync_common::config::TomlConfig;
use std::io::Write;

#[test]
fn load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist.toml");

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.cache.refresh_workers, 4);
    assert_eq!(config.pipeline.event_throttle_ms, 1000);
}

#[test]
fn load_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[pipeline]
post_batch_size = 50
event_throttle_ms = 250

[logging]
level = "debug"
"#
    )
    .unwrap();

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.pipeline.post_batch_size, 50);
    assert_eq!(config.pipeline.event_throttle_ms, 250);
    assert_eq!(config.logging.level, "debug");
    // Unspecified section keeps its default
    assert_eq!(config.cache.refresh_workers, 4);
}

#[test]
fn load_invalid_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "this is { not toml").unwrap();

    assert!(TomlConfig::load(Some(&path)).is_err());
}
