//! Unit tests for bootstrap configuration and root folder resolution
//!
//! Tests that manipulate EMX_ROOT_FOLDER are marked with #[serial] so they
//! don't race on the process environment.

use emx_common::config::{prepare_root_folder, resolve_root_folder, TomlConfig, CACHE_DIR};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

const TEST_ENV: &str = "EMX_ROOT_FOLDER_TEST";

#[test]
#[serial]
fn test_cli_argument_wins_over_everything() {
    env::set_var(TEST_ENV, "/from/env");
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..TomlConfig::default()
    };

    let root = resolve_root_folder(Some("/from/cli"), TEST_ENV, &toml);
    assert_eq!(root, PathBuf::from("/from/cli"));
    env::remove_var(TEST_ENV);
}

#[test]
#[serial]
fn test_env_wins_over_toml() {
    env::set_var(TEST_ENV, "/from/env");
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..TomlConfig::default()
    };

    assert_eq!(resolve_root_folder(None, TEST_ENV, &toml), PathBuf::from("/from/env"));
    env::remove_var(TEST_ENV);
}

#[test]
#[serial]
fn test_toml_then_default() {
    env::remove_var(TEST_ENV);
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..TomlConfig::default()
    };
    assert_eq!(resolve_root_folder(None, TEST_ENV, &toml), PathBuf::from("/from/toml"));

    let fallback = resolve_root_folder(None, TEST_ENV, &TomlConfig::default());
    assert!(fallback.to_string_lossy().contains("emx"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = TomlConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config.port, 5810);
    assert_eq!(config.logging.level, "info");
    assert!(config.remote_sources.is_empty());
}

#[test]
fn test_parse_full_config() {
    let text = r#"
        root_folder = "/srv/emx"
        port = 9000
        cors_origins = ["https://participant.example"]

        [logging]
        level = "debug"

        [[remote_sources]]
        kind = "smartvoc"
        url_template = "https://api.example/research/{study_id}/smart-voc"
        bearer_token = "abc"
    "#;
    let config = TomlConfig::from_toml_str(text).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/emx")));
    assert_eq!(config.port, 9000);
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.remote_sources.len(), 1);
    assert_eq!(config.remote_sources[0].kind, "smartvoc");
    assert_eq!(config.remote_sources[0].bearer_token.as_deref(), Some("abc"));
}

#[test]
fn test_invalid_config_is_an_error() {
    assert!(TomlConfig::from_toml_str("port = \"not a number\"").is_err());
}

#[test]
fn test_prepare_root_folder_creates_cache_dir() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("nested").join("root");
    prepare_root_folder(&root).unwrap();
    assert!(root.join(CACHE_DIR).is_dir());
}
