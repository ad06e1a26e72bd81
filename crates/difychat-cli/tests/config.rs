use std::fs;
use std::time::Duration;

use difychat_cli::config::{default_config_path, init_conf_dir, load_config};
use tempfile::tempdir;

#[test]
fn load_config_reads_file_and_missing_file_means_defaults() {
    let dir = tempdir().expect("create temp dir");
    init_conf_dir(Some(dir.path().to_path_buf()));
    assert_eq!(default_config_path(), dir.path().join("difychat.toml"));

    let defaults = load_config(&dir.path().join("absent.toml")).expect("defaults");
    assert_eq!(defaults.api_key, None);
    assert_eq!(
        defaults.log.file_path,
        dir.path().join("logs").join("difychat.log")
    );

    let path = dir.path().join("difychat.toml");
    fs::write(
        &path,
        r#"
[dify]
base_url = "https://dify.example.com/v1"
api_key = "app-literal"
user = "alice"

[session]
ttl_secs = 120
max_entries = 3

[log]
level = "debug"
stderr = true
"#,
    )
    .expect("write config");

    let config = load_config(&path).expect("config loads");
    assert_eq!(
        config.base_url.as_deref(),
        Some("https://dify.example.com/v1")
    );
    assert_eq!(config.api_key.as_deref(), Some("app-literal"));
    assert_eq!(config.user.as_deref(), Some("alice"));
    assert_eq!(config.session.ttl, Some(Duration::from_secs(120)));
    assert_eq!(config.session.max_entries, Some(3));
    assert_eq!(config.log.level, "debug");
    assert!(config.log.stderr);
}

#[test]
fn load_config_rejects_invalid_toml() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("difychat.toml");
    fs::write(&path, "[dify\nbase_url = 1").expect("write config");

    let error = load_config(&path).expect_err("invalid config");
    assert!(error.contains("parse difychat.toml failed"));
}
