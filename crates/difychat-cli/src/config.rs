use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use difychat_ai::{DifyChatSettings, DifyProviderSettings, StorePolicy};
use serde::Deserialize;
use serde_json::{Map, Value};

const DEFAULT_CONF_DIR_NAME: &str = ".difychat";
const CONFIG_FILE_NAME: &str = "difychat.toml";
const LOG_FILE_NAME: &str = "difychat.log";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_ROTATE_SIZE_MB: u64 = 100;

static CONF_DIR: OnceLock<PathBuf> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub user: Option<String>,
    pub inputs: Map<String, Value>,
    pub auto_generate_name: Option<bool>,
    pub headers: HashMap<String, String>,
    pub session: StorePolicy,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub file_path: PathBuf,
    pub level: String,
    pub rotate_size_bytes: u64,
    pub stderr: bool,
}

impl CliConfig {
    pub fn provider_settings(&self) -> DifyProviderSettings {
        DifyProviderSettings {
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
        }
    }

    pub fn chat_settings(&self) -> DifyChatSettings {
        DifyChatSettings {
            inputs: self.inputs.clone(),
            user: self.user.clone(),
            auto_generate_name: self.auto_generate_name,
            api_key: self.api_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DifychatTomlFile {
    #[serde(default)]
    dify: DifychatTomlDify,
    #[serde(default)]
    session: DifychatTomlSession,
    #[serde(default)]
    log: DifychatTomlLog,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct DifychatTomlDify {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    inputs: Option<toml::Table>,
    #[serde(default)]
    auto_generate_name: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DifychatTomlSession {
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DifychatTomlLog {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    rotate_size_mb: Option<u64>,
    #[serde(default)]
    stderr: Option<bool>,
}

pub fn init_conf_dir(conf_dir: Option<PathBuf>) {
    let resolved = conf_dir
        .as_deref()
        .map(resolve_conf_dir_arg)
        .unwrap_or_else(default_conf_dir);
    let _ = CONF_DIR.set(resolved);
}

pub fn current_conf_dir() -> PathBuf {
    CONF_DIR.get().cloned().unwrap_or_else(default_conf_dir)
}

pub fn default_config_path() -> PathBuf {
    current_conf_dir().join(CONFIG_FILE_NAME)
}

fn default_conf_dir() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME)
}

fn resolve_conf_dir_arg(path: &Path) -> PathBuf {
    let expanded = expand_home_path(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

/// A missing file yields the defaults; an unreadable or invalid one is an error.
pub fn load_config(path: &Path) -> Result<CliConfig, String> {
    if !path.exists() {
        return parse_config("", &current_conf_dir());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|error| format!("read {} failed: {error}", path.display()))?;
    parse_config(&content, &current_conf_dir())
}

pub fn parse_config(content: &str, conf_dir: &Path) -> Result<CliConfig, String> {
    let parsed: DifychatTomlFile = toml::from_str(content)
        .map_err(|error| format!("parse {CONFIG_FILE_NAME} failed: {error}"))?;
    let env_map = &parsed.env;

    let inputs = match parsed.dify.inputs {
        Some(table) => toml_table_to_json(table, env_map)?,
        None => Map::new(),
    };
    let headers = parsed
        .headers
        .iter()
        .filter_map(|(name, value)| {
            resolve_config_value(value, env_map).map(|value| (name.trim().to_string(), value))
        })
        .collect();

    if parsed.session.max_entries == Some(0) {
        return Err("session.max_entries must be greater than 0".to_string());
    }
    let defaults = StorePolicy::default();
    let session = StorePolicy {
        ttl: match parsed.session.ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.ttl,
        },
        max_entries: parsed.session.max_entries.or(defaults.max_entries),
    };

    Ok(CliConfig {
        base_url: optional_value(parsed.dify.base_url.as_deref(), env_map),
        api_key: optional_value(parsed.dify.api_key.as_deref(), env_map),
        user: optional_value(parsed.dify.user.as_deref(), env_map),
        inputs,
        auto_generate_name: parsed.dify.auto_generate_name,
        headers,
        session,
        log: build_log_config(&parsed.log, env_map, conf_dir),
    })
}

fn build_log_config(
    log: &DifychatTomlLog,
    env_map: &HashMap<String, String>,
    conf_dir: &Path,
) -> LogConfig {
    let file_path = optional_value(log.file.as_deref(), env_map)
        .map(|value| expand_home_path(&value))
        .unwrap_or_else(|| conf_dir.join("logs").join(LOG_FILE_NAME));
    let level = optional_value(log.level.as_deref(), env_map)
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let rotate_size_mb = log
        .rotate_size_mb
        .unwrap_or(DEFAULT_LOG_ROTATE_SIZE_MB)
        .max(1);

    LogConfig {
        file_path,
        level,
        rotate_size_bytes: rotate_size_mb.saturating_mul(1024 * 1024),
        stderr: log.stderr.unwrap_or(false),
    }
}

fn toml_table_to_json(
    table: toml::Table,
    env_map: &HashMap<String, String>,
) -> Result<Map<String, Value>, String> {
    let mut inputs = Map::new();
    for (name, value) in table {
        let value = match value {
            toml::Value::String(text) => match resolve_config_value(&text, env_map) {
                Some(resolved) => Value::String(resolved),
                None => continue,
            },
            other => serde_json::to_value(other)
                .map_err(|error| format!("dify.inputs.{name} is not representable: {error}"))?,
        };
        inputs.insert(name, value);
    }
    Ok(inputs)
}

fn optional_value(value: Option<&str>, env_map: &HashMap<String, String>) -> Option<String> {
    value.and_then(|value| resolve_config_value(value, env_map))
}

/// `$NAME` reads `[env]` first, then the process environment.
pub(crate) fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| std::env::var(env_key).ok())
            .filter(|resolved| !resolved.trim().is_empty());
    }
    Some(trimmed.to_string())
}

fn expand_home_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir();
    }
    if let Some(suffix) = trimmed.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    PathBuf::from(trimmed)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
