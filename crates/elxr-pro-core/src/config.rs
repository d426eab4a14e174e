//! Client configuration.
//!
//! Resolution order (lowest to highest):
//! 1. Built-in defaults
//! 2. Config file (`EA_CONFIG_FILE` or `/etc/elxr-advantage/eaclient.conf`, TOML)
//! 3. Allow-listed `EA_*` environment variables

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::apt::AptPaths;
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/elxr-advantage/eaclient.conf";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/elxr-pro";
pub const DEFAULT_LOG_FILE: &str = "/var/log/elxr-advantage.log";
pub const BASE_CONTRACT_URL: &str = "https://api.elxr.pro";
pub const HOMEPAGE_URL: &str = "https://elxr.pro/";

/// Subdirectory of the data dir holding root-only files.
pub const PRIVATE_SUBDIR: &str = "private";

/// Keys accepted in the config file.
const VALID_CONFIG_KEYS: &[&str] = &["contract_url", "data_dir", "log_file", "log_level"];

/// Environment variables (lower-cased) allowed to override config fields.
const ENV_ALLOWLIST: &[&str] = &["ea_data_dir", "ea_log_file", "ea_log_level"];

/// Resolved client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the contract service.
    pub contract_url: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_file: PathBuf,
    /// Package manager locations. Not configurable from the file.
    #[serde(skip)]
    pub apt: AptPaths,
    /// Keys found in the config file that are not recognised.
    #[serde(skip)]
    pub invalid_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contract_url: BASE_CONTRACT_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_level: "debug".to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            apt: AptPaths::default(),
            invalid_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// `<data_dir>/private`
    pub fn private_dir(&self) -> PathBuf {
        self.data_dir.join(PRIVATE_SUBDIR)
    }

    /// Location of the lifecycle lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.private_dir().join("lock")
    }

    /// `log_level` translated into a `tracing` filter directive.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_ascii_lowercase().as_str() {
            "error" | "critical" => "error",
            "warn" | "warning" => "warn",
            "info" => "info",
            "trace" => "trace",
            _ => "debug",
        }
    }
}

/// Path of the config file: `EA_CONFIG_FILE` if set, else the default.
pub fn config_path() -> PathBuf {
    std::env::var_os("EA_CONFIG_FILE")
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Load configuration from the default location and the process environment.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path(), std::env::vars())
}

/// Load configuration from `path`, then apply overrides from `vars`.
pub fn load_config_from(
    path: &Path,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<Config> {
    let mut config = if path.exists() {
        load_config_file(path)?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config, vars);
    config.data_dir = expand_home(&config.data_dir);
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let mut table: toml::Table = toml::from_str(&content).map_err(|_| Error::InvalidFileFormat {
        path: path.to_path_buf(),
        format: "toml",
    })?;

    let mut invalid_keys: Vec<String> = table
        .keys()
        .filter(|k| !VALID_CONFIG_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    invalid_keys.sort();
    for key in &invalid_keys {
        table.remove(key);
    }

    let mut config: Config = toml::Value::Table(table).try_into().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    config.invalid_keys = invalid_keys;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, vars: impl IntoIterator<Item = (String, String)>) {
    for (key, value) in vars {
        let key = key.to_ascii_lowercase();
        if !ENV_ALLOWLIST.contains(&key.as_str()) {
            continue;
        }
        match key.trim_start_matches("ea_") {
            "data_dir" => config.data_dir = PathBuf::from(value),
            "log_file" => config.log_file = PathBuf::from(value),
            "log_level" => config.log_level = value,
            _ => {}
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |h| h.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}

/// Environment variables relevant to the client, for debug logging.
pub fn client_environment() -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| k.starts_with("EA_") || k.ends_with("_proxy") || k.ends_with("_PROXY"))
        .collect();
    vars.sort();
    vars
}
