//! Runtime configuration for SIA-Scout.
//!
//! Load priority:
//! 1. Environment variables (`SIASCOUT_API_URL`)
//! 2. Config file (`~/.config/siascout/config.toml`)
//! 3. Built-in defaults
//!
//! Credentials are never read from the config file; they come from the
//! `SIASCOUT_USERNAME` / `SIASCOUT_PASSWORD` environment variables only.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Default API base URL
const DEFAULT_API_URL: &str = "https://api.spamhaus.org";

/// Environment variable name for API URL override
const ENV_API_URL: &str = "SIASCOUT_API_URL";

const DEFAULT_DATASET: &str = "ALL";
const DEFAULT_MODE: &str = "listed";
const DEFAULT_LIMIT: u32 = 2000;
const DEFAULT_CONCURRENCY: usize = 20;

/// The remote API rejects history windows longer than 12 months; 364 days
/// is a safe maximum.
pub const DEFAULT_HISTORY_DAYS: u64 = 364;

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    api: Option<ApiSection>,
    scan: Option<ScanSection>,
    paths: Option<PathsSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiSection {
    /// API endpoint URL (e.g., "https://api.spamhaus.org")
    base_url: Option<String>,
    /// Dataset selector (e.g., "ALL", "SBL", "XBL")
    dataset: Option<String>,
    /// Listing mode (e.g., "listed")
    mode: Option<String>,
    /// Per-block result cap
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ScanSection {
    /// Number of concurrent workers (and in-flight request cap)
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsSection {
    database: Option<PathBuf>,
    token_file: Option<PathBuf>,
    target_file: Option<PathBuf>,
}

/// Where the API endpoint configuration came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigSource {
    Default,
    Environment,
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub dataset: String,
    pub mode: String,
    pub limit: u32,
    pub concurrency: usize,
    pub db_path: PathBuf,
    pub token_path: PathBuf,
    pub target_file: PathBuf,
    pub source: ConfigSource,
}

/// API credentials, supplied via environment only.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Read credentials from `SIASCOUT_USERNAME` / `SIASCOUT_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        let username = std::env::var("SIASCOUT_USERNAME")
            .context("SIASCOUT_USERNAME is not set")?;
        let password = std::env::var("SIASCOUT_PASSWORD")
            .context("SIASCOUT_PASSWORD is not set")?;
        Ok(Self { username, password })
    }
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("siascout").join("config.toml"))
}

/// Get the siascout data directory, creating it if needed.
pub fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .context("Failed to find data directory")?
        .join("siascout");
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create data directory")?;
    }
    Ok(dir)
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Resolve the runtime configuration.
pub fn load_config() -> Result<Config> {
    let data = data_dir()?;
    let file = load_config_file().unwrap_or_default();
    let api = file.api.unwrap_or_default();
    let scan = file.scan.unwrap_or_default();
    let paths = file.paths.unwrap_or_default();

    // Endpoint priority: environment > config file > default
    let (api_url, source) = match std::env::var(ENV_API_URL) {
        Ok(url) if !url.trim().is_empty() => {
            let url = url.trim().trim_end_matches('/').to_string();
            tracing::info!("Using API URL from environment variable: {}", url);
            (url, ConfigSource::Environment)
        }
        _ => match api.base_url.as_deref().map(|u| u.trim().trim_end_matches('/')) {
            Some(url) if !url.is_empty() => {
                tracing::info!("Using API URL from config file: {}", url);
                (url.to_string(), ConfigSource::ConfigFile)
            }
            _ => (DEFAULT_API_URL.to_string(), ConfigSource::Default),
        },
    };

    Ok(Config {
        api_url,
        dataset: api.dataset.unwrap_or_else(|| DEFAULT_DATASET.to_string()),
        mode: api.mode.unwrap_or_else(|| DEFAULT_MODE.to_string()),
        limit: api.limit.unwrap_or(DEFAULT_LIMIT),
        concurrency: scan.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
        db_path: paths.database.unwrap_or_else(|| data.join("siascout.db")),
        token_path: paths.token_file.unwrap_or_else(|| data.join("token.json")),
        target_file: paths
            .target_file
            .unwrap_or_else(|| PathBuf::from("targets/cidrs.txt")),
        source,
    })
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/siascout/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# SIA-Scout Configuration
# Place this file at: ~/.config/siascout/config.toml

[api]
# base_url = "https://api.spamhaus.org"
# dataset = "ALL"
# mode = "listed"
# limit = 2000

[scan]
# Number of concurrent workers (also caps in-flight API requests)
# concurrency = 20

[paths]
# database = "/var/lib/siascout/siascout.db"
# token_file = "/var/lib/siascout/token.json"
# target_file = "targets/cidrs.txt"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_partial_sections() {
        let parsed: ConfigFile = toml::from_str(
            r#"
            [api]
            base_url = "https://sia.example.net/"
            limit = 500
            "#,
        )
        .unwrap();
        let api = parsed.api.unwrap();
        assert_eq!(api.base_url.as_deref(), Some("https://sia.example.net/"));
        assert_eq!(api.limit, Some(500));
        assert!(parsed.scan.is_none());
    }

    #[test]
    fn example_config_is_valid_toml() {
        let parsed: Result<ConfigFile, _> = toml::from_str(&generate_example_config());
        assert!(parsed.is_ok());
    }
}
