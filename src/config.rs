//! Application configuration loaded from a TOML file

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Database location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Caddy admin API settings
    #[serde(default)]
    pub caddy: CaddyConfig,

    /// System account used for audit attribution when no performer is given
    #[serde(default)]
    pub system: SystemAccountConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaddyConfig {
    /// Fallback admin API base URL, used when the `caddy_api_url` setting
    /// row is absent
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SystemAccountConfig {
    /// Account id written to the audit log for unattributed operations
    #[serde(default = "default_system_account")]
    pub account: String,

    #[serde(default = "default_system_email")]
    pub email: String,

    #[serde(default = "default_system_name")]
    pub name: String,
}

impl Default for SystemAccountConfig {
    fn default() -> Self {
        Self {
            account: default_system_account(),
            email: default_system_email(),
            name: default_system_name(),
        }
    }
}

fn default_db_path() -> String {
    dirs_next::data_local_dir()
        .map(|dir| dir.join("caddyman").join("caddyman.db"))
        .unwrap_or_else(|| PathBuf::from("caddyman.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_api_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_timeout_secs() -> u64 {
    crate::caddy::DEFAULT_TIMEOUT_SECS
}

fn default_system_account() -> String {
    "system".to_string()
}

fn default_system_email() -> String {
    "system@localhost".to_string()
}

fn default_system_name() -> String {
    "System".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.caddy.api_url, "http://localhost:2019");
        assert_eq!(config.caddy.timeout_secs, 10);
        assert_eq!(config.system.account, "system");
        assert!(!config.database.path.is_empty());
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [caddy]
            api_url = "http://127.0.0.1:2020"

            [system]
            account = "ops"
            "#,
        )
        .unwrap();

        assert_eq!(config.caddy.api_url, "http://127.0.0.1:2020");
        assert_eq!(config.caddy.timeout_secs, 10);
        assert_eq!(config.system.account, "ops");
        assert_eq!(config.system.email, "system@localhost");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/caddyman.toml").unwrap();
        assert_eq!(config.system.account, "system");
    }
}
