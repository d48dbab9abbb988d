use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, CoreError, Result};
use crate::upstream::Credentials;

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub irc: IrcConfig,

    #[serde(default)]
    pub bluesky: BlueskyConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Listener and presentation of the IRC side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name used as the prefix of server replies
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            channel: default_channel(),
            topic: default_topic(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_password: Option<String>,

    /// Entries requested per timeline fetch (1-100)
    #[serde(default = "default_timeline_limit")]
    pub timeline_limit: u8,
}

impl std::fmt::Debug for BlueskyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueskyConfig")
            .field("service", &self.service)
            .field("handle", &self.handle)
            .field("app_password", &self.app_password.as_ref().map(|_| "<redacted>"))
            .field("timeline_limit", &self.timeline_limit)
            .finish()
    }
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            handle: None,
            app_password: None,
            timeline_limit: default_timeline_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound for the retry delay after consecutive sync failures
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Entries per `!page`
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How many synced entries are kept for history replay between refreshes
    #[serde(default = "default_retained_appended")]
    pub retained_appended: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            page_size: default_page_size(),
            retained_appended: default_retained_appended(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long connections get to close after shutdown starts
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6667
}

fn default_server_name() -> String {
    "bridge.local".to_string()
}

fn default_channel() -> String {
    "#timeline".to_string()
}

fn default_topic() -> String {
    "Bluesky AT Bridge".to_string()
}

fn default_service() -> String {
    "https://bsky.social".to_string()
}

fn default_timeline_limit() -> u8 {
    50
}

fn default_interval_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    600
}

fn default_page_size() -> usize {
    10
}

fn default_retained_appended() -> usize {
    200
}

fn default_grace_secs() -> u64 {
    2
}

impl BridgeConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any variable lookup. Empty values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(handle) = get("BSKY_HANDLE") {
            self.bluesky.handle = Some(handle);
        }
        if let Some(password) = get("BSKY_APP_PASSWORD") {
            self.bluesky.app_password = Some(password);
        }
        if let Some(service) = get("BSKY_SERVICE") {
            self.bluesky.service = service;
        }
        if let Some(server_name) = get("IRC_SERVER_NAME") {
            self.irc.server_name = server_name;
        }
    }

    /// Login credentials, or a configuration error naming what is missing.
    pub fn credentials(&self) -> Result<Credentials> {
        let handle = self
            .bluesky
            .handle
            .clone()
            .ok_or_else(|| CoreError::missing_config("BSKY_HANDLE", "bluesky.handle"))?;
        let app_password = self
            .bluesky
            .app_password
            .clone()
            .ok_or_else(|| CoreError::missing_config("BSKY_APP_PASSWORD", "bluesky.app_password"))?;
        Ok(Credentials {
            handle,
            app_password,
        })
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| CoreError::ConfigurationError {
            config_path: "<merged configuration>".to_string(),
            field: field.to_string(),
            expected: reason.to_string(),
            cause: ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            },
        };

        if !self.irc.channel.starts_with('#') || self.irc.channel.contains(' ') {
            return Err(invalid("irc.channel", "a channel name starting with '#'"));
        }
        if self.irc.server_name.is_empty() || self.irc.server_name.contains(' ') {
            return Err(invalid("irc.server_name", "a non-empty name without spaces"));
        }
        if self.sync.interval_secs == 0 {
            return Err(invalid("sync.interval_secs", "a positive number of seconds"));
        }
        if self.sync.page_size == 0 {
            return Err(invalid("sync.page_size", "a positive page size"));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub async fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::ConfigurationError {
                config_path: path.display().to_string(),
                field: "file".to_string(),
                expected: "readable TOML file".to_string(),
                cause: ConfigError::Io(e.to_string()),
            })?;

    let config: BridgeConfig =
        toml::from_str(&content).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "content".to_string(),
            expected: "valid TOML configuration".to_string(),
            cause: ConfigError::TomlParse(e.to_string()),
        })?;

    debug!("loaded configuration from {}", path.display());
    Ok(config)
}

/// Get standard config file locations
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("atrelay.toml")];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("atrelay").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".atrelay").join("config.toml"));
    }

    paths
}

/// Load configuration from standard locations
pub async fn load_config_from_standard_locations() -> Result<BridgeConfig> {
    for path in config_paths() {
        if path.exists() {
            return load_config(&path).await;
        }
    }

    debug!("no configuration file found, using defaults");
    Ok(BridgeConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.irc.host, "127.0.0.1");
        assert_eq!(config.irc.port, 6667);
        assert_eq!(config.irc.server_name, "bridge.local");
        assert_eq!(config.irc.channel, "#timeline");
        assert_eq!(config.bluesky.service, "https://bsky.social");
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.shutdown.grace_secs, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [irc]
            port = 7000

            [bluesky]
            handle = "me.bsky.social"
            "#,
        )
        .unwrap();
        assert_eq!(config.irc.port, 7000);
        assert_eq!(config.irc.host, "127.0.0.1");
        assert_eq!(config.bluesky.handle.as_deref(), Some("me.bsky.social"));
        assert_eq!(config.bluesky.timeline_limit, 50);
        assert_eq!(config.sync.page_size, 10);
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atrelay.toml");
        tokio::fs::write(&path, "[sync]\ninterval_secs = 5\n")
            .await
            .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.sync.interval_secs, 5);
        assert_eq!(config.sync.max_backoff_secs, 600);
    }

    #[tokio::test]
    async fn test_load_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(&missing).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConfigurationError {
                cause: ConfigError::Io(_),
                ..
            }
        ));

        let broken = dir.path().join("broken.toml");
        tokio::fs::write(&broken, "[irc\nport = ").await.unwrap();
        let err = load_config(&broken).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConfigurationError {
                cause: ConfigError::TomlParse(_),
                ..
            }
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BSKY_HANDLE", "env.bsky.social"),
            ("BSKY_APP_PASSWORD", "abcd-efgh"),
            ("IRC_SERVER_NAME", "irc.example"),
            ("BSKY_SERVICE", ""),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config.bluesky.handle = Some("file.bsky.social".into());
        config.apply_env_with(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.bluesky.handle.as_deref(), Some("env.bsky.social"));
        assert_eq!(config.irc.server_name, "irc.example");
        // empty values do not override
        assert_eq!(config.bluesky.service, "https://bsky.social");

        let creds = config.credentials().unwrap();
        assert_eq!(creds.app_password, "abcd-efgh");
    }

    #[test]
    fn test_missing_credentials() {
        let mut config = BridgeConfig::default();
        config.bluesky.handle = Some("me.bsky.social".into());
        let err = config.credentials().unwrap_err();
        match err {
            CoreError::ConfigurationError { field, .. } => {
                assert_eq!(field, "bluesky.app_password")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_channel() {
        let mut config = BridgeConfig::default();
        config.irc.channel = "timeline".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_not_in_debug() {
        let mut config = BridgeConfig::default();
        config.bluesky.app_password = Some("hunter2".into());
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
