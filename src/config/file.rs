//! TOML configuration file loading
//!
//! Supports `~/.config/plural/proxy/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ProxyConfigFile {
    /// Discord credentials and endpoints
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageFileConfig,

    /// Event queue configuration
    #[serde(default)]
    pub queue: QueueFileConfig,

    /// Proxy engine tuning
    #[serde(default)]
    pub proxy: ProxyFileConfig,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Discord-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct DiscordFileConfig {
    /// Bot token (prefer the `BOT_TOKEN` env var)
    pub bot_token: Option<String>,

    /// REST API base URL
    pub api_url: Option<String>,

    /// CDN base URL
    pub cdn_url: Option<String>,

    /// Template used to build persona avatar URLs
    pub avatar_url_template: Option<String>,

    /// Global REST requests per second
    pub rest_rate_per_second: Option<u32>,
}

/// Storage configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    pub data_dir: Option<String>,
    pub database_path: Option<String>,
}

/// Event queue configuration
#[derive(Debug, Default, Deserialize)]
pub struct QueueFileConfig {
    pub stream: Option<String>,
    pub group: Option<String>,
    pub consumer: Option<String>,
    pub block_ms: Option<u64>,
    pub claim_idle_secs: Option<u64>,
}

/// Proxy engine tuning
#[derive(Debug, Default, Deserialize)]
pub struct ProxyFileConfig {
    /// Maximum emoji clones per message
    pub emoji_clone_limit: Option<usize>,

    /// Wall-clock budget for one regex tag evaluation, in microseconds
    pub regex_budget_us: Option<u64>,

    /// Maximum message length
    pub max_content_len: Option<usize>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Health check port
    pub health_port: Option<u16>,

    /// Expired-row sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ProxyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ProxyConfigFile {
    config_file_path().map_or_else(ProxyConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Returns `ProxyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> ProxyConfigFile {
    if !path.exists() {
        return ProxyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ProxyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ProxyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/plural/proxy/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("plural")
            .join("proxy")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc: ProxyConfigFile = toml::from_str(
            r#"
            [queue]
            stream = "events"
            block_ms = 1000

            [proxy]
            emoji_clone_limit = 4
            "#,
        )
        .unwrap();

        assert_eq!(fc.queue.stream.as_deref(), Some("events"));
        assert_eq!(fc.queue.block_ms, Some(1000));
        assert_eq!(fc.proxy.emoji_clone_limit, Some(4));
        assert!(fc.discord.bot_token.is_none());
        assert!(fc.server.health_port.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file_from(&dir.path().join("nope.toml"));
        assert!(fc.storage.data_dir.is_none());
    }

    #[test]
    fn malformed_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is [not toml").unwrap();
        let fc = load_config_file_from(&path);
        assert!(fc.queue.stream.is_none());
    }
}
