//! Configuration management for the proxy worker

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Proxy worker configuration
#[derive(Debug)]
pub struct Config {
    /// Discord credentials and endpoints
    pub discord: DiscordConfig,

    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Path to the `SQLite` database
    pub database_path: PathBuf,

    /// Health check server configuration
    pub server: ServerConfig,

    /// Event queue configuration
    pub queue: QueueConfig,

    /// Proxy engine tuning
    pub proxy: ProxyConfig,
}

/// Discord credentials and endpoints
#[derive(Debug)]
pub struct DiscordConfig {
    /// Bot token (from `BOT_TOKEN` env)
    pub bot_token: SecretString,

    /// REST API base URL
    pub api_url: String,

    /// CDN base URL
    pub cdn_url: String,

    /// Persona avatar URL template, `{key}` is replaced by the stored avatar key
    pub avatar_url_template: String,

    /// Global REST requests per second
    pub rest_rate_per_second: u32,
}

/// Health check server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub health_port: u16,

    /// How often expired rows are swept
    pub sweep_interval: Duration,
}

/// Event queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Stream name
    pub stream: String,

    /// Consumer group name
    pub group: String,

    /// Consumer name within the group
    pub consumer: String,

    /// How long a read blocks waiting for new entries
    pub block: Duration,

    /// Pending entries idle longer than this are re-claimed
    pub claim_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "discord_events".to_string(),
            group: "plural_consumers".to_string(),
            consumer: "plural_worker".to_string(),
            block: Duration::from_millis(2500),
            claim_idle: Duration::from_secs(60),
        }
    }
}

/// Proxy engine tuning
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum emoji clones per message
    pub emoji_clone_limit: usize,

    /// Wall-clock budget for one regex tag evaluation
    pub regex_budget: Duration,

    /// Maximum message length
    pub max_content_len: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            emoji_clone_limit: 10,
            regex_budget: Duration::from_micros(500),
            max_content_len: 2000,
        }
    }
}

impl Config {
    /// Load configuration from the default config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the bot token is missing
    pub fn load() -> Result<Self> {
        Self::load_with_options(None)
    }

    /// Load configuration, optionally from an explicit TOML file
    ///
    /// Precedence is env > toml > default.
    ///
    /// # Errors
    ///
    /// Returns error if the bot token is missing
    pub fn load_with_options(config_path: Option<&Path>) -> Result<Self> {
        let fc = config_path.map_or_else(file::load_config_file, file::load_config_file_from);

        let bot_token = std::env::var("BOT_TOKEN")
            .ok()
            .or(fc.discord.bot_token)
            .ok_or_else(|| Error::Config("BOT_TOKEN is not set".to_string()))?;

        let discord = DiscordConfig {
            bot_token: SecretString::from(bot_token),
            api_url: std::env::var("DISCORD_API_URL")
                .ok()
                .or(fc.discord.api_url)
                .unwrap_or_else(|| "https://discord.com/api/v10".to_string()),
            cdn_url: std::env::var("DISCORD_CDN_URL")
                .ok()
                .or(fc.discord.cdn_url)
                .unwrap_or_else(|| "https://cdn.discordapp.com".to_string()),
            avatar_url_template: std::env::var("AVATAR_URL_TEMPLATE")
                .ok()
                .or(fc.discord.avatar_url_template)
                .unwrap_or_else(|| "https://cdn.plural.gg/images/{key}".to_string()),
            rest_rate_per_second: env_parse("REST_RATE_PER_SECOND")
                .or(fc.discord.rest_rate_per_second)
                .unwrap_or(50),
        };

        let data_dir = std::env::var("PLURAL_DATA_DIR")
            .ok()
            .or(fc.storage.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            tracing::warn!(
                path = %data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        let database_path = std::env::var("PLURAL_DATABASE_PATH")
            .ok()
            .or(fc.storage.database_path)
            .map_or_else(|| data_dir.join("plural.db"), PathBuf::from);

        let server = ServerConfig {
            health_port: env_parse("HEALTH_PORT")
                .or(fc.server.health_port)
                .unwrap_or(8083),
            sweep_interval: Duration::from_secs(
                env_parse("SWEEP_INTERVAL_SECS")
                    .or(fc.server.sweep_interval_secs)
                    .unwrap_or(300),
            ),
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            stream: std::env::var("QUEUE_STREAM")
                .ok()
                .or(fc.queue.stream)
                .unwrap_or(queue_defaults.stream),
            group: std::env::var("QUEUE_GROUP")
                .ok()
                .or(fc.queue.group)
                .unwrap_or(queue_defaults.group),
            consumer: std::env::var("QUEUE_CONSUMER")
                .ok()
                .or(fc.queue.consumer)
                .unwrap_or(queue_defaults.consumer),
            block: env_parse("QUEUE_BLOCK_MS")
                .or(fc.queue.block_ms)
                .map_or(queue_defaults.block, Duration::from_millis),
            claim_idle: env_parse("QUEUE_CLAIM_IDLE_SECS")
                .or(fc.queue.claim_idle_secs)
                .map_or(queue_defaults.claim_idle, Duration::from_secs),
        };

        let proxy_defaults = ProxyConfig::default();
        let proxy = ProxyConfig {
            emoji_clone_limit: env_parse("EMOJI_CLONE_LIMIT")
                .or(fc.proxy.emoji_clone_limit)
                .unwrap_or(proxy_defaults.emoji_clone_limit),
            regex_budget: env_parse("REGEX_BUDGET_US")
                .or(fc.proxy.regex_budget_us)
                .map_or(proxy_defaults.regex_budget, Duration::from_micros),
            max_content_len: fc
                .proxy
                .max_content_len
                .unwrap_or(proxy_defaults.max_content_len),
        };

        Ok(Self {
            discord,
            data_dir,
            database_path,
            server,
            queue,
            proxy,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Default data directory: `~/.local/share/plural/proxy`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/plural/proxy"),
        |d| d.data_dir().join("plural").join("proxy"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults() {
        let q = QueueConfig::default();
        assert_eq!(q.stream, "discord_events");
        assert_eq!(q.group, "plural_consumers");
        assert_eq!(q.consumer, "plural_worker");
        assert_eq!(q.block, Duration::from_millis(2500));
    }

    #[test]
    fn proxy_defaults() {
        let p = ProxyConfig::default();
        assert_eq!(p.emoji_clone_limit, 10);
        assert_eq!(p.regex_budget, Duration::from_micros(500));
        assert_eq!(p.max_content_len, 2000);
    }

    #[test]
    fn file_overlay_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                r#"
                [discord]
                bot_token = "abc.def.ghi"

                [storage]
                data_dir = "{}"

                [proxy]
                max_content_len = 4000
                "#,
                dir.path().display()
            ),
        )
        .unwrap();

        let config = Config::load_with_options(Some(&path)).unwrap();
        assert_eq!(config.proxy.max_content_len, 4000);
        assert!(config.database_path.ends_with("plural.db"));
    }
}
