//! Error types for the proxy worker

use thiserror::Error;

use crate::discord::DiscordApiError;

/// Result type alias for proxy worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the proxy worker
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Discord REST API returned an error response
    #[error("discord api error: {0}")]
    Discord(#[from] DiscordApiError),

    /// Inbound event could not be decoded
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Required snapshot missing from the entity cache
    #[error("cache miss: {0}")]
    CacheMiss(String),

    /// Channel already holds the maximum number of webhooks
    #[error("webhook limit reached for channel {0}")]
    WebhookLimit(u64),

    /// Original message was deleted but its replacement could not be sent
    #[error("critical proxy failure: {0}")]
    Critical(String),

    /// Emoji image could not be processed
    #[error("emoji error: {0}")]
    Emoji(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data violates an invariant
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl Error {
    /// Whether the error leaves the worker unable to make progress on an event.
    ///
    /// Fatal errors skip queue acknowledgement so the entry is redelivered.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Sqlite(_))
    }

    /// Whether the error came from the platform refusing access
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Discord(e) if e.status == 403)
    }

    /// Whether the error came from a missing platform resource
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Discord(e) if e.status == 404)
    }

    /// Whether the error came from an invalid or revoked token
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Discord(e) if e.status == 401)
    }
}
