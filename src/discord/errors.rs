//! Discord REST error classification

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// High-level category of a Discord API error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limit hit, must wait before retrying
    RateLimit,
    /// Target resource (channel, message, webhook, member) not found
    NotFound,
    /// Insufficient permissions for the requested action
    PermissionDenied,
    /// Invalid or revoked token
    Unauthorized,
    /// Request payload too large
    PayloadTooLarge,
    /// Malformed or semantically invalid input
    InvalidInput,
    /// Platform-side failure worth retrying
    Server,
    /// Unknown or uncategorised error
    Unknown,
}

/// Discord JSON error code (subset the proxy engine acts on)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscordErrorCode {
    UnknownChannel,
    UnknownGuild,
    UnknownMember,
    UnknownMessage,
    UnknownWebhook,
    UnknownEmoji,
    MaxWebhooksReached,
    MaxEmojisReached,
    MissingAccess,
    MissingPermissions,
    InvalidToken,
    InvalidFormBody,
    RequestEntityTooLarge,
    ApiOverloaded,
    Unknown,
}

impl DiscordErrorCode {
    /// Derive the code from a raw Discord JSON error code
    #[must_use]
    pub const fn from_raw(code: u32) -> Self {
        match code {
            10003 => Self::UnknownChannel,
            10004 => Self::UnknownGuild,
            10007 => Self::UnknownMember,
            10008 => Self::UnknownMessage,
            10014 => Self::UnknownEmoji,
            10015 => Self::UnknownWebhook,
            30007 => Self::MaxWebhooksReached,
            30008 | 30018 => Self::MaxEmojisReached,
            40005 => Self::RequestEntityTooLarge,
            50001 => Self::MissingAccess,
            50013 => Self::MissingPermissions,
            40001 | 50014 | 50025 | 50027 => Self::InvalidToken,
            50035 => Self::InvalidFormBody,
            130_000 => Self::ApiOverloaded,
            _ => Self::Unknown,
        }
    }

    /// The high-level category for this code
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::UnknownChannel
            | Self::UnknownGuild
            | Self::UnknownMember
            | Self::UnknownMessage
            | Self::UnknownWebhook
            | Self::UnknownEmoji => ErrorCategory::NotFound,
            Self::MissingAccess | Self::MissingPermissions => ErrorCategory::PermissionDenied,
            Self::InvalidToken => ErrorCategory::Unauthorized,
            Self::RequestEntityTooLarge => ErrorCategory::PayloadTooLarge,
            Self::InvalidFormBody | Self::MaxWebhooksReached | Self::MaxEmojisReached => {
                ErrorCategory::InvalidInput
            }
            Self::ApiOverloaded => ErrorCategory::Server,
            Self::Unknown => ErrorCategory::Unknown,
        }
    }
}

/// Error response from the Discord REST API
#[derive(Debug, Clone)]
pub struct DiscordApiError {
    /// HTTP status code
    pub status: u16,
    /// Discord JSON error code (0 when absent)
    pub code: u32,
    /// Error message from the response body
    pub message: String,
    /// Wait requested by a 429 response
    pub retry_after: Option<Duration>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after: Option<f64>,
}

impl DiscordApiError {
    /// Build an error from a status code and raw response body
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self {
                status,
                code: parsed.code,
                message: parsed.message,
                retry_after: parsed
                    .retry_after
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(Duration::from_secs_f64),
            },
            Err(_) => Self {
                status,
                code: 0,
                message: body.chars().take(200).collect(),
                retry_after: None,
            },
        }
    }

    /// Named error code
    #[must_use]
    pub const fn error_code(&self) -> DiscordErrorCode {
        DiscordErrorCode::from_raw(self.code)
    }

    /// Category derived from the HTTP status first, then the JSON code
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.status {
            429 => ErrorCategory::RateLimit,
            401 => ErrorCategory::Unauthorized,
            403 => ErrorCategory::PermissionDenied,
            404 => ErrorCategory::NotFound,
            413 => ErrorCategory::PayloadTooLarge,
            500..=599 => ErrorCategory::Server,
            _ => self.error_code().category(),
        }
    }
}

impl fmt::Display for DiscordApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}): {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for DiscordApiError {}
