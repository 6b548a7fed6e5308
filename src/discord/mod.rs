//! Discord REST seam
//!
//! Everything the engine sends to Discord goes through [`DiscordApi`]. The
//! production implementation is [`DiscordHttp`]; tests substitute a mock.

pub mod errors;
pub mod http;
pub mod models;
pub mod retry;

use async_trait::async_trait;

pub use errors::{DiscordApiError, DiscordErrorCode, ErrorCategory};
pub use http::{DiscordHttp, application_id_from_token};
pub use models::*;

use crate::Result;

/// Credential a call is made with
#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    /// The worker's own bot token
    Bot,
    /// A persona's dedicated bot
    Dedicated {
        token: &'a str,
        application_id: Snowflake,
    },
}

/// Owned form of [`Auth`], for work that outlives the borrow
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bot,
    Dedicated {
        token: String,
        application_id: Snowflake,
    },
}

impl Credential {
    /// Borrow as an [`Auth`]
    #[must_use]
    pub fn auth(&self) -> Auth<'_> {
        match self {
            Self::Bot => Auth::Bot,
            Self::Dedicated {
                token,
                application_id,
            } => Auth::Dedicated {
                token,
                application_id: *application_id,
            },
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bot => f.write_str("Bot"),
            Self::Dedicated { application_id, .. } => f
                .debug_struct("Dedicated")
                .field("application_id", application_id)
                .finish_non_exhaustive(),
        }
    }
}

/// File re-uploaded alongside a message
#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    pub filename: String,
    pub data: Vec<u8>,
    pub description: Option<String>,
    pub content_type: Option<String>,
    pub duration_secs: Option<f64>,
    pub waveform: Option<String>,
}

impl FileUpload {
    /// Voice messages carry a duration and a waveform
    #[must_use]
    pub const fn is_voice_message(&self) -> bool {
        self.duration_secs.is_some() && self.waveform.is_some()
    }

    /// Spoilered files keep the `SPOILER_` filename prefix
    #[must_use]
    pub fn is_spoiler(&self) -> bool {
        self.filename.starts_with("SPOILER_")
    }

    /// Descriptor placed in `payload_json`
    #[must_use]
    pub fn as_payload(&self, index: usize) -> AttachmentPayload {
        AttachmentPayload {
            id: index,
            filename: self.filename.clone(),
            description: self.description.clone(),
            duration_secs: self.duration_secs,
            waveform: self.waveform.clone(),
        }
    }
}

/// Discord REST operations used by the proxy engine
#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// Application id of the worker's bot
    fn application_id(&self) -> Snowflake;

    /// Post a message to a channel
    async fn create_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        payload: &MessagePayload,
        files: &[FileUpload],
    ) -> Result<Message>;

    /// Delete a message, optionally recording an audit log reason
    async fn delete_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        message_id: Snowflake,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Execute a webhook and wait for the created message
    async fn execute_webhook(
        &self,
        webhook: &Webhook,
        thread_id: Option<Snowflake>,
        payload: &MessagePayload,
        files: &[FileUpload],
    ) -> Result<Message>;

    /// Delete a message previously sent through a webhook
    async fn delete_webhook_message(
        &self,
        webhook: &Webhook,
        message_id: Snowflake,
        thread_id: Option<Snowflake>,
    ) -> Result<()>;

    /// List a channel's webhooks
    async fn list_webhooks(&self, channel_id: Snowflake) -> Result<Vec<Webhook>>;

    /// Create a webhook in a channel
    async fn create_webhook(&self, channel_id: Snowflake, name: &str) -> Result<Webhook>;

    /// Upload an application-owned emoji from a data URI
    async fn create_application_emoji(
        &self,
        auth: Auth<'_>,
        name: &str,
        image: &str,
    ) -> Result<Emoji>;

    /// Delete an application-owned emoji
    async fn delete_application_emoji(&self, auth: Auth<'_>, emoji_id: Snowflake) -> Result<()>;

    /// Fetch a guild member as raw JSON
    async fn get_guild_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<serde_json::Value>;

    /// Download a CDN asset
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}
