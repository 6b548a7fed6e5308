//! Discord payload types
//!
//! Inbound gateway payloads are deserialized leniently: fields the engine
//! does not read are ignored and optional fields default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Discord snowflake id
///
/// Discord sends ids as JSON strings; numbers are accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Raw numeric value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map(Self).map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(Self(n)),
        }
    }
}

/// Message types that may be proxied: default and reply
pub const PROXYABLE_MESSAGE_TYPES: [u8; 2] = [0, 19];

/// Channel types that are threads (announcement, public, private)
pub const THREAD_CHANNEL_TYPES: [u8; 3] = [10, 11, 12];

/// Message flag: suppress push and desktop notifications
pub const FLAG_SUPPRESS_NOTIFICATIONS: u64 = 1 << 12;

/// Message flag: voice message
pub const FLAG_VOICE_MESSAGE: u64 = 1 << 13;

/// A Discord user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Name shown in the client
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

/// Message attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub waveform: Option<String>,
}

/// Reference to another message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Snowflake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Snowflake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Snowflake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_if_not_exists: Option<bool>,
}

/// A message as delivered by `MESSAGE_CREATE` / `MESSAGE_UPDATE` or returned by REST
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sticker_items: Vec<Value>,
    #[serde(default)]
    pub poll: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: Option<u8>,
    #[serde(default)]
    pub webhook_id: Option<Snowflake>,
    #[serde(default)]
    pub message_reference: Option<MessageReference>,
    #[serde(default)]
    pub referenced_message: Option<Box<Message>>,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub flags: u64,

    /// Persona id attached by the reproxy command
    #[serde(rename = "__plural_member", default, skip_serializing_if = "Option::is_none")]
    pub reproxy_member: Option<String>,

    /// Tag index attached by the reproxy command
    #[serde(rename = "__plural_proxy_tag", default, skip_serializing_if = "Option::is_none")]
    pub reproxy_tag: Option<usize>,
}

impl Message {
    /// Whether the message is a candidate for proxying at all
    ///
    /// Bot and webhook authors, direct messages and system message types are
    /// never proxied.
    #[must_use]
    pub fn is_proxy_candidate(&self) -> bool {
        let Some(author) = &self.author else {
            return false;
        };

        !author.bot
            && self.webhook_id.is_none()
            && self.guild_id.is_some()
            && self
                .kind
                .is_some_and(|kind| PROXYABLE_MESSAGE_TYPES.contains(&kind))
    }
}

/// Emoji attached to a reaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionEmoji {
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Guild member fragment attached to reaction events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionMember {
    #[serde(default)]
    pub user: Option<User>,
}

/// `MESSAGE_REACTION_ADD` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionAdd {
    pub user_id: Snowflake,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub member: Option<ReactionMember>,
    #[serde(default)]
    pub emoji: ReactionEmoji,
    #[serde(default)]
    pub message_author_id: Option<Snowflake>,
}

/// `WEBHOOKS_UPDATE` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhooksUpdate {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
}

/// A channel webhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Snowflake,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub application_id: Option<Snowflake>,
    #[serde(default)]
    pub channel_id: Option<Snowflake>,
}

impl Webhook {
    /// Webhooks without a token belong to another application and cannot be executed
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.token.is_some()
    }
}

/// Custom emoji as returned by the emoji endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Emoji {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub animated: bool,
}

/// Cached guild snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub premium_tier: Option<u8>,
}

/// Permission overwrite on a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: Snowflake,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default, with = "permission_bits")]
    pub allow: u64,
    #[serde(default, with = "permission_bits")]
    pub deny: u64,
}

/// Cached channel snapshot
///
/// The `__plural_*` fields are bookkeeping written by the dispatch layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
    #[serde(default)]
    pub last_message_id: Option<Snowflake>,
    #[serde(rename = "__plural_last_member", default)]
    pub last_member: Option<String>,
    #[serde(rename = "__plural_last_webhook", default)]
    pub last_webhook: u64,
}

impl Channel {
    /// Whether the channel is a thread
    #[must_use]
    pub fn is_thread(&self) -> bool {
        THREAD_CHANNEL_TYPES.contains(&self.kind)
    }
}

/// Cached role snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    #[serde(default, with = "permission_bits")]
    pub permissions: u64,
}

/// Cached guild member snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuildMember {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
}

/// Outbound embed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Outbound allowed-mentions object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
    pub roles: Vec<Snowflake>,
    pub users: Vec<Snowflake>,
    pub replied_user: bool,
}

/// Attachment descriptor inside `payload_json` for multipart uploads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub id: usize,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<String>,
}

/// Body for create-message and execute-webhook calls
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessagePayload {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
}

/// Discord encodes permission bitsets as decimal strings
mod permission_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}
