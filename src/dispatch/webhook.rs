//! Shared webhook transport
//!
//! Each channel (the parent, for threads) gets a pool of two webhooks. The
//! pool index advances whenever a different persona posts, so consecutive
//! messages from different personas never share a webhook and the client does
//! not merge them under one header.

use std::sync::Arc;

use super::reply::{Reply, allowed_mentions, format_reply};
use super::{Dispatcher, Prepared, Target};
use crate::cache::{EntityCache, EntityKind};
use crate::db::{DebugTrace, ReplyFormat};
use crate::discord::{Channel, Credential, DiscordApi, Message, MessagePayload, Snowflake, Webhook};
use crate::emoji::EmojiGuard;
use crate::proxy::ResolvedProxy;
use crate::{Error, Result};

/// Name of the first webhook in a channel's pool
pub const PRIMARY_WEBHOOK_NAME: &str = "/plu/ral proxy";

/// Webhooks per channel allowed by the platform
pub const MAX_CHANNEL_WEBHOOKS: usize = 15;

/// Pool slot (1 or 2) to post with
#[must_use]
pub const fn pool_index(last_webhook: u64, use_next: bool) -> u64 {
    let last = if use_next {
        last_webhook.wrapping_add(1)
    } else {
        last_webhook
    };
    last % 2 + 1
}

/// Webhook name for a pool slot
#[must_use]
pub fn webhook_name(index: u64) -> String {
    if index == 1 {
        PRIMARY_WEBHOOK_NAME.to_string()
    } else {
        format!("{PRIMARY_WEBHOOK_NAME} {index}/2")
    }
}

/// Per-channel webhook lists backed by the entity cache
#[derive(Clone)]
pub struct WebhookPool {
    api: Arc<dyn DiscordApi>,
    cache: EntityCache,
}

impl WebhookPool {
    #[must_use]
    pub fn new(api: Arc<dyn DiscordApi>, cache: EntityCache) -> Self {
        Self { api, cache }
    }

    /// Drop the cached list for a channel and fetch it again
    ///
    /// # Errors
    ///
    /// Returns error if the list cannot be fetched or stored
    pub async fn refresh(&self, channel_id: Snowflake, guild_id: Option<Snowflake>) -> Result<Vec<Webhook>> {
        self.cache.delete(EntityKind::Webhooks, &channel_id.to_string())?;

        let webhooks = self.api.list_webhooks(channel_id).await?;
        self.cache.put_webhooks(channel_id, guild_id, &webhooks)?;

        tracing::debug!(channel = %channel_id, count = webhooks.len(), "refreshed webhook list");
        Ok(webhooks)
    }

    /// Cached webhook list, fetched on miss
    ///
    /// # Errors
    ///
    /// Returns error if the list cannot be fetched
    pub async fn list(&self, channel_id: Snowflake, guild_id: Option<Snowflake>) -> Result<Vec<Webhook>> {
        match self.cache.get_webhooks(channel_id)? {
            Some(webhooks) => Ok(webhooks),
            None => self.refresh(channel_id, guild_id).await,
        }
    }

    /// Webhook to post with in `channel`, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebhookLimit`] if the webhook is missing and the
    /// channel is full, or an API error if listing or creation fails
    pub async fn select(&self, channel: &Channel, guild_id: Snowflake, use_next: bool) -> Result<Webhook> {
        let target = webhook_channel(channel)?;
        let name = webhook_name(pool_index(channel.last_webhook, use_next));

        let mut webhooks = self.list(target, Some(guild_id)).await?;
        if let Some(webhook) = webhooks
            .iter()
            .find(|w| w.is_usable() && w.name.as_deref() == Some(name.as_str()))
        {
            return Ok(webhook.clone());
        }

        if webhooks.len() >= MAX_CHANNEL_WEBHOOKS {
            return Err(Error::WebhookLimit(target.get()));
        }

        let webhook = self.api.create_webhook(target, &name).await?;
        if !webhook.is_usable() {
            return Err(Error::Invalid(format!("webhook {} was created without a token", webhook.id)));
        }
        tracing::info!(channel = %target, webhook = %webhook.id, name = %name, "created proxy webhook");

        webhooks.push(webhook.clone());
        self.cache.put_webhooks(target, Some(guild_id), &webhooks)?;
        Ok(webhook)
    }

    /// A specific webhook of `channel`'s pool
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the channel has no such webhook
    pub async fn find(&self, channel: &Channel, guild_id: Snowflake, webhook_id: Snowflake) -> Result<Webhook> {
        let target = webhook_channel(channel)?;

        self.list(target, Some(guild_id))
            .await?
            .into_iter()
            .find(|w| w.id == webhook_id && w.is_usable())
            .ok_or_else(|| Error::NotFound(format!("webhook {webhook_id} in channel {target}")))
    }
}

/// Channel that owns the webhooks: the parent for threads
fn webhook_channel(channel: &Channel) -> Result<Snowflake> {
    if channel.is_thread() {
        channel
            .parent_id
            .ok_or_else(|| Error::CacheMiss(format!("parent of thread {}", channel.id)))
    } else {
        Ok(channel.id)
    }
}

impl Dispatcher {
    /// Build a webhook request, or `None` with a trace entry if the webhook
    /// transport cannot be used
    pub(super) async fn prepare_webhook(
        &self,
        message: &Message,
        guild_id: Snowflake,
        resolved: &ResolvedProxy,
        emoji: &mut EmojiGuard,
        trace: &mut DebugTrace,
    ) -> Result<Option<Prepared>> {
        let Some(channel) = self.cache.get_channel(message.channel_id)? else {
            trace.push("Channel not found in cache.");
            return Ok(None);
        };

        let marker = resolved.last_member_string();
        let use_next = channel.last_member.as_deref() != Some(marker.as_str());

        let webhook = match self.webhooks.select(&channel, guild_id, use_next).await {
            Ok(webhook) => webhook,
            Err(e) if e.is_forbidden() || e.is_not_found() => {
                trace.push("Bot does not have permission to create webhooks.");
                return Ok(None);
            }
            Err(Error::WebhookLimit(_)) => {
                trace.push(format!(
                    "Webhook limit ({MAX_CHANNEL_WEBHOOKS}) reached for this channel. /plu/ral requires 2 webhooks. Please contact a moderator."
                ));
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut content = resolved.content.clone();

        // user-created webhooks render any emoji
        if webhook.application_id.is_some() {
            content = self
                .emoji
                .ensure_renderable(&content, &Credential::Bot, false, emoji, trace)
                .await?;

            if content.chars().count() > self.max_content_len {
                trace.push("Message too long after emoji replacement.");
                return Ok(None);
            }
        }

        let config = &resolved.account.config;
        let mut embeds = Vec::new();
        if let Some(reference) = message.referenced_message.as_deref()
            && config.reply_format != ReplyFormat::None
        {
            match format_reply(
                &content,
                reference,
                guild_id,
                config.reply_format,
                resolved.member.color,
                &self.cdn_url,
            ) {
                Some(Reply::Inline(quoted)) => content = quoted,
                Some(Reply::Embed(embed)) => embeds.push(embed),
                None => {}
            }
        }

        let payload = MessagePayload {
            allowed_mentions: Some(allowed_mentions(&content, config.ping_replies)),
            content,
            username: Some(resolved.display_name()),
            avatar_url: resolved.avatar_url(&self.avatar_url_template),
            embeds,
            ..MessagePayload::default()
        };

        Ok(Some(Prepared {
            target: Target::Webhook {
                thread_id: channel.is_thread().then_some(channel.id),
                webhook,
                advance: use_next,
            },
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_rotation() {
        assert_eq!(pool_index(0, false), 1);
        assert_eq!(pool_index(0, true), 2);
        assert_eq!(pool_index(1, false), 2);
        assert_eq!(pool_index(1, true), 1);
        assert_eq!(pool_index(7, true), 1);
    }

    #[test]
    fn pool_names() {
        assert_eq!(webhook_name(1), "/plu/ral proxy");
        assert_eq!(webhook_name(2), "/plu/ral proxy 2/2");
    }

    #[test]
    fn threads_use_parent_webhooks() {
        let thread = Channel {
            id: Snowflake(5),
            kind: 11,
            parent_id: Some(Snowflake(4)),
            ..Channel::default()
        };
        assert_eq!(webhook_channel(&thread).unwrap(), Snowflake(4));

        let orphan = Channel {
            parent_id: None,
            ..thread
        };
        assert!(webhook_channel(&orphan).is_err());

        let text = Channel {
            id: Snowflake(9),
            ..Channel::default()
        };
        assert_eq!(webhook_channel(&text).unwrap(), Snowflake(9));
    }
}
