//! Dispatch: replacing an original message with a persona's post
//!
//! A dispatch deletes the original and posts the replacement concurrently,
//! trying the persona's dedicated bot first when it is present in the guild and
//! the channel's shared webhook second. Whatever happens, emoji cloned for the
//! attempt are deleted before the dispatch returns.

pub mod attachments;
pub mod reply;
pub mod userproxy;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use serenity::model::permissions::Permissions;

pub use webhook::WebhookPool;

use crate::cache::EntityCache;
use crate::config::Config;
use crate::db::{
    DbPool, DebugTrace, EmojiRepo, LedgerRepo, MemberRepo, MessageRecord, MessageRepo, PendingRepo,
    ProxyLog, ProxyLogRepo, TraceRepo,
};
use crate::discord::{
    Auth, Credential, DiscordApi, Embed, EmbedField, EmbedFooter, FileUpload, Message,
    MessagePayload, MessageReference, ReactionAdd, Snowflake, Webhook,
};
use crate::emoji::{EmojiGuard, EmojiManager};
use crate::permissions::effective_permissions;
use crate::proxy::{ResolvedProxy, Resolver, TagMatcher};
use crate::{Error, Result};

/// Trace entry written when a proxy was posted
pub const SUCCESS_TRACE: &str = "Successfully proxied message.";

/// Reaction that deletes a proxied message
pub const DELETE_REACTION: &str = "❌";

/// Audit log reason on deleted originals
const DELETE_REASON: &str = "/plu/ral proxy";

/// How long the missing-permission notice stays up
pub const NOTICE_LIFETIME: Duration = Duration::from_secs(10);

const CRITICAL_DESCRIPTION: &str = "Proxy deleted original message but failed to send proxy.";

/// Permissions the worker's bot needs in a channel, with the trace entry for each
const BOT_PERMISSIONS: [(Permissions, &str); 3] = [
    (
        Permissions::SEND_MESSAGES,
        "/plu/ral cannot send messages in this channel.",
    ),
    (
        Permissions::MANAGE_MESSAGES,
        "/plu/ral cannot delete messages in this channel.",
    ),
    (
        Permissions::MANAGE_WEBHOOKS,
        "/plu/ral cannot create webhooks in this channel.",
    ),
];

/// Dispatch tuning taken from configuration
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub cdn_url: String,
    pub avatar_url_template: String,
    pub max_content_len: usize,
    pub emoji_clone_limit: usize,
    pub regex_budget: Duration,
}

impl DispatchOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            cdn_url: config.discord.cdn_url.trim_end_matches('/').to_string(),
            avatar_url_template: config.discord.avatar_url_template.clone(),
            max_content_len: config.proxy.max_content_len,
            emoji_clone_limit: config.proxy.emoji_clone_limit,
            regex_budget: config.proxy.regex_budget,
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            cdn_url: "https://cdn.discordapp.com".to_string(),
            avatar_url_template: "https://cdn.plural.gg/images/{key}".to_string(),
            max_content_len: 2000,
            emoji_clone_limit: 10,
            regex_budget: Duration::from_micros(500),
        }
    }
}

/// How a proxy was posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The persona's own bot
    Dedicated,
    /// A shared channel webhook
    Webhook,
}

impl Transport {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dedicated => "userproxy",
            Self::Webhook => "webhook",
        }
    }
}

/// Result of handling a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// The original was replaced
    Proxied {
        proxy_id: Snowflake,
        transport: Transport,
    },
    /// Nothing was changed; the debug trace says why
    Skipped,
}

/// A request a transport is ready to send
pub(crate) struct Prepared {
    target: Target,
    payload: MessagePayload,
}

pub(crate) enum Target {
    Webhook {
        webhook: Webhook,
        thread_id: Option<Snowflake>,
        /// Whether the pool index moves on after this post
        advance: bool,
    },
    Dedicated {
        credential: Credential,
        bot_id: Snowflake,
    },
}

impl Target {
    const fn transport(&self) -> Transport {
        match self {
            Self::Webhook { .. } => Transport::Webhook,
            Self::Dedicated { .. } => Transport::Dedicated,
        }
    }
}

/// Resolves and dispatches proxies
pub struct Dispatcher {
    api: Arc<dyn DiscordApi>,
    cache: EntityCache,
    resolver: Resolver,
    emoji: EmojiManager,
    webhooks: WebhookPool,
    members: MemberRepo,
    messages: MessageRepo,
    ledger: LedgerRepo,
    pending: PendingRepo,
    traces: TraceRepo,
    proxy_logs: ProxyLogRepo,
    cdn_url: String,
    avatar_url_template: String,
    max_content_len: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        api: Arc<dyn DiscordApi>,
        pool: &DbPool,
        cache: EntityCache,
        options: &DispatchOptions,
    ) -> Self {
        Self {
            resolver: Resolver::new(pool, cache.clone(), TagMatcher::new(options.regex_budget)),
            emoji: EmojiManager::new(
                Arc::clone(&api),
                EmojiRepo::new(pool.clone()),
                options.cdn_url.clone(),
                options.emoji_clone_limit,
            ),
            webhooks: WebhookPool::new(Arc::clone(&api), cache.clone()),
            members: MemberRepo::new(pool.clone()),
            messages: MessageRepo::new(pool.clone()),
            ledger: LedgerRepo::new(pool.clone()),
            pending: PendingRepo::new(pool.clone()),
            traces: TraceRepo::new(pool.clone()),
            proxy_logs: ProxyLogRepo::new(pool.clone()),
            cdn_url: options.cdn_url.clone(),
            avatar_url_template: options.avatar_url_template.clone(),
            max_content_len: options.max_content_len,
            api,
            cache,
        }
    }

    /// Channel webhook pools
    #[must_use]
    pub const fn webhooks(&self) -> &WebhookPool {
        &self.webhooks
    }

    /// Handle a newly created message
    ///
    /// The debug trace is saved under the original id, and under the proxy id
    /// as well when one was posted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Critical`] if the original was deleted but no
    /// replacement could be posted, or a storage error
    pub async fn process(&self, message: &Message) -> Result<ProxyOutcome> {
        let mut trace = DebugTrace::new();
        let outcome = self.process_traced(message, &mut trace).await;

        let author_id = message.author.as_ref().map(|a| a.id).unwrap_or_default();
        let ids = match &outcome {
            Ok(ProxyOutcome::Proxied { proxy_id, .. }) => vec![message.id, *proxy_id],
            _ => vec![message.id],
        };
        if let Err(e) = self.traces.save(author_id, &ids, &trace) {
            tracing::warn!(message = %message.id, error = %e, "failed to save debug trace");
        }

        outcome
    }

    /// Handle an edited message
    ///
    /// Only the channel's latest message is proxied on edit, and never while a
    /// dispatch for it is in flight.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::process`]
    pub async fn process_update(&self, message: &Message) -> Result<ProxyOutcome> {
        let Some(channel) = self.cache.get_channel(message.channel_id)? else {
            return Ok(ProxyOutcome::Skipped);
        };

        if channel.last_message_id != Some(message.id)
            || self.pending.exists(message.channel_id, message.id)?
        {
            return Ok(ProxyOutcome::Skipped);
        }

        self.process(message).await
    }

    async fn process_traced(&self, message: &Message, trace: &mut DebugTrace) -> Result<ProxyOutcome> {
        if message.content.is_empty() && message.attachments.is_empty() && message.poll.is_none() {
            trace.push("No content, attachments, or poll present in message.");
            return Ok(ProxyOutcome::Skipped);
        }

        if !message.sticker_items.is_empty() {
            trace.push("Stickers are not supported.");
            return Ok(ProxyOutcome::Skipped);
        }

        if message.poll.is_some() {
            trace.push("Poll support coming later.");
            return Ok(ProxyOutcome::Skipped);
        }

        let Some(resolved) = self.resolver.resolve(message, trace)? else {
            return Ok(ProxyOutcome::Skipped);
        };

        self.dispatch(message, &resolved, trace).await
    }

    /// Replace `message` with a post as the resolved persona
    ///
    /// # Errors
    ///
    /// Returns [`Error::Critical`] if the original was deleted but no
    /// replacement could be posted, or a storage error
    pub async fn dispatch(
        &self,
        message: &Message,
        resolved: &ResolvedProxy,
        trace: &mut DebugTrace,
    ) -> Result<ProxyOutcome> {
        let mut emoji = EmojiGuard::new();
        let outcome = self.dispatch_with(message, resolved, &mut emoji, trace).await;
        emoji.release_all(self.api.as_ref()).await;
        outcome
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch_with(
        &self,
        message: &Message,
        resolved: &ResolvedProxy,
        emoji: &mut EmojiGuard,
        trace: &mut DebugTrace,
    ) -> Result<ProxyOutcome> {
        let (Some(author), Some(guild_id)) = (message.author.as_ref(), message.guild_id) else {
            trace.push("Message was not sent by a user in a server.");
            return Ok(ProxyOutcome::Skipped);
        };
        let channel_id = message.channel_id;

        let permissions = effective_permissions(
            &self.cache,
            guild_id,
            channel_id,
            self.api.application_id(),
            trace,
        )?;
        for (required, missing) in BOT_PERMISSIONS {
            if !permissions.contains(required) {
                trace.push(missing);
                return Ok(ProxyOutcome::Skipped);
            }
        }

        if resolved.content.chars().count() > self.max_content_len {
            trace.push(format!(
                "/plu/ral cannot send messages longer than {} characters.",
                self.max_content_len
            ));
            return Ok(ProxyOutcome::Skipped);
        }

        let Some(guild) = self.cache.get_guild(guild_id)? else {
            trace.push("Guild not found in cache.");
            return Ok(ProxyOutcome::Skipped);
        };

        let limit = attachments::filesize_limit(guild.premium_tier);
        if !attachments::within_budget(attachments::declared_size(&message.attachments), limit, trace) {
            return Ok(ProxyOutcome::Skipped);
        }

        let files = match attachments::download_all(self.api.as_ref(), &message.attachments).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(message = %message.id, error = %e, "failed to download attachments");
                trace.push("Failed to download attachments.");
                return Ok(ProxyOutcome::Skipped);
            }
        };
        if !attachments::within_budget(attachments::downloaded_size(&files), limit, trace) {
            return Ok(ProxyOutcome::Skipped);
        }

        if !self.pending.try_mark(channel_id, message.id)? {
            trace.push("Message is already being proxied.");
            return Ok(ProxyOutcome::Skipped);
        }

        self.proxy_logs.insert(&ProxyLog::new(
            author.id,
            &author.username,
            message.id,
            channel_id,
            &message.content,
        ))?;

        let transports: &[Transport] = if resolved.member.userproxy_in(guild_id).is_some() {
            &[Transport::Dedicated, Transport::Webhook]
        } else {
            &[Transport::Webhook]
        };

        let mut original_deleted = false;

        for (position, transport) in transports.iter().copied().enumerate() {
            let last = position + 1 == transports.len();

            let prepared = match transport {
                Transport::Dedicated => {
                    self.prepare_userproxy(message, guild_id, resolved, emoji, trace)
                        .await
                }
                Transport::Webhook => {
                    self.prepare_webhook(message, guild_id, resolved, emoji, trace)
                        .await
                }
            };
            let prepared = match prepared {
                Ok(prepared) => prepared,
                Err(e) if original_deleted => {
                    return Err(self.critical(channel_id, message.id, &e.to_string()).await);
                }
                Err(e) => return Err(e),
            };

            let Some(prepared) = prepared else {
                if last && original_deleted {
                    return Err(self
                        .critical(channel_id, message.id, "no transport left after the original was deleted")
                        .await);
                }
                continue;
            };

            let already_deleted = original_deleted;
            let delete = async {
                if already_deleted {
                    Ok(())
                } else {
                    self.api
                        .delete_message(Auth::Bot, channel_id, message.id, Some(DELETE_REASON))
                        .await
                }
            };
            let (deleted, posted) = tokio::join!(delete, self.post(channel_id, &prepared, &files));

            match (deleted, posted) {
                (Err(delete_error), Err(post_error)) => {
                    tracing::warn!(
                        message = %message.id,
                        transport = transport.as_str(),
                        delete_error = %delete_error,
                        post_error = %post_error,
                        "failed to delete original and send proxy"
                    );
                    trace.push("Failed to delete message and send proxy.");
                    return Ok(ProxyOutcome::Skipped);
                }
                (Err(delete_error), Ok(proxied)) => {
                    tracing::warn!(
                        message = %message.id,
                        proxy = %proxied.id,
                        error = %delete_error,
                        "failed to delete original, removing proxy"
                    );
                    if let Err(e) = self
                        .api
                        .delete_message(Auth::Bot, channel_id, proxied.id, None)
                        .await
                    {
                        tracing::error!(proxy = %proxied.id, error = %e, "failed to remove proxy");
                    }
                    trace.push("Failed to delete original message.");
                    return Ok(ProxyOutcome::Skipped);
                }
                (Ok(()), Err(post_error)) => {
                    original_deleted = true;
                    emoji.release_all(self.api.as_ref()).await;

                    if last {
                        return Err(self
                            .critical(channel_id, message.id, &post_error.to_string())
                            .await);
                    }

                    tracing::warn!(
                        message = %message.id,
                        transport = transport.as_str(),
                        error = %post_error,
                        "proxy send failed, trying next transport"
                    );
                    trace.push("Userproxy bot failed to send message in this channel.");
                    if let Target::Dedicated { bot_id, .. } = &prepared.target {
                        self.cache.invalidate_member(guild_id, *bot_id)?;
                    }
                }
                (Ok(()), Ok(proxied)) => {
                    trace.push(SUCCESS_TRACE);
                    self.record_success(message, author.id, resolved, &prepared.target, &proxied)?;

                    tracing::info!(
                        message = %message.id,
                        proxy = %proxied.id,
                        member = %resolved.member.id,
                        transport = transport.as_str(),
                        "proxied message"
                    );
                    return Ok(ProxyOutcome::Proxied {
                        proxy_id: proxied.id,
                        transport,
                    });
                }
            }
        }

        Ok(ProxyOutcome::Skipped)
    }

    async fn post(&self, channel_id: Snowflake, prepared: &Prepared, files: &[FileUpload]) -> Result<Message> {
        match &prepared.target {
            Target::Webhook {
                webhook, thread_id, ..
            } => {
                self.api
                    .execute_webhook(webhook, *thread_id, &prepared.payload, files)
                    .await
            }
            Target::Dedicated { credential, .. } => {
                self.api
                    .create_message(credential.auth(), channel_id, &prepared.payload, files)
                    .await
            }
        }
    }

    fn record_success(
        &self,
        message: &Message,
        author_id: Snowflake,
        resolved: &ResolvedProxy,
        target: &Target,
        proxied: &Message,
    ) -> Result<()> {
        let (webhook_id, bot_id) = match target {
            Target::Webhook { webhook, .. } => (Some(webhook.id), None),
            Target::Dedicated { bot_id, .. } => (None, Some(*bot_id)),
        };

        self.messages.insert(&MessageRecord {
            original_id: Some(message.id),
            proxy_id: proxied.id,
            author_id,
            account_id: Some(resolved.account.id.clone()),
            channel_id: message.channel_id,
            member_id: resolved.member.id.clone(),
            reason: resolved.reason.clone(),
            webhook_id,
            bot_id,
            reference_id: message
                .referenced_message
                .as_ref()
                .map(|m| m.id)
                .or_else(|| message.message_reference.as_ref()?.message_id),
        })?;

        self.ledger.record(author_id, &resolved.member.id)?;

        if let Target::Webhook { advance, .. } = target {
            self.cache
                .set_last_poster(message.channel_id, &resolved.last_member_string(), *advance)?;
        }

        tracing::debug!(transport = target.transport().as_str(), "recorded proxy");
        Ok(())
    }

    /// Report a proxy that lost the original message, returning the error to raise
    async fn critical(&self, channel_id: Snowflake, original_id: Snowflake, reason: &str) -> Error {
        tracing::error!(
            channel = %channel_id,
            message = %original_id,
            reason = %reason,
            "proxy deleted original message but failed to send proxy"
        );

        let notice = MessagePayload {
            embeds: vec![Embed {
                title: Some("Proxy Failed".to_string()),
                description: Some(CRITICAL_DESCRIPTION.to_string()),
                color: Some(0x00FF_6969),
                fields: vec![EmbedField {
                    name: "Reason".to_string(),
                    value: reason.chars().take(1024).collect(),
                    inline: true,
                }],
                footer: Some(EmbedFooter {
                    text: "Please report this in the support server, if possible.".to_string(),
                }),
                ..Embed::default()
            }],
            ..MessagePayload::default()
        };

        if let Err(e) = self
            .api
            .create_message(Auth::Bot, channel_id, &notice, &[])
            .await
        {
            tracing::warn!(channel = %channel_id, error = %e, "failed to send proxy failure notice");
        }

        Error::Critical(format!("{CRITICAL_DESCRIPTION} ({reason})"))
    }

    /// Delete a proxied message when its author reacts with ❌
    ///
    /// Returns whether the message was deleted.
    ///
    /// # Errors
    ///
    /// Returns error if a store read or a delete call fails
    pub async fn delete_on_reaction(&self, reaction: &ReactionAdd) -> Result<bool> {
        if reaction.user_id == self.api.application_id()
            || reaction.emoji.name.as_deref() != Some(DELETE_REACTION)
        {
            return Ok(false);
        }

        let Some(guild_id) = reaction.guild_id else {
            return Ok(false);
        };
        let Some(user) = reaction.member.as_ref().and_then(|m| m.user.as_ref()) else {
            return Ok(false);
        };
        if user.bot {
            return Ok(false);
        }

        let Some(record) = self.messages.find_by_proxy_id(reaction.message_id)? else {
            return Ok(false);
        };
        if record.author_id != reaction.user_id {
            return Ok(false);
        }

        let Some(channel) = self.cache.get_channel(reaction.channel_id)? else {
            return Ok(false);
        };

        if let Some(webhook_id) = record.webhook_id {
            let webhook = self.webhooks.find(&channel, guild_id, webhook_id).await?;
            let thread_id = channel.is_thread().then_some(channel.id);

            return match self
                .api
                .delete_webhook_message(&webhook, reaction.message_id, thread_id)
                .await
            {
                Ok(()) => Ok(true),
                Err(e) if e.is_forbidden() => {
                    self.send_delete_notice(reaction.channel_id, reaction.message_id)
                        .await;
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        }

        let Some(bot_id) = record.bot_id.or(reaction.message_author_id) else {
            return Ok(false);
        };
        let Some(userproxy) = self
            .members
            .find_by_userproxy_bot(bot_id)?
            .and_then(|member| member.userproxy)
        else {
            return Ok(false);
        };

        self.api
            .delete_message(
                Auth::Dedicated {
                    token: &userproxy.token,
                    application_id: userproxy.bot_id,
                },
                reaction.channel_id,
                reaction.message_id,
                None,
            )
            .await?;
        Ok(true)
    }

    /// Tell the reactor the message could not be deleted, then remove the notice
    async fn send_delete_notice(&self, channel_id: Snowflake, message_id: Snowflake) {
        let notice = MessagePayload {
            content: "Failed to delete this message, missing permissions.\n\n(This message will be deleted in 10 seconds)"
                .to_string(),
            message_reference: Some(MessageReference {
                message_id: Some(message_id),
                ..MessageReference::default()
            }),
            ..MessagePayload::default()
        };

        let sent = match self
            .api
            .create_message(Auth::Bot, channel_id, &notice, &[])
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                if !e.is_forbidden() {
                    tracing::warn!(channel = %channel_id, error = %e, "failed to send delete notice");
                }
                return;
            }
        };

        tokio::time::sleep(NOTICE_LIFETIME).await;

        if let Err(e) = self
            .api
            .delete_message(Auth::Bot, channel_id, sent.id, None)
            .await
        {
            tracing::warn!(channel = %channel_id, error = %e, "failed to remove delete notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names() {
        assert_eq!(Transport::Dedicated.as_str(), "userproxy");
        assert_eq!(Transport::Webhook.as_str(), "webhook");
    }

    #[test]
    fn default_options() {
        let options = DispatchOptions::default();
        assert_eq!(options.max_content_len, 2000);
        assert_eq!(options.emoji_clone_limit, 10);
        assert!(options.avatar_url_template.contains("{key}"));
    }
}
