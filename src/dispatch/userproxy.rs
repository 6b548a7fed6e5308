//! Dedicated identity transport: posting as a persona's own bot

use serenity::model::permissions::Permissions;

use super::reply::allowed_mentions;
use super::{Dispatcher, Prepared, Target};
use crate::Result;
use crate::db::DebugTrace;
use crate::discord::{Credential, FLAG_SUPPRESS_NOTIFICATIONS, Message, MessagePayload, MessageReference, Snowflake};
use crate::emoji::EmojiGuard;
use crate::permissions::effective_permissions;
use crate::proxy::ResolvedProxy;

impl Dispatcher {
    /// Build a dedicated-bot request, or `None` with a trace entry if the
    /// persona's bot cannot post here
    pub(super) async fn prepare_userproxy(
        &self,
        message: &Message,
        guild_id: Snowflake,
        resolved: &ResolvedProxy,
        emoji: &mut EmojiGuard,
        trace: &mut DebugTrace,
    ) -> Result<Option<Prepared>> {
        let Some(userproxy) = resolved.member.userproxy_in(guild_id) else {
            return Ok(None);
        };

        if resolved.has_tag_avatar() {
            trace.push("Avatar proxy tag used, falling back to webhook.");
            return Ok(None);
        }

        if self.cache.get_member(guild_id, userproxy.bot_id)?.is_none() {
            trace.push("Userproxy member not found in cache. Fetching...");

            match self.api.get_guild_member(guild_id, userproxy.bot_id).await {
                Ok(member) => self.cache.put_fetched_member(guild_id, userproxy.bot_id, &member)?,
                Err(e) if e.is_not_found() => {
                    trace.push("Userproxy member not found in server.");
                    self.members.remove_userproxy_guild(&resolved.member.id, guild_id)?;
                    tracing::info!(
                        member = %resolved.member.id,
                        guild = %guild_id,
                        "userproxy bot left guild"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!(bot = %userproxy.bot_id, error = %e, "failed to fetch userproxy member");
                    trace.push("Failed to fetch userproxy member.");
                    return Ok(None);
                }
            }
        }

        let permissions = effective_permissions(
            &self.cache,
            guild_id,
            message.channel_id,
            userproxy.bot_id,
            trace,
        )?;

        if !permissions.contains(Permissions::VIEW_CHANNEL) {
            trace.push("Userproxy bot cannot view this channel.");
            return Ok(None);
        }

        if !permissions.contains(Permissions::SEND_MESSAGES) {
            trace.push("Userproxy bot cannot send messages in this channel.");
            return Ok(None);
        }

        let credential = Credential::Dedicated {
            token: userproxy.token.clone(),
            application_id: userproxy.bot_id,
        };

        let content = match self
            .emoji
            .ensure_renderable(&resolved.content, &credential, true, emoji, trace)
            .await
        {
            Ok(content) => content,
            Err(e) if e.is_unauthorized() => {
                trace.push("Userproxy bot token is invalid or expired.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if content.chars().count() > self.max_content_len {
            trace.push("Message too long after emoji replacement.");
            return Ok(None);
        }

        let payload = MessagePayload {
            allowed_mentions: Some(allowed_mentions(
                &content,
                resolved.account.config.ping_replies,
            )),
            content,
            message_reference: message.message_reference.clone().map(|reference| MessageReference {
                fail_if_not_exists: Some(false),
                ..reference
            }),
            flags: (!message.mentions.is_empty()).then_some(FLAG_SUPPRESS_NOTIFICATIONS),
            ..MessagePayload::default()
        };

        Ok(Some(Prepared {
            target: Target::Dedicated {
                credential,
                bot_id: userproxy.bot_id,
            },
            payload,
        }))
    }
}
