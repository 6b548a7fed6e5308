//! Reply context for webhook proxies
//!
//! Webhooks cannot send native replies, so the replied-to message is quoted
//! either as a `-#` line above the content or as an embed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::db::ReplyFormat;
use crate::discord::{AllowedMentions, Embed, EmbedAuthor, Message, Snowflake, User};

/// Quote line produced by [`format_reply`] in inline mode
pub static INLINE_REPLY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-# \[↪\]\(<https://discord\.com/channels/\d+/\d+/\d+>\) (?:<@(\d+)>)?")
        .expect("valid inline reply pattern")
});

static ROLE_MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@&(\d+)>").expect("valid role mention pattern"));

static USER_MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?(\d+)>").expect("valid user mention pattern"));

/// Markdown spans stripped from quoted text, applied in order
static MARKDOWN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\*([^*]+)\*",
        r"_([^_]+)_",
        r"\*\*([^*]+)\*\*",
        r"__([^_]+)__",
        r"~~([^~]+)~~",
        r"`([^`]+)`",
        r"```([\s\S]+?)```",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid markdown pattern"))
    .collect()
});

/// Characters of the replied-to message kept in the quote
const PREVIEW_LEN: usize = 75;

/// Embed colour when the persona has none
pub const DEFAULT_EMBED_COLOR: u32 = 0x0072_89DA;

/// Discord's message length limit
const MAX_MESSAGE_LEN: usize = 2000;

/// Rendered reply context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Full message content with the quote line prepended
    Inline(String),
    /// Embed to attach after the content
    Embed(Embed),
}

/// Render reply context for `proxy_content` replying to `reference`
///
/// Inline quotes that would push the message over 2000 characters fall back to
/// an embed.
#[must_use]
pub fn format_reply(
    proxy_content: &str,
    reference: &Message,
    guild_id: Snowflake,
    format: ReplyFormat,
    color: Option<u32>,
    cdn_url: &str,
) -> Option<Reply> {
    let author = reference.author.clone().unwrap_or_default();
    let jump_url = format!(
        "https://discord.com/channels/{guild_id}/{}/{}",
        reference.channel_id, reference.id
    );

    match format {
        ReplyFormat::None => None,
        ReplyFormat::Inline => {
            let mention = if reference.webhook_id.is_some() {
                format!("`@{}`", author.display_name())
            } else {
                format!("<@{}>", author.id)
            };

            let mut quoted = reference.content.as_str();
            if INLINE_REPLY_PATTERN.is_match(quoted) {
                quoted = quoted.split_once('\n').map_or("", |(_, rest)| rest);
            }
            let quoted = preview(&quoted.replace('\n', " "));
            let mut quoted = handle_discord_markdown(&quoted).replace("://", ":/\u{200b}/");

            if quoted.is_empty() {
                quoted = if reference.attachments.is_empty() {
                    format!("[*Click to see message*](<{jump_url}>)")
                } else {
                    format!("[*Click to see attachment*](<{jump_url}>)")
                };
            }

            let content = format!("-# [↪](<{jump_url}>) {mention} {quoted}\n{proxy_content}");
            if content.chars().count() > MAX_MESSAGE_LEN {
                return format_reply("", reference, guild_id, ReplyFormat::Embed, color, cdn_url);
            }
            Some(Reply::Inline(content))
        }
        ReplyFormat::Embed => {
            let quoted = preview(&reference.content);
            let attachments = reference.attachments.len();

            let description = if quoted.trim().is_empty() {
                match attachments {
                    0 => format!("*[click to see message]({jump_url})*"),
                    1 => format!("*[click to see attachment]({jump_url})*"),
                    _ => format!("*[click to see attachments]({jump_url})*"),
                }
            } else {
                let marker = if attachments > 0 { "✉️ " } else { "" };
                format!("{marker}**[Reply to:]({jump_url})** {quoted}")
            };

            Some(Reply::Embed(Embed {
                author: Some(EmbedAuthor {
                    name: format!("{} ↩️", author.display_name()),
                    icon_url: Some(avatar_url(&author, cdn_url)),
                }),
                color: Some(color.unwrap_or(DEFAULT_EMBED_COLOR)),
                description: Some(description),
                ..Embed::default()
            }))
        }
    }
}

/// First 75 characters, trimmed, with an ellipsis when cut
fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_LEN {
        return content.to_string();
    }
    let cut: String = content.chars().take(PREVIEW_LEN).collect();
    format!("{}…", cut.trim())
}

/// Avatar of a user, or the default avatar for accounts without one
fn avatar_url(user: &User, cdn_url: &str) -> String {
    if let Some(avatar) = user.avatar.as_deref() {
        let ext = if avatar.starts_with("a_") { "gif" } else { "png" };
        return format!("{cdn_url}/avatars/{}/{avatar}.{ext}", user.id);
    }

    let index = match user.discriminator.as_deref() {
        None | Some("0" | "0000") => (user.id.get() >> 22) % 6,
        Some(discriminator) => discriminator.parse::<u64>().unwrap_or_default() % 5,
    };
    format!("{cdn_url}/embed/avatars/{index}.png")
}

/// Strip markdown spans, then escape the remaining markdown characters
#[must_use]
pub fn handle_discord_markdown(text: &str) -> String {
    let mut stripped = text.to_string();
    for pattern in MARKDOWN_PATTERNS.iter() {
        stripped = pattern.replace_all(&stripped, "${1}").into_owned();
    }

    let mut escaped = String::with_capacity(stripped.len());
    let mut previous = None;
    for c in stripped.chars() {
        if matches!(c, '*' | '_' | '~' | '`') && previous != Some('\\') {
            escaped.push('\\');
        }
        escaped.push(c);
        previous = Some(c);
    }
    escaped
}

/// Mentions a proxied message may ping
///
/// `@everyone` is only allowed if the text contains it, role and user pings
/// only for ids mentioned in the text. The quote line of an inline reply is
/// excluded; its author is pinged only with `ping_replies`.
#[must_use]
pub fn allowed_mentions(content: &str, ping_replies: bool) -> AllowedMentions {
    let mut replied_user: Option<Snowflake> = None;
    let body = match INLINE_REPLY_PATTERN.captures(content) {
        Some(captures) => {
            if ping_replies {
                replied_user = captures.get(1).and_then(|id| id.as_str().parse().ok());
            }
            content.split_once('\n').map_or("", |(_, rest)| rest)
        }
        None => content,
    };

    let parse = if body.contains("@everyone") || body.contains("@here") {
        vec!["everyone".to_string()]
    } else {
        Vec::new()
    };

    let roles: BTreeSet<Snowflake> = ROLE_MENTION_PATTERN
        .captures_iter(body)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();

    let mut users: BTreeSet<Snowflake> = USER_MENTION_PATTERN
        .captures_iter(body)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    users.extend(replied_user);

    AllowedMentions {
        parse,
        roles: roles.into_iter().collect(),
        users: users.into_iter().collect(),
        replied_user: ping_replies,
    }
}
