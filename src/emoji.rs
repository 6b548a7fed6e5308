//! Emoji lifecycle for proxied messages
//!
//! Webhooks and dedicated bots can only render custom emoji their application
//! can see. Emoji the bot does not know are cloned as application emoji for the
//! lifetime of one dispatch and deleted afterwards.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use regex::Regex;

use crate::Result;
use crate::db::{DebugTrace, EmojiRepo};
use crate::discord::{Credential, DiscordApi, Emoji, Snowflake};

/// `<:name:id>` and `<a:name:id>`
static EMOJI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(a)?:(\w{2,32}):(\d+)>").expect("valid emoji pattern"));

/// Markdown links to emoji CDN images, as posted by emoji relay bots
static LINKED_EMOJI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[.+\]\((https://cdn\.discordapp\.com/emojis/\d+\..+size(?:.+animated)?.+name.+)\)")
        .expect("valid linked emoji pattern")
});

/// Clone names keep this many characters of the source name
const CLONE_NAME_LEN: usize = 28;

/// A custom emoji referenced by a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbableEmoji {
    pub id: Snowflake,
    pub name: String,
    pub animated: bool,
    /// Text in the message that references it
    pub source: String,
}

impl ProbableEmoji {
    /// CDN path of the image
    #[must_use]
    pub fn image_path(&self) -> String {
        let ext = if self.animated { "gif" } else { "png" };
        format!("/emojis/{}.{ext}", self.id)
    }
}

/// Render an emoji token
#[must_use]
pub fn emoji_token(emoji: &Emoji) -> String {
    format!(
        "<{}:{}:{}>",
        if emoji.animated { "a" } else { "" },
        emoji.name,
        emoji.id
    )
}

/// Custom emoji referenced by `content`, deduplicated by source text
#[must_use]
pub fn find_emojis(content: &str) -> Vec<ProbableEmoji> {
    let mut found = Vec::new();
    let mut sources = HashSet::new();

    for captures in EMOJI_PATTERN.captures_iter(content) {
        let (Some(source), Some(name), Some(id)) = (captures.get(0), captures.get(2), captures.get(3))
        else {
            continue;
        };
        let Ok(id) = id.as_str().parse() else {
            continue;
        };

        if sources.insert(source.as_str().to_string()) {
            found.push(ProbableEmoji {
                id,
                name: name.as_str().to_string(),
                animated: captures.get(1).is_some(),
                source: source.as_str().to_string(),
            });
        }
    }

    for captures in LINKED_EMOJI_PATTERN.captures_iter(content) {
        let (Some(source), Some(link)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let Some(emoji) = parse_linked_emoji(link.as_str(), source.as_str()) else {
            continue;
        };

        if sources.insert(emoji.source.clone()) {
            found.push(emoji);
        }
    }

    found
}

fn parse_linked_emoji(link: &str, source: &str) -> Option<ProbableEmoji> {
    let url = url::Url::parse(link).ok()?;

    let mut name = None;
    let mut animated = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "name" => name = Some(value.into_owned()),
            "animated" => animated = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    let id = url
        .path()
        .strip_prefix("/emojis/")?
        .split('.')
        .next()?
        .parse()
        .ok()?;

    Some(ProbableEmoji {
        id,
        name: name?,
        animated,
        source: source.to_string(),
    })
}

/// Clones created during one dispatch
#[derive(Debug, Default)]
pub struct EmojiGuard {
    clones: Vec<(Snowflake, Credential)>,
}

impl EmojiGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clones still to be released
    #[must_use]
    pub fn len(&self) -> usize {
        self.clones.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clones.is_empty()
    }

    fn record(&mut self, emoji_id: Snowflake, credential: Credential) {
        self.clones.push((emoji_id, credential));
    }

    /// Delete every recorded clone; each clone is deleted at most once
    pub async fn release_all(&mut self, api: &dyn DiscordApi) {
        if self.clones.is_empty() {
            return;
        }

        let clones = std::mem::take(&mut self.clones);
        tracing::debug!(count = clones.len(), "releasing cloned emoji");

        let results = join_all(
            clones
                .iter()
                .map(|(id, credential)| api.delete_application_emoji(credential.auth(), *id)),
        )
        .await;

        for ((id, _), result) in clones.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(emoji = %id, error = %e, "failed to delete cloned emoji");
            }
        }
    }
}

/// Clones unknown custom emoji so the acting identity can render them
pub struct EmojiManager {
    api: Arc<dyn DiscordApi>,
    repo: EmojiRepo,
    cdn_url: String,
    clone_limit: usize,
}

impl EmojiManager {
    #[must_use]
    pub fn new(
        api: Arc<dyn DiscordApi>,
        repo: EmojiRepo,
        cdn_url: impl Into<String>,
        clone_limit: usize,
    ) -> Self {
        Self {
            api,
            repo,
            cdn_url: cdn_url.into(),
            clone_limit,
        }
    }

    /// Rewrite `content` so every custom emoji renders for `credential`
    ///
    /// Emoji the bot already knows are left alone unless `force_clone` is set.
    /// If any clone fails, the ones already made are deleted and `content` is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the known-emoji store cannot be read, or if the platform
    /// rejects `credential` as unauthorized
    pub async fn ensure_renderable(
        &self,
        content: &str,
        credential: &Credential,
        force_clone: bool,
        guard: &mut EmojiGuard,
        trace: &mut DebugTrace,
    ) -> Result<String> {
        let used = find_emojis(content);
        if used.is_empty() {
            return Ok(content.to_string());
        }

        let known = if force_clone {
            vec![false; used.len()]
        } else {
            let ids: Vec<Snowflake> = used.iter().map(|e| e.id).collect();
            self.repo.known(&ids)?
        };

        let mut to_clone: Vec<&ProbableEmoji> = used
            .iter()
            .zip(known)
            .filter_map(|(emoji, known)| (!known).then_some(emoji))
            .collect();
        if to_clone.is_empty() {
            return Ok(content.to_string());
        }

        if to_clone.len() > self.clone_limit {
            trace.push(format!(
                "Max emoji clone limit ({}) reached.",
                self.clone_limit
            ));
            to_clone.truncate(self.clone_limit);
        }

        let results = join_all(to_clone.iter().map(|emoji| self.clone_one(emoji, credential))).await;

        let mut cloned = Vec::with_capacity(results.len());
        let mut failed = 0usize;
        let mut unauthorized = None;
        for (emoji, result) in to_clone.iter().zip(results) {
            match result {
                Ok(clone) => cloned.push((*emoji, clone)),
                Err(e) if e.is_unauthorized() => unauthorized = Some(e),
                Err(e) => {
                    tracing::warn!(emoji = %emoji.id, error = %e, "failed to clone emoji");
                    failed += 1;
                }
            }
        }

        let mut created = EmojiGuard::new();
        for (_, clone) in &cloned {
            created.record(clone.id, credential.clone());
        }

        if let Some(e) = unauthorized {
            created.release_all(self.api.as_ref()).await;
            return Err(e);
        }

        if failed > 0 {
            created.release_all(self.api.as_ref()).await;
            trace.push(format!("Failed to clone {failed} emoji."));
            return Ok(content.to_string());
        }
        guard.clones.append(&mut created.clones);

        let mut rewritten = content.to_string();
        for (emoji, clone) in &cloned {
            rewritten = rewritten.replace(&emoji.source, &emoji_token(clone));
        }
        Ok(rewritten)
    }

    async fn clone_one(&self, emoji: &ProbableEmoji, credential: &Credential) -> Result<Emoji> {
        let image = self
            .api
            .download(&format!("{}{}", self.cdn_url, emoji.image_path()))
            .await?;
        let mime = if emoji.animated { "gif" } else { "png" };
        let data_uri = format!("data:image/{mime};base64,{}", STANDARD.encode(image));

        let short: String = emoji.name.chars().take(CLONE_NAME_LEN).collect();
        let name = format!("{short}_{:03}", self.repo.next_index()?);

        self.api
            .create_application_emoji(credential.auth(), &name, &data_uri)
            .await
    }
}
