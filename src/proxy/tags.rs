//! Proxy tag matching
//!
//! A tag matches when the whole text is `prefix` + body + `suffix`. Every
//! reference token (mention, emoji, timestamp, link) must survive into the
//! body, except a token that sits inside the prefix or suffix span and is part
//! of the tag's own literal text.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::{Regex, RegexBuilder};

use crate::db::{DebugTrace, ProxyTag};

/// Discord reference tokens that must not be swallowed by a tag
pub static MENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<(?:(?:[@#/][!&]?\d+)|(?:/(?:\w+ ?){1,3}:)\d+|(?:a?:[^:]+:\d+)|(?:t:\d+(?::[tTdDfFR])?)|(?:id:(?:customize|browse|guide|linked-roles))|(?:sound:\d+(?::\d+)?)|(?:https?://[^\s>]+))>",
    )
    .expect("valid mention pattern")
});

/// Compiled patterns kept across events
const PATTERN_CACHE_SIZE: usize = 1024;

/// Compiled pattern size ceiling for user-supplied regex tags
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// A successful tag match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    /// Index of the matching tag
    pub index: usize,
    /// Body with prefix and suffix removed
    pub content: String,
    /// Human-readable explanation
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    pattern: String,
    case_sensitive: bool,
}

/// Tag matcher with a per-evaluation time budget
pub struct TagMatcher {
    budget: Duration,
    patterns: Mutex<LruCache<PatternKey, Option<Regex>>>,
}

impl TagMatcher {
    /// Create a matcher; evaluations slower than `budget` count as no match
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        let size = NonZeroUsize::new(PATTERN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            budget,
            patterns: Mutex::new(LruCache::new(size)),
        }
    }

    /// First tag of `tags` that matches `text`
    ///
    /// An empty body only matches when the message has attachments.
    pub fn check_member(
        &self,
        tags: &[ProxyTag],
        text: &str,
        has_attachments: bool,
        trace: &mut DebugTrace,
    ) -> Option<TagMatch> {
        for (index, tag) in tags.iter().enumerate() {
            if tag.is_empty() {
                continue;
            }

            let Some(regex) = self.compile(tag) else {
                trace.push(format!(
                    "Invalid regex on proxy tag {}text{}.",
                    tag.prefix, tag.suffix
                ));
                continue;
            };

            let started = Instant::now();
            let captures = regex.captures(text);
            if started.elapsed() > self.budget {
                trace.push(format!(
                    "Regex timeout on proxy tag {}text{}.",
                    tag.prefix, tag.suffix
                ));
                continue;
            }

            let Some(captures) = captures else {
                continue;
            };
            let (Some(prefix), Some(body), Some(suffix)) =
                (captures.get(1), captures.get(2), captures.get(3))
            else {
                continue;
            };

            if body.as_str().is_empty() && !has_attachments {
                continue;
            }

            if !preserves_mentions(text, tag, prefix.range(), body.range(), suffix.range()) {
                trace.push(format!(
                    "Proxy tag {}text{} failed to preserve all mentions.",
                    tag.prefix, tag.suffix
                ));
                continue;
            }

            return Some(TagMatch {
                index,
                content: body.as_str().to_string(),
                reason: reason_for(tag),
            });
        }

        None
    }

    fn compile(&self, tag: &ProxyTag) -> Option<Regex> {
        let (prefix, suffix) = if tag.regex {
            (tag.prefix.clone(), tag.suffix.clone())
        } else {
            (regex::escape(&tag.prefix), regex::escape(&tag.suffix))
        };

        let key = PatternKey {
            pattern: format!(r"^({prefix})([\s\S]*)({suffix})$"),
            case_sensitive: tag.case_sensitive,
        };

        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = patterns.get(&key) {
            return hit.clone();
        }

        let compiled = RegexBuilder::new(&key.pattern)
            .case_insensitive(!tag.case_sensitive)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| tracing::debug!(pattern = %key.pattern, error = %e, "invalid tag pattern"))
            .ok();

        patterns.put(key, compiled.clone());
        compiled
    }
}

/// Every reference token lies in the body, or in a tag span whose literal text contains it
fn preserves_mentions(
    text: &str,
    tag: &ProxyTag,
    prefix: Range<usize>,
    body: Range<usize>,
    suffix: Range<usize>,
) -> bool {
    let within = |span: &Range<usize>, token: &Range<usize>| {
        span.start <= token.start && token.end <= span.end
    };

    MENTION_PATTERN.find_iter(text).all(|token| {
        let range = token.range();
        within(&body, &range)
            || (within(&prefix, &range) && tag.prefix.contains(token.as_str()))
            || (within(&suffix, &range) && tag.suffix.contains(token.as_str()))
    })
}

/// ``Matched proxy tag `prefix`\u{200b}`text`\u{200b}`suffix` ``
fn reason_for(tag: &ProxyTag) -> String {
    let mut reason = String::from("Matched proxy tag ");
    if !tag.prefix.is_empty() {
        reason.push_str(&format!("`{}`", tag.prefix));
    }
    reason.push_str("\u{200b}`text`\u{200b}");
    if !tag.suffix.is_empty() {
        reason.push_str(&format!("`{}`", tag.suffix));
    }
    reason
}
