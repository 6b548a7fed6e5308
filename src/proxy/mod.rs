//! Persona resolution: which persona speaks and what it says

pub mod resolver;
pub mod tags;

pub use resolver::Resolver;
pub use tags::{MENTION_PATTERN, TagMatch, TagMatcher};

use crate::db::{Account, Autoproxy, Group, Member, ProxyTag};

/// Display names longer than this are cut
pub const MAX_DISPLAY_NAME_LEN: usize = 80;

/// Last-poster marker used when no tag matched
const NO_TAG_MARKER: &str = "99";

/// Outcome of resolution
#[derive(Debug, Clone)]
pub struct ResolvedProxy {
    pub account: Account,
    pub member: Member,
    pub group: Group,
    /// Text to post
    pub content: String,
    /// Why this persona was chosen
    pub reason: String,
    /// Index of the matched proxy tag
    pub tag_index: Option<usize>,
    /// Autoproxy record in effect
    pub autoproxy: Option<Autoproxy>,
}

impl ResolvedProxy {
    /// The matched proxy tag
    #[must_use]
    pub fn tag(&self) -> Option<&ProxyTag> {
        self.tag_index
            .and_then(|index| self.member.proxy_tags.get(index))
    }

    /// Avatar reference: tag, then persona, then group
    #[must_use]
    pub fn avatar(&self) -> Option<&str> {
        self.tag()
            .and_then(|tag| tag.avatar.as_deref())
            .or(self.member.avatar.as_deref())
            .or(self.group.avatar.as_deref())
    }

    /// Whether the avatar comes from the matched tag
    #[must_use]
    pub fn has_tag_avatar(&self) -> bool {
        self.tag().is_some_and(|tag| tag.avatar.is_some())
    }

    /// Persona id plus tag index, compared against a channel's last poster
    #[must_use]
    pub fn last_member_string(&self) -> String {
        match self.tag_index {
            Some(index) => format!("{}{index}", self.member.id),
            None => format!("{}{NO_TAG_MARKER}", self.member.id),
        }
    }

    /// Name shown on the reposted message
    ///
    /// Components are name, formatted group tag and formatted pronouns, joined
    /// in the account's configured order.
    #[must_use]
    pub fn display_name(&self) -> String {
        let config = &self.account.config;

        let tag = match self.group.tag.as_deref() {
            Some(tag) if !tag.is_empty() && config.include_tag => {
                config.tag_format.replace("{tag}", tag)
            }
            _ => String::new(),
        };
        let pronouns = match self.member.pronouns.as_deref() {
            Some(pronouns) if !pronouns.is_empty() && config.include_pronouns => {
                config.pronoun_format.replace("{pronouns}", pronouns)
            }
            _ => String::new(),
        };
        let components = [self.member.name.as_str(), tag.as_str(), pronouns.as_str()];

        let joined = config
            .display_name_order
            .iter()
            .filter_map(|index| components.get(usize::from(*index)))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(MAX_DISPLAY_NAME_LEN).collect()
    }

    /// Avatar as a URL, filling `template` for stored image keys
    #[must_use]
    pub fn avatar_url(&self, template: &str) -> Option<String> {
        self.avatar().map(|avatar| {
            if avatar.starts_with("http://") || avatar.starts_with("https://") {
                avatar.to_string()
            } else {
                template.replace("{key}", avatar)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccountConfig;

    fn resolved() -> ResolvedProxy {
        ResolvedProxy {
            account: Account {
                id: "acc".into(),
                config: AccountConfig::default(),
            },
            member: Member {
                id: "m1".into(),
                name: "Sam".into(),
                pronouns: Some("they/them".into()),
                avatar: Some("member.png".into()),
                proxy_tags: vec![
                    ProxyTag::new("s;", ""),
                    ProxyTag {
                        avatar: Some("https://cdn.example/tag.png".into()),
                        ..ProxyTag::new("t;", "")
                    },
                ],
                ..Member::default()
            },
            group: Group {
                tag: Some("| Crew".into()),
                avatar: Some("group.png".into()),
                ..Group::default()
            },
            content: "hi".into(),
            reason: "test".into(),
            tag_index: None,
            autoproxy: None,
        }
    }

    #[test]
    fn display_name_components() {
        let mut proxy = resolved();
        assert_eq!(proxy.display_name(), "Sam | Crew");

        proxy.account.config.include_pronouns = true;
        assert_eq!(proxy.display_name(), "Sam | Crew (they/them)");

        proxy.account.config.display_name_order = vec![2, 0];
        assert_eq!(proxy.display_name(), "(they/them) Sam");

        proxy.account.config.include_tag = false;
        proxy.account.config.display_name_order = vec![0, 1, 2];
        proxy.member.pronouns = None;
        assert_eq!(proxy.display_name(), "Sam");
    }

    #[test]
    fn display_name_truncated() {
        let mut proxy = resolved();
        proxy.member.name = "x".repeat(100);
        assert_eq!(proxy.display_name().chars().count(), MAX_DISPLAY_NAME_LEN);
    }

    #[test]
    fn avatar_precedence() {
        let mut proxy = resolved();
        assert_eq!(proxy.avatar(), Some("member.png"));

        proxy.tag_index = Some(1);
        assert!(proxy.has_tag_avatar());
        assert_eq!(
            proxy.avatar_url("https://img/{key}").as_deref(),
            Some("https://cdn.example/tag.png")
        );

        proxy.tag_index = None;
        proxy.member.avatar = None;
        assert_eq!(
            proxy.avatar_url("https://img/{key}").as_deref(),
            Some("https://img/group.png")
        );
    }

    #[test]
    fn last_member_marker() {
        let mut proxy = resolved();
        assert_eq!(proxy.last_member_string(), "m199");
        proxy.tag_index = Some(0);
        assert_eq!(proxy.last_member_string(), "m10");
    }
}
