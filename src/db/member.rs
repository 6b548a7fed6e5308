//! Persona (member) repository

use std::collections::HashSet;
use std::fmt;

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, conn};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// Maximum proxy tags per persona
pub const MAX_PROXY_TAGS: usize = 15;

/// Text markers that select a persona
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTag {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Prefix and suffix are regular expressions rather than literals
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Avatar override used when this tag matches
    #[serde(default)]
    pub avatar: Option<String>,
}

impl ProxyTag {
    /// Literal prefix/suffix tag
    #[must_use]
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            ..Self::default()
        }
    }

    /// Tags with neither prefix nor suffix never match
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }
}

/// Dedicated bot identity bound to a persona
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Userproxy {
    pub bot_id: Snowflake,
    pub token: String,
    #[serde(default)]
    pub public_key: String,
    /// Guilds the bot has been added to
    #[serde(default)]
    pub guilds: HashSet<Snowflake>,
}

impl fmt::Debug for Userproxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Userproxy")
            .field("bot_id", &self.bot_id)
            .field("token", &"[REDACTED]")
            .field("guilds", &self.guilds)
            .finish_non_exhaustive()
    }
}

/// A persona
#[derive(Debug, Clone, Default)]
pub struct Member {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub pronouns: Option<String>,
    pub avatar: Option<String>,
    /// Embed colour
    pub color: Option<u32>,
    pub proxy_tags: Vec<ProxyTag>,
    pub userproxy: Option<Userproxy>,
}

impl Member {
    /// Whether the persona's dedicated bot may act in a guild
    #[must_use]
    pub fn userproxy_in(&self, guild_id: Snowflake) -> Option<&Userproxy> {
        self.userproxy
            .as_ref()
            .filter(|userproxy| userproxy.guilds.contains(&guild_id))
    }
}

/// Data for a new persona
#[derive(Debug, Clone, Default)]
pub struct NewMember {
    pub name: String,
    pub pronouns: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<u32>,
    pub proxy_tags: Vec<ProxyTag>,
    pub userproxy: Option<Userproxy>,
}

/// Persona repository
#[derive(Clone)]
pub struct MemberRepo {
    pool: DbPool,
}

impl MemberRepo {
    /// Create a new persona repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a persona inside a group
    ///
    /// # Errors
    ///
    /// Returns error if the tags are invalid or the database operation fails
    pub fn create(&self, group_id: &str, new: NewMember) -> Result<Member> {
        validate_tags(&new.proxy_tags)?;

        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO members (id, group_id, name, pronouns, avatar, color, proxy_tags, userproxy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                group_id,
                new.name,
                new.pronouns,
                new.avatar,
                new.color,
                serde_json::to_string(&new.proxy_tags)?,
                new.userproxy.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Member {
            id,
            group_id: group_id.to_string(),
            name: new.name,
            pronouns: new.pronouns,
            avatar: new.avatar,
            color: new.color,
            proxy_tags: new.proxy_tags,
            userproxy: new.userproxy,
        })
    }

    /// Find a persona by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Member>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM members WHERE id = ?1"),
            [id],
            row_to_member,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Load several personas, preserving the order of `ids` and skipping unknown ones
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_many(&self, ids: &[String]) -> Result<Vec<Member>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM members WHERE id = ?1"))?;

        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(member) = stmt
                .query_row([id], row_to_member)
                .optional()
                .map_err(|e| Error::Database(e.to_string()))?
            {
                members.push(member);
            }
        }

        Ok(members)
    }

    /// Personas in a group, in creation order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_by_group(&self, group_id: &str) -> Result<Vec<Member>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM members WHERE group_id = ?1 ORDER BY created_at, rowid"
        ))?;

        let members = stmt
            .query_map([group_id], row_to_member)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(members)
    }

    /// Find the persona whose dedicated bot has the given id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_userproxy_bot(&self, bot_id: Snowflake) -> Result<Option<Member>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM members
                 WHERE userproxy IS NOT NULL AND json_extract(userproxy, '$.bot_id') = ?1"
            ),
            [bot_id.to_string()],
            row_to_member,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Remove a guild from a persona's dedicated bot
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove_userproxy_guild(&self, member_id: &str, guild_id: Snowflake) -> Result<()> {
        let Some(mut member) = self.find(member_id)? else {
            return Ok(());
        };
        let Some(userproxy) = member.userproxy.as_mut() else {
            return Ok(());
        };

        userproxy.guilds.remove(&guild_id);

        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE members SET userproxy = ?1 WHERE id = ?2",
            params![serde_json::to_string(userproxy)?, member_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

const COLUMNS: &str = "id, group_id, name, pronouns, avatar, color, proxy_tags, userproxy";

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    let tags: String = row.get(6)?;
    let userproxy: Option<String> = row.get(7)?;

    Ok(Member {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        pronouns: row.get(3)?,
        avatar: row.get(4)?,
        color: row.get(5)?,
        proxy_tags: serde_json::from_str(&tags).unwrap_or_default(),
        userproxy: userproxy.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

fn validate_tags(tags: &[ProxyTag]) -> Result<()> {
    if tags.len() > MAX_PROXY_TAGS {
        return Err(Error::Invalid(format!(
            "a persona may have at most {MAX_PROXY_TAGS} proxy tags"
        )));
    }

    if tags.iter().any(ProxyTag::is_empty) {
        return Err(Error::Invalid(
            "proxy tags need a prefix or a suffix".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccountConfig, AccountRepo, GroupRepo, init_memory};

    fn setup() -> (MemberRepo, String) {
        let pool = init_memory().unwrap();
        let account = AccountRepo::new(pool.clone())
            .create(AccountConfig::default(), &[Snowflake(1)])
            .unwrap();
        let group = GroupRepo::new(pool.clone())
            .create(&account.id, "main", None, &[])
            .unwrap();
        (MemberRepo::new(pool), group.id)
    }

    #[test]
    fn create_and_find() {
        let (repo, group_id) = setup();
        let created = repo
            .create(
                &group_id,
                NewMember {
                    name: "Sam".into(),
                    proxy_tags: vec![ProxyTag::new("s;", "")],
                    ..NewMember::default()
                },
            )
            .unwrap();

        let found = repo.find(&created.id).unwrap().unwrap();
        assert_eq!(found.name, "Sam");
        assert_eq!(found.proxy_tags, vec![ProxyTag::new("s;", "")]);
        assert!(found.userproxy.is_none());
    }

    #[test]
    fn rejects_empty_tag() {
        let (repo, group_id) = setup();
        let result = repo.create(
            &group_id,
            NewMember {
                name: "Empty".into(),
                proxy_tags: vec![ProxyTag::new("", "")],
                ..NewMember::default()
            },
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn rejects_too_many_tags() {
        let (repo, group_id) = setup();
        let tags = (0..=MAX_PROXY_TAGS)
            .map(|i| ProxyTag::new(&format!("{i};"), ""))
            .collect();
        let result = repo.create(
            &group_id,
            NewMember {
                name: "Many".into(),
                proxy_tags: tags,
                ..NewMember::default()
            },
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn userproxy_lookup_and_guild_removal() {
        let (repo, group_id) = setup();
        let member = repo
            .create(
                &group_id,
                NewMember {
                    name: "Bot".into(),
                    userproxy: Some(Userproxy {
                        bot_id: Snowflake(777),
                        token: "secret".into(),
                        public_key: String::new(),
                        guilds: HashSet::from([Snowflake(50), Snowflake(51)]),
                    }),
                    ..NewMember::default()
                },
            )
            .unwrap();

        let found = repo.find_by_userproxy_bot(Snowflake(777)).unwrap().unwrap();
        assert_eq!(found.id, member.id);
        assert!(found.userproxy_in(Snowflake(50)).is_some());

        repo.remove_userproxy_guild(&member.id, Snowflake(50)).unwrap();
        let found = repo.find(&member.id).unwrap().unwrap();
        assert!(found.userproxy_in(Snowflake(50)).is_none());
        assert!(found.userproxy_in(Snowflake(51)).is_some());
    }

    #[test]
    fn find_many_preserves_order() {
        let (repo, group_id) = setup();
        let a = repo
            .create(&group_id, NewMember { name: "A".into(), ..NewMember::default() })
            .unwrap();
        let b = repo
            .create(&group_id, NewMember { name: "B".into(), ..NewMember::default() })
            .unwrap();

        let found = repo
            .find_many(&[b.id.clone(), "missing".into(), a.id.clone()])
            .unwrap();
        let names: Vec<_> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
