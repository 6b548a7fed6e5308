//! Group repository

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::{DbPool, conn};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// A group of personas
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub id: String,
    pub account_id: String,
    pub name: String,
    /// Tag appended to persona display names
    pub tag: Option<String>,
    pub avatar: Option<String>,
    /// Channel allow-list; empty admits every channel
    pub channels: HashSet<Snowflake>,
    /// Persona ids in this group
    pub members: HashSet<String>,
}

impl Group {
    /// Whether the allow-list admits a channel or any of its parents
    #[must_use]
    pub fn admits(&self, channel_stack: &HashSet<Snowflake>) -> bool {
        self.channels.is_empty() || !self.channels.is_disjoint(channel_stack)
    }

    /// Whether the group carries a channel allow-list
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.channels.is_empty()
    }
}

/// Group repository
#[derive(Clone)]
pub struct GroupRepo {
    pool: DbPool,
}

impl GroupRepo {
    /// Create a new group repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a group owned by an account
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(
        &self,
        account_id: &str,
        name: &str,
        tag: Option<&str>,
        channels: &[Snowflake],
    ) -> Result<Group> {
        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();
        let channel_ids: Vec<String> = channels.iter().map(ToString::to_string).collect();

        conn.execute(
            "INSERT INTO groups (id, account_id, name, tag, channels) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, account_id, name, tag, serde_json::to_string(&channel_ids)?],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Group {
            id,
            account_id: account_id.to_string(),
            name: name.to_string(),
            tag: tag.map(String::from),
            avatar: None,
            channels: channels.iter().copied().collect(),
            members: HashSet::new(),
        })
    }

    /// Set a group's avatar key
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_avatar(&self, group_id: &str, avatar: Option<&str>) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE groups SET avatar = ?1 WHERE id = ?2",
            params![avatar, group_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Share a group with another Discord user
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn share(&self, group_id: &str, user_id: Snowflake) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR IGNORE INTO group_shares (group_id, user_id) VALUES (?1, ?2)",
            params![group_id, user_id.to_string()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Every group an author may proxy with: owned by the account or shared with the user
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn visible_to(&self, account_id: &str, user_id: Snowflake) -> Result<Vec<Group>> {
        let conn = conn(&self.pool)?;

        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, tag, avatar, channels FROM groups
             WHERE account_id = ?1
                OR id IN (SELECT group_id FROM group_shares WHERE user_id = ?2)
             ORDER BY created_at, rowid",
        )?;

        let mut groups = stmt
            .query_map(params![account_id, user_id.to_string()], row_to_group)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        for group in &mut groups {
            group.members = member_ids(&conn, &group.id)?;
        }

        Ok(groups)
    }

    /// Find a group by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Group>> {
        let conn = conn(&self.pool)?;

        let group = conn
            .query_row(
                "SELECT id, account_id, name, tag, avatar, channels FROM groups WHERE id = ?1",
                [id],
                row_to_group,
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        match group {
            Some(mut group) => {
                group.members = member_ids(&conn, &group.id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }
}

fn member_ids(conn: &Connection, group_id: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM members WHERE group_id = ?1")?;
    let ids = stmt
        .query_map([group_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()
        .map_err(|e| Error::Database(e.to_string()))?;
    Ok(ids)
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let channels: String = row.get(5)?;
    let channels: Vec<String> = serde_json::from_str(&channels).unwrap_or_default();

    Ok(Group {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        tag: row.get(3)?,
        avatar: row.get(4)?,
        channels: channels.iter().filter_map(|c| c.parse().ok()).collect(),
        members: HashSet::new(),
    })
}
