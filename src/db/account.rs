//! Account (usergroup) repository

use std::str::FromStr;

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::{DbPool, conn};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// How replies to other messages are rendered on webhook proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFormat {
    /// A `-#` quote line above the content
    #[default]
    Inline,
    /// An embed after the content
    Embed,
    /// No reply context
    None,
}

impl ReplyFormat {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Embed => "embed",
            Self::None => "none",
        }
    }
}

impl FromStr for ReplyFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(Self::Inline),
            "embed" => Ok(Self::Embed),
            "none" => Ok(Self::None),
            other => Err(Error::Invalid(format!("unknown reply format: {other}"))),
        }
    }
}

/// Per-account settings that affect how proxies are rendered
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub reply_format: ReplyFormat,
    /// Ping the author of the replied-to message
    pub ping_replies: bool,
    /// Format for group tags, `{tag}` is replaced
    pub tag_format: String,
    /// Format for pronouns, `{pronouns}` is replaced
    pub pronoun_format: String,
    /// Order of display name components: 0 name, 1 tag, 2 pronouns
    pub display_name_order: Vec<u8>,
    pub include_tag: bool,
    pub include_pronouns: bool,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            reply_format: ReplyFormat::Inline,
            ping_replies: false,
            tag_format: "{tag}".to_string(),
            pronoun_format: "({pronouns})".to_string(),
            display_name_order: vec![0, 1, 2],
            include_tag: true,
            include_pronouns: false,
        }
    }
}

/// An account linking one or more Discord users
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub config: AccountConfig,
}

/// Account repository
#[derive(Clone)]
pub struct AccountRepo {
    pool: DbPool,
}

impl AccountRepo {
    /// Create a new account repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create an account linked to the given users
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, config: AccountConfig, users: &[Snowflake]) -> Result<Account> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;
        let id = Uuid::new_v4().to_string();

        tx.execute(
            "INSERT INTO accounts (id, reply_format, ping_replies, tag_format, pronoun_format,
                display_name_order, include_tag, include_pronouns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                config.reply_format.as_str(),
                config.ping_replies,
                config.tag_format,
                config.pronoun_format,
                serde_json::to_string(&config.display_name_order)?,
                config.include_tag,
                config.include_pronouns,
            ],
        )?;

        for user in users {
            tx.execute(
                "INSERT OR REPLACE INTO account_users (user_id, account_id) VALUES (?1, ?2)",
                params![user.to_string(), id],
            )?;
        }

        tx.commit()?;
        Ok(Account { id, config })
    }

    /// Find the account a Discord user is registered under
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_user(&self, user_id: Snowflake) -> Result<Option<Account>> {
        let conn = conn(&self.pool)?;

        let row = conn
            .query_row(
                "SELECT a.id, a.reply_format, a.ping_replies, a.tag_format, a.pronoun_format,
                        a.display_name_order, a.include_tag, a.include_pronouns
                 FROM accounts a JOIN account_users u ON u.account_id = a.id
                 WHERE u.user_id = ?1",
                [user_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let Some((id, reply_format, ping_replies, tag_format, pronoun_format, order, include_tag, include_pronouns)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(Account {
            id,
            config: AccountConfig {
                reply_format: reply_format.parse().unwrap_or_default(),
                ping_replies,
                tag_format,
                pronoun_format,
                display_name_order: serde_json::from_str(&order).unwrap_or_else(|_| vec![0, 1, 2]),
                include_tag,
                include_pronouns,
            },
        }))
    }

    /// Link another Discord user to an existing account
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn link_user(&self, account_id: &str, user_id: Snowflake) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO account_users (user_id, account_id) VALUES (?1, ?2)",
            params![user_id.to_string(), account_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
