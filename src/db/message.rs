//! Dispatch record repository

use rusqlite::{OptionalExtension, params};

use super::{DbPool, conn, now_millis, parse_snowflake};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// How long dispatch records are kept, in milliseconds
pub const MESSAGE_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// A successfully proxied message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRecord {
    /// Original message id; `None` when the proxy had no source message
    pub original_id: Option<Snowflake>,
    pub proxy_id: Snowflake,
    pub author_id: Snowflake,
    pub account_id: Option<String>,
    pub channel_id: Snowflake,
    pub member_id: String,
    pub reason: String,
    pub webhook_id: Option<Snowflake>,
    /// Dedicated bot that posted the proxy
    pub bot_id: Option<Snowflake>,
    pub reference_id: Option<Snowflake>,
}

/// Dispatch record repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new dispatch record repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a record with the standard TTL
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, record: &MessageRecord) -> Result<()> {
        let conn = conn(&self.pool)?;
        let now = now_millis();

        conn.execute(
            "INSERT OR REPLACE INTO messages (proxy_id, original_id, author_id, account_id,
                channel_id, member_id, reason, webhook_id, bot_id, reference_id,
                created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.proxy_id.to_string(),
                record.original_id.map(|id| id.to_string()),
                record.author_id.to_string(),
                record.account_id,
                record.channel_id.to_string(),
                record.member_id,
                record.reason,
                record.webhook_id.map(|id| id.to_string()),
                record.bot_id.map(|id| id.to_string()),
                record.reference_id.map(|id| id.to_string()),
                now,
                now + MESSAGE_TTL_MS,
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Look up the record for a proxied message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_proxy_id(&self, proxy_id: Snowflake) -> Result<Option<MessageRecord>> {
        self.find_where("proxy_id", proxy_id)
    }

    /// Look up the record created from an original message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_original_id(&self, original_id: Snowflake) -> Result<Option<MessageRecord>> {
        self.find_where("original_id", original_id)
    }

    /// Number of records created from an original message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_for_original(&self, original_id: Snowflake) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE original_id = ?1",
                [original_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn find_where(&self, column: &str, id: Snowflake) -> Result<Option<MessageRecord>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!(
                "SELECT proxy_id, original_id, author_id, account_id, channel_id, member_id,
                        reason, webhook_id, bot_id, reference_id
                 FROM messages WHERE {column} = ?1 AND expires_at > ?2"
            ),
            params![id.to_string(), now_millis()],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }
}

fn optional_snowflake(raw: Option<String>) -> rusqlite::Result<Option<Snowflake>> {
    raw.as_deref().map(parse_snowflake).transpose()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        proxy_id: parse_snowflake(&row.get::<_, String>(0)?)?,
        original_id: optional_snowflake(row.get(1)?)?,
        author_id: parse_snowflake(&row.get::<_, String>(2)?)?,
        account_id: row.get(3)?,
        channel_id: parse_snowflake(&row.get::<_, String>(4)?)?,
        member_id: row.get(5)?,
        reason: row.get(6)?,
        webhook_id: optional_snowflake(row.get(7)?)?,
        bot_id: optional_snowflake(row.get(8)?)?,
        reference_id: optional_snowflake(row.get(9)?)?,
    })
}
