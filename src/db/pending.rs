//! Pending-dispatch markers
//!
//! A marker exists while an original message is being proxied. Setting it is
//! atomic: only the first caller for a `(channel, message)` pair acquires it.

use std::time::Duration;

use rusqlite::{TransactionBehavior, params};

use super::{DbPool, conn, now_millis};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// Marker lifetime
pub const PENDING_TTL: Duration = Duration::from_secs(30);

/// Pending-dispatch marker repository
#[derive(Clone)]
pub struct PendingRepo {
    pool: DbPool,
}

impl PendingRepo {
    /// Create a new marker repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Try to set the marker; returns `true` if this caller acquired it
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn try_mark(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<bool> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let (channel, message) = (channel_id.to_string(), message_id.to_string());

        tx.execute(
            "DELETE FROM pending_dispatch WHERE channel_id = ?1 AND message_id = ?2 AND expires_at <= ?3",
            params![channel, message, now],
        )?;

        let ttl = i64::try_from(PENDING_TTL.as_millis()).unwrap_or(30_000);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO pending_dispatch (channel_id, message_id, expires_at)
             VALUES (?1, ?2, ?3)",
            params![channel, message, now + ttl],
        )?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(inserted == 1)
    }

    /// Whether an unexpired marker exists
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn exists(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_dispatch
                 WHERE channel_id = ?1 AND message_id = ?2 AND expires_at > ?3",
                params![channel_id.to_string(), message_id.to_string(), now_millis()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count > 0)
    }
}
