//! Recency ledger: personas each user proxied with recently

use rusqlite::{OptionalExtension, params};

use super::{DbPool, conn, now_millis};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// Ledger lifetime, counted from the first entry
pub const LEDGER_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Recency ledger repository
#[derive(Clone)]
pub struct LedgerRepo {
    pool: DbPool,
}

impl LedgerRepo {
    /// Create a new ledger repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Bump a persona's score for a user
    ///
    /// The expiry is set once, when the user's ledger is created; later bumps
    /// keep it.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record(&self, user_id: Snowflake, member_id: &str) -> Result<()> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;
        let now = now_millis();
        let user = user_id.to_string();

        let existing_expiry: Option<i64> = tx
            .query_row(
                "SELECT MIN(expires_at) FROM recent_proxies WHERE user_id = ?1 AND expires_at > ?2",
                params![user, now],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();

        tx.execute(
            "DELETE FROM recent_proxies WHERE user_id = ?1 AND expires_at <= ?2",
            params![user, now],
        )?;

        let expires_at = existing_expiry.unwrap_or(now + LEDGER_TTL_MS);

        tx.execute(
            "INSERT INTO recent_proxies (user_id, member_id, score, expires_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (user_id, member_id) DO UPDATE SET score = score + 1",
            params![user, member_id, expires_at],
        )?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Persona ids for a user, highest score first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, user_id: Snowflake) -> Result<Vec<String>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT member_id FROM recent_proxies
             WHERE user_id = ?1 AND expires_at > ?2
             ORDER BY score DESC, member_id DESC",
        )?;

        let ids = stmt
            .query_map(params![user_id.to_string(), now_millis()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(ids)
    }
}
