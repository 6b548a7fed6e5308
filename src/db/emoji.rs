//! Known-emoji shards and the clone name counter

use rusqlite::params;

use super::{DbPool, conn};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// Number of shards the known-emoji set is split into
pub const EMOJI_SHARDS: u64 = 10;

/// Shard key for an emoji id
#[must_use]
pub const fn shard_of(emoji_id: Snowflake) -> u64 {
    emoji_id.get() % EMOJI_SHARDS
}

/// Repository for emoji the bot can already render and the clone counter
#[derive(Clone)]
pub struct EmojiRepo {
    pool: DbPool,
}

impl EmojiRepo {
    /// Create a new emoji repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Membership of each id in its shard's known set, in input order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn known(&self, emoji_ids: &[Snowflake]) -> Result<Vec<bool>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT EXISTS(SELECT 1 FROM known_emojis WHERE shard = ?1 AND emoji_id = ?2)",
        )?;

        emoji_ids
            .iter()
            .map(|id| {
                stmt.query_row(
                    params![i64::try_from(shard_of(*id)).unwrap_or_default(), id.to_string()],
                    |row| row.get::<_, bool>(0),
                )
                .map_err(|e| Error::Database(e.to_string()))
            })
            .collect()
    }

    /// Add emoji to their shards' known sets
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_known(&self, emoji_ids: &[Snowflake]) -> Result<()> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;

        for id in emoji_ids {
            tx.execute(
                "INSERT OR IGNORE INTO known_emojis (shard, emoji_id) VALUES (?1, ?2)",
                params![i64::try_from(shard_of(*id)).unwrap_or_default(), id.to_string()],
            )?;
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove emoji from the known sets
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove_known(&self, emoji_ids: &[Snowflake]) -> Result<()> {
        let conn = conn(&self.pool)?;
        for id in emoji_ids {
            conn.execute(
                "DELETE FROM known_emojis WHERE emoji_id = ?1",
                [id.to_string()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        }
        Ok(())
    }

    /// Take the next clone index; rolls over at 1000
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn next_index(&self) -> Result<u16> {
        let conn = conn(&self.pool)?;
        let current: i64 = conn
            .query_row(
                "INSERT INTO counters (name, value) VALUES ('emoji_index', 1)
                 ON CONFLICT (name) DO UPDATE SET value = (value + 1) % 1000
                 RETURNING (value + 999) % 1000",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(u16::try_from(current).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn shard_membership() {
        let repo = EmojiRepo::new(init_memory().unwrap());
        repo.add_known(&[Snowflake(11), Snowflake(25)]).unwrap();

        assert_eq!(
            repo.known(&[Snowflake(11), Snowflake(12), Snowflake(25)])
                .unwrap(),
            vec![true, false, true]
        );

        repo.remove_known(&[Snowflake(11)]).unwrap();
        assert_eq!(repo.known(&[Snowflake(11)]).unwrap(), vec![false]);
    }

    #[test]
    fn index_counts_from_zero_and_wraps() {
        let repo = EmojiRepo::new(init_memory().unwrap());
        assert_eq!(repo.next_index().unwrap(), 0);
        assert_eq!(repo.next_index().unwrap(), 1);

        for _ in 2..1000 {
            repo.next_index().unwrap();
        }
        assert_eq!(repo.next_index().unwrap(), 0);
    }

    #[test]
    fn shard_key() {
        assert_eq!(shard_of(Snowflake(1_234_567)), 7);
    }
}
