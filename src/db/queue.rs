//! Durable event stream with consumer groups
//!
//! Entries are appended to a named stream. Each consumer group tracks the last
//! entry it handed out and a pending list of delivered but unacknowledged
//! entries, which idle consumers can claim.

use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior, params};

use super::{DbPool, conn, now_millis};
use crate::{Error, Result};

/// Poll interval while blocking on an empty stream
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One delivered stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: String,
    /// How many times this entry has been handed out
    pub deliveries: u32,
}

/// Stream store shared by publishers and consumer groups
#[derive(Clone)]
pub struct EventQueue {
    pool: DbPool,
}

impl EventQueue {
    /// Create a new queue handle
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a consumer group if it does not exist
    ///
    /// A new group starts at the current end of the stream.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO stream_groups (stream, group_name, last_delivered)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(id), 0) FROM event_stream WHERE stream = ?1))",
                params![stream, group],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if created == 1 {
            tracing::info!(stream, group, "created consumer group");
        }
        Ok(created == 1)
    }

    /// Append an entry, returning its id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn publish(&self, stream: &str, payload: &str) -> Result<i64> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO event_stream (stream, payload, created_at) VALUES (?1, ?2, ?3)",
            params![stream, payload, now_millis()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Hand out up to `count` new entries to `consumer`, without waiting
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<i64> = tx
            .query_row(
                "SELECT last_delivered FROM stream_groups WHERE stream = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .optional()?;
        let Some(last) = last else {
            return Err(Error::NotFound(format!("consumer group {group} on {stream}")));
        };

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT id, payload FROM event_stream WHERE stream = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            stmt.query_map(
                params![stream, last, i64::try_from(count).unwrap_or(i64::MAX)],
                |row| {
                    Ok(QueueEntry {
                        id: row.get(0)?,
                        payload: row.get(1)?,
                        deliveries: 1,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        if let Some(newest) = entries.last() {
            let now = now_millis();
            tx.execute(
                "UPDATE stream_groups SET last_delivered = ?3 WHERE stream = ?1 AND group_name = ?2",
                params![stream, group, newest.id],
            )?;
            for entry in &entries {
                tx.execute(
                    "INSERT OR REPLACE INTO stream_pending
                     (stream, group_name, entry_id, consumer, delivered_at, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![stream, group, entry.id, consumer, now],
                )?;
            }
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(entries)
    }

    /// Read new entries, polling until one arrives or `block` elapses
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            let entries = self.read_new(stream, group, consumer, count)?;
            if !entries.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(entries);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Acknowledge an entry, removing it from the group's pending list
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn ack(&self, stream: &str, group: &str, entry_id: i64) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let removed = conn
            .execute(
                "DELETE FROM stream_pending WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
                params![stream, group, entry_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(removed == 1)
    }

    /// Transfer pending entries idle for at least `min_idle` to `consumer`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let cutoff = now - i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT p.entry_id, e.payload, p.delivery_count + 1
                 FROM stream_pending p
                 JOIN event_stream e ON e.id = p.entry_id
                 WHERE p.stream = ?1 AND p.group_name = ?2 AND p.delivered_at <= ?3
                 ORDER BY p.entry_id",
            )?;
            stmt.query_map(params![stream, group, cutoff], |row| {
                Ok(QueueEntry {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    deliveries: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for entry in &entries {
            tx.execute(
                "UPDATE stream_pending
                 SET consumer = ?4, delivered_at = ?5, delivery_count = delivery_count + 1
                 WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
                params![stream, group, entry.id, consumer, now],
            )?;
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        if !entries.is_empty() {
            tracing::info!(stream, group, count = entries.len(), "claimed idle entries");
        }
        Ok(entries)
    }

    /// Number of delivered but unacknowledged entries for a group
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM stream_pending WHERE stream = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Drop acknowledged entries older than `max_age` that no group still holds
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn trim(&self, stream: &str, max_age: Duration) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let cutoff = now_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        conn.execute(
            "DELETE FROM event_stream
             WHERE stream = ?1 AND created_at <= ?2
               AND id <= (SELECT COALESCE(MIN(last_delivered), 0) FROM stream_groups WHERE stream = ?1)
               AND id NOT IN (SELECT entry_id FROM stream_pending WHERE stream = ?1)",
            params![stream, cutoff],
        )
        .map_err(|e| Error::Database(e.to_string()))
    }
}
