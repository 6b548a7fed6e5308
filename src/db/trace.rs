//! Debug traces and the proxy audit log

use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

use super::{DbPool, conn, now_millis};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// How long debug traces are kept
pub const TRACE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Ordered, human-readable explanation of how one event was handled
#[derive(Debug, Clone, Default)]
pub struct DebugTrace {
    entries: Vec<String>,
}

impl DebugTrace {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry
    pub fn push(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        tracing::trace!(entry = %entry, "debug trace");
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry starts with `prefix`
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.entries.iter().any(|e| e.starts_with(prefix))
    }

    /// Whether any entry contains `needle`
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.contains(needle))
    }
}

/// Debug trace repository
#[derive(Clone)]
pub struct TraceRepo {
    pool: DbPool,
}

impl TraceRepo {
    /// Create a new trace repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a trace under every given message id
    ///
    /// The author id is stored as the first entry.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn save(
        &self,
        author_id: Snowflake,
        message_ids: &[Snowflake],
        trace: &DebugTrace,
    ) -> Result<()> {
        if trace.is_empty() || message_ids.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(trace.entries().len() + 1);
        entries.push(author_id.to_string());
        entries.extend(trace.entries().iter().cloned());
        let dump = serde_json::to_string(&entries)?;

        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;
        let expires_at = now_millis() + TRACE_TTL_MS;

        for id in message_ids {
            tx.execute(
                "INSERT OR REPLACE INTO proxy_debug (message_id, entries, expires_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), dump, expires_at],
            )?;
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Load a trace; the first entry is the author id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, message_id: Snowflake) -> Result<Option<Vec<String>>> {
        let conn = conn(&self.pool)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT entries FROM proxy_debug WHERE message_id = ?1 AND expires_at > ?2",
                params![message_id.to_string(), now_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }
}

/// Audit entry for a proxy attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLog {
    pub author_id: Snowflake,
    pub author_name: String,
    pub message_id: Snowflake,
    pub channel_id: Snowflake,
    /// Hex SHA-256 of the original content
    pub content_hash: String,
}

impl ProxyLog {
    /// Build an entry, hashing the content
    #[must_use]
    pub fn new(
        author_id: Snowflake,
        author_name: &str,
        message_id: Snowflake,
        channel_id: Snowflake,
        content: &str,
    ) -> Self {
        Self {
            author_id,
            author_name: author_name.to_string(),
            message_id,
            channel_id,
            content_hash: hex::encode(Sha256::digest(content.as_bytes())),
        }
    }
}

/// Proxy audit log repository
#[derive(Clone)]
pub struct ProxyLogRepo {
    pool: DbPool,
}

impl ProxyLogRepo {
    /// Create a new audit log repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an entry
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, log: &ProxyLog) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO proxy_log (author_id, author_name, message_id, channel_id, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.author_id.to_string(),
                log.author_name,
                log.message_id.to_string(),
                log.channel_id.to_string(),
                log.content_hash,
                now_millis(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Entries for an original message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn for_message(&self, message_id: Snowflake) -> Result<Vec<ProxyLog>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT author_id, author_name, message_id, channel_id, content_hash
             FROM proxy_log WHERE message_id = ?1 ORDER BY id",
        )?;

        let logs = stmt
            .query_map([message_id.to_string()], |row| {
                Ok(ProxyLog {
                    author_id: super::parse_snowflake(&row.get::<_, String>(0)?)?,
                    author_name: row.get(1)?,
                    message_id: super::parse_snowflake(&row.get::<_, String>(2)?)?,
                    channel_id: super::parse_snowflake(&row.get::<_, String>(3)?)?,
                    content_hash: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn trace_saved_under_every_id() {
        let repo = TraceRepo::new(init_memory().unwrap());
        let mut trace = DebugTrace::new();
        trace.push("No autoproxy found");
        trace.push("Successfully proxied message.");

        repo.save(Snowflake(9), &[Snowflake(1), Snowflake(2)], &trace)
            .unwrap();

        let first = repo.find(Snowflake(1)).unwrap().unwrap();
        assert_eq!(first[0], "9");
        assert_eq!(first[1], "No autoproxy found");
        assert_eq!(repo.find(Snowflake(2)).unwrap(), Some(first));
        assert!(repo.find(Snowflake(3)).unwrap().is_none());
    }

    #[test]
    fn empty_trace_not_saved() {
        let repo = TraceRepo::new(init_memory().unwrap());
        repo.save(Snowflake(9), &[Snowflake(1)], &DebugTrace::new())
            .unwrap();
        assert!(repo.find(Snowflake(1)).unwrap().is_none());
    }

    #[test]
    fn proxy_log_hashes_content() {
        let repo = ProxyLogRepo::new(init_memory().unwrap());
        let log = ProxyLog::new(Snowflake(1), "alice", Snowflake(2), Snowflake(3), "hello");
        assert_eq!(
            log.content_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        repo.insert(&log).unwrap();
        assert_eq!(repo.for_message(Snowflake(2)).unwrap(), vec![log]);
    }
}
