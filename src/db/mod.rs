//! Database module for persona configuration and dispatch bookkeeping

pub mod account;
pub mod autoproxy;
pub mod emoji;
pub mod group;
pub mod ledger;
pub mod member;
pub mod message;
pub mod pending;
pub mod queue;
mod schema;
pub mod trace;

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::discord::Snowflake;
use crate::{Error, Result};

pub use account::{Account, AccountConfig, AccountRepo, ReplyFormat};
pub use autoproxy::{Autoproxy, AutoproxyMode, AutoproxyRepo};
pub use emoji::EmojiRepo;
pub use group::{Group, GroupRepo};
pub use ledger::LedgerRepo;
pub use member::{Member, MemberRepo, ProxyTag, Userproxy};
pub use message::{MessageRecord, MessageRepo};
pub use pending::PendingRepo;
pub use queue::{EventQueue, QueueEntry};
pub use schema::SCHEMA_VERSION;
pub use trace::{DebugTrace, ProxyLog, ProxyLogRepo, TraceRepo};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
    });
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Get a connection from the pool
pub(crate) fn conn(pool: &DbPool) -> Result<DbConn> {
    pool.get().map_err(|e| Error::Database(e.to_string()))
}

/// Current time as unix milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse a snowflake stored as TEXT
pub(crate) fn parse_snowflake(raw: &str) -> rusqlite::Result<Snowflake> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Delete rows whose TTL has passed across every table that carries one
///
/// # Errors
///
/// Returns error if database operation fails
pub fn purge_expired(pool: &DbPool) -> Result<usize> {
    let conn = conn(pool)?;
    let now = now_millis();
    let mut removed = 0;

    for table in [
        "messages",
        "recent_proxies",
        "pending_dispatch",
        "entity_cache",
        "proxy_debug",
        "autoproxies",
    ] {
        removed += conn
            .execute(
                &format!("DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= ?1"),
                [now],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
    }

    Ok(removed)
}
