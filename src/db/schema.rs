//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Accounts, groups, personas and autoproxy state
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            reply_format TEXT NOT NULL DEFAULT 'inline',
            ping_replies INTEGER NOT NULL DEFAULT 0,
            tag_format TEXT NOT NULL DEFAULT '{tag}',
            pronoun_format TEXT NOT NULL DEFAULT '({pronouns})',
            display_name_order TEXT NOT NULL DEFAULT '[0,1,2]',
            include_tag INTEGER NOT NULL DEFAULT 1,
            include_pronouns INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS account_users (
            user_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_account_users_account ON account_users(account_id);

        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            tag TEXT,
            avatar TEXT,
            channels TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_groups_account ON groups(account_id);

        CREATE TABLE IF NOT EXISTS group_shares (
            group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_shares_user ON group_shares(user_id);

        CREATE TABLE IF NOT EXISTS members (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            pronouns TEXT,
            avatar TEXT,
            color INTEGER,
            proxy_tags TEXT NOT NULL DEFAULT '[]',
            userproxy TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_members_group ON members(group_id);

        -- guild_id is '' for the global record
        CREATE TABLE IF NOT EXISTS autoproxies (
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            guild_id TEXT NOT NULL DEFAULT '',
            mode TEXT NOT NULL,
            member_id TEXT,
            expires_at INTEGER,
            PRIMARY KEY (account_id, guild_id)
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

/// Dispatch bookkeeping: records, ledger, markers, cache, traces
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS messages (
            proxy_id TEXT PRIMARY KEY,
            original_id TEXT,
            author_id TEXT NOT NULL,
            account_id TEXT,
            channel_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            webhook_id TEXT,
            bot_id TEXT,
            reference_id TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_original ON messages(original_id);

        CREATE TABLE IF NOT EXISTS recent_proxies (
            user_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            score INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, member_id)
        );

        CREATE TABLE IF NOT EXISTS pending_dispatch (
            channel_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (channel_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS entity_cache (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            parent_id TEXT,
            data TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            error INTEGER,
            expires_at INTEGER,
            PRIMARY KEY (kind, id)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_cache_parent ON entity_cache(kind, parent_id);

        CREATE TABLE IF NOT EXISTS known_emojis (
            shard INTEGER NOT NULL,
            emoji_id TEXT NOT NULL,
            PRIMARY KEY (shard, emoji_id)
        );

        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS proxy_debug (
            message_id TEXT PRIMARY KEY,
            entries TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS proxy_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id TEXT NOT NULL,
            author_name TEXT NOT NULL,
            message_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}

/// Durable event stream with consumer groups
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS event_stream (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_event_stream_stream ON event_stream(stream, id);

        CREATE TABLE IF NOT EXISTS stream_groups (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_delivered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (stream, group_name)
        );

        CREATE TABLE IF NOT EXISTS stream_pending (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            delivered_at INTEGER NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream, group_name, entry_id)
        );

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3");
    Ok(())
}
