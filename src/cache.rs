//! Read-through entity cache
//!
//! Snapshots of guilds, channels, members, roles and webhook lists live in the
//! `entity_cache` table, written by the gateway process and by the engine's own
//! bookkeeping. A short-lived in-process memo collapses the repeated lookups
//! one event makes. A missing, deleted, errored or expired snapshot is a miss.

use std::sync::Arc;
use std::time::Duration;

use mini_moka::sync::Cache;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::db::{DbPool, conn, now_millis};
use crate::discord::{Channel, Guild, GuildMember, Role, Snowflake, Webhook};
use crate::{Error, Result};

/// Default snapshot lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Lifetime of member snapshots fetched on demand
pub const FETCHED_MEMBER_TTL: Duration = Duration::from_secs(10 * 60);

/// Lifetime of in-process memo entries
const MEMO_TTL: Duration = Duration::from_millis(200);

/// Deepest parent chain followed when building a channel stack
const MAX_CHANNEL_DEPTH: usize = 4;

/// Kind of cached entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Guild,
    Channel,
    Member,
    Role,
    Webhooks,
}

impl EntityKind {
    /// Storage key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guild => "guild",
            Self::Channel => "channel",
            Self::Member => "member",
            Self::Role => "role",
            Self::Webhooks => "webhooks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    kind: EntityKind,
    id: String,
}

/// Two-tier snapshot cache
#[derive(Clone)]
pub struct EntityCache {
    pool: DbPool,
    memo: Cache<MemoKey, Option<Arc<str>>>,
    roles: Cache<Snowflake, Arc<Vec<Role>>>,
}

impl EntityCache {
    /// Create a cache over the shared store
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            memo: Cache::builder()
                .max_capacity(4096)
                .time_to_live(MEMO_TTL)
                .build(),
            roles: Cache::builder()
                .max_capacity(1024)
                .time_to_live(MEMO_TTL)
                .build(),
        }
    }

    /// Member snapshot key
    #[must_use]
    pub fn member_key(guild_id: Snowflake, user_id: Snowflake) -> String {
        format!("{guild_id}:{user_id}")
    }

    /// Raw JSON of a live snapshot
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_raw(&self, kind: EntityKind, id: &str) -> Result<Option<Arc<str>>> {
        let key = MemoKey {
            kind,
            id: id.to_string(),
        };
        if let Some(hit) = self.memo.get(&key) {
            return Ok(hit);
        }

        let conn = conn(&self.pool)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM entity_cache
                 WHERE kind = ?1 AND id = ?2 AND deleted = 0 AND error IS NULL
                   AND (expires_at IS NULL OR expires_at > ?3)",
                params![kind.as_str(), id, now_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let data: Option<Arc<str>> = data.map(Arc::from);
        self.memo.insert(key, data.clone());
        Ok(data)
    }

    /// Decoded live snapshot
    ///
    /// A snapshot that no longer decodes is logged and treated as a miss.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> Result<Option<T>> {
        let Some(raw) = self.get_raw(kind, id)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), id, error = %e, "undecodable cache snapshot");
                Ok(None)
            }
        }
    }

    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_guild(&self, guild_id: Snowflake) -> Result<Option<Guild>> {
        self.get(EntityKind::Guild, &guild_id.to_string())
    }

    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_channel(&self, channel_id: Snowflake) -> Result<Option<Channel>> {
        self.get(EntityKind::Channel, &channel_id.to_string())
    }

    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<Option<GuildMember>> {
        self.get(EntityKind::Member, &Self::member_key(guild_id, user_id))
    }

    /// Cached webhook list for a channel
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_webhooks(&self, channel_id: Snowflake) -> Result<Option<Vec<Webhook>>> {
        self.get(EntityKind::Webhooks, &channel_id.to_string())
    }

    /// Every live role snapshot of a guild, via the parent index
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn guild_roles(&self, guild_id: Snowflake) -> Result<Arc<Vec<Role>>> {
        if let Some(hit) = self.roles.get(&guild_id) {
            return Ok(hit);
        }

        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT data FROM entity_cache
             WHERE kind = 'role' AND parent_id = ?1 AND deleted = 0 AND error IS NULL
               AND (expires_at IS NULL OR expires_at > ?2)",
        )?;
        let raw = stmt
            .query_map(params![guild_id.to_string(), now_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        let roles: Arc<Vec<Role>> = Arc::new(
            raw.iter()
                .filter_map(|data| serde_json::from_str(data).ok())
                .collect(),
        );
        self.roles.insert(guild_id, Arc::clone(&roles));
        Ok(roles)
    }

    /// Write a snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be encoded or the write fails
    pub fn put<T: Serialize + ?Sized>(
        &self,
        kind: EntityKind,
        id: &str,
        parent_id: Option<Snowflake>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let data = serde_json::to_string(value)?;
        let expires_at = ttl.map(|ttl| now_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2));

        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO entity_cache (kind, id, parent_id, data, deleted, error, expires_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
            params![
                kind.as_str(),
                id,
                parent_id.map(|p| p.to_string()),
                data,
                expires_at
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        self.forget(kind, id, parent_id);
        Ok(())
    }

    /// Remove a snapshot
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        let parent: Option<String> = conn
            .query_row(
                "DELETE FROM entity_cache WHERE kind = ?1 AND id = ?2 RETURNING parent_id",
                params![kind.as_str(), id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?
            .flatten();

        self.forget(kind, id, parent.and_then(|p| p.parse().ok()));
        Ok(())
    }

    /// Store the webhook list for a channel
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn put_webhooks(
        &self,
        channel_id: Snowflake,
        guild_id: Option<Snowflake>,
        webhooks: &[Webhook],
    ) -> Result<()> {
        self.put(
            EntityKind::Webhooks,
            &channel_id.to_string(),
            guild_id,
            webhooks,
            Some(DEFAULT_TTL),
        )
    }

    /// Store a member snapshot fetched on demand
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn put_fetched_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        member: &serde_json::Value,
    ) -> Result<()> {
        self.put(
            EntityKind::Member,
            &Self::member_key(guild_id, user_id),
            Some(guild_id),
            member,
            Some(FETCHED_MEMBER_TTL),
        )
    }

    /// Drop a member snapshot
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn invalidate_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<()> {
        self.delete(EntityKind::Member, &Self::member_key(guild_id, user_id))
    }

    /// Record the last poster in a channel, advancing the webhook index when asked
    ///
    /// Returns `false` when the channel has no snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_last_poster(
        &self,
        channel_id: Snowflake,
        poster: &str,
        advance_webhook: bool,
    ) -> Result<bool> {
        let id = channel_id.to_string();
        let conn = conn(&self.pool)?;
        let updated = conn
            .execute(
                "UPDATE entity_cache
                 SET data = json_set(
                     data,
                     '$.__plural_last_member', ?2,
                     '$.__plural_last_webhook',
                     COALESCE(json_extract(data, '$.__plural_last_webhook'), 0) + ?3
                 )
                 WHERE kind = 'channel' AND id = ?1",
                params![id, poster, i64::from(advance_webhook)],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        self.memo.invalidate(&MemoKey {
            kind: EntityKind::Channel,
            id,
        });
        Ok(updated == 1)
    }

    /// The channel followed by its cached ancestors
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn channel_stack(&self, channel_id: Snowflake) -> Result<Vec<Snowflake>> {
        let mut stack = vec![channel_id];
        let mut current = channel_id;

        while stack.len() < MAX_CHANNEL_DEPTH {
            let Some(parent) = self.get_channel(current)?.and_then(|c| c.parent_id) else {
                break;
            };
            if stack.contains(&parent) {
                break;
            }
            stack.push(parent);
            current = parent;
        }

        Ok(stack)
    }

    fn forget(&self, kind: EntityKind, id: &str, parent_id: Option<Snowflake>) {
        self.memo.invalidate(&MemoKey {
            kind,
            id: id.to_string(),
        });
        if kind == EntityKind::Role
            && let Some(guild) = parent_id
        {
            self.roles.invalidate(&guild);
        }
    }
}
