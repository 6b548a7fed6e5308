//! Autoproxy state repository

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{DbPool, conn, now_millis, parse_snowflake};
use crate::discord::Snowflake;
use crate::{Error, Result};

/// Autoproxy behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoproxyMode {
    /// All proxying is disabled for the scope
    Off,
    /// Remembers the last persona matched by a tag
    Latch,
    /// Uses the selected persona when no tag matches
    Front,
    /// Uses the selected persona regardless of tags
    Locked,
}

impl AutoproxyMode {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Latch => "latch",
            Self::Front => "front",
            Self::Locked => "locked",
        }
    }
}

impl FromStr for AutoproxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" | "disabled" => Ok(Self::Off),
            "latch" => Ok(Self::Latch),
            "front" => Ok(Self::Front),
            "locked" => Ok(Self::Locked),
            other => Err(Error::Invalid(format!("unknown autoproxy mode: {other}"))),
        }
    }
}

/// Autoproxy record for an account in one guild, or globally
#[derive(Debug, Clone)]
pub struct Autoproxy {
    pub account_id: String,
    /// `None` for the global record
    pub guild_id: Option<Snowflake>,
    pub mode: AutoproxyMode,
    /// Currently selected persona
    pub member_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Autoproxy {
    /// Whether this is a guild-scoped record
    #[must_use]
    pub const fn is_guild(&self) -> bool {
        self.guild_id.is_some()
    }
}

/// Autoproxy repository
#[derive(Clone)]
pub struct AutoproxyRepo {
    pool: DbPool,
}

impl AutoproxyRepo {
    /// Create a new autoproxy repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Unexpired records for a guild and the global scope
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn for_guild(&self, account_id: &str, guild_id: Snowflake) -> Result<Vec<Autoproxy>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT account_id, guild_id, mode, member_id, expires_at FROM autoproxies
             WHERE account_id = ?1 AND guild_id IN (?2, '')
               AND (expires_at IS NULL OR expires_at > ?3)",
        )?;

        let records = stmt
            .query_map(
                params![account_id, guild_id.to_string(), now_millis()],
                |row| {
                    let guild: String = row.get(1)?;
                    let mode: String = row.get(2)?;
                    let expires_at: Option<i64> = row.get(4)?;

                    Ok(Autoproxy {
                        account_id: row.get(0)?,
                        guild_id: if guild.is_empty() {
                            None
                        } else {
                            Some(parse_snowflake(&guild)?)
                        },
                        mode: mode.parse().unwrap_or(AutoproxyMode::Off),
                        member_id: row.get(3)?,
                        expires_at: expires_at.and_then(DateTime::from_timestamp_millis),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(records)
    }

    /// Insert or replace a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, autoproxy: &Autoproxy) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO autoproxies (account_id, guild_id, mode, member_id, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                autoproxy.account_id,
                guild_key(autoproxy.guild_id),
                autoproxy.mode.as_str(),
                autoproxy.member_id,
                autoproxy.expires_at.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Change the selected persona of an existing record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_member(
        &self,
        account_id: &str,
        guild_id: Option<Snowflake>,
        member_id: Option<&str>,
    ) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE autoproxies SET member_id = ?1 WHERE account_id = ?2 AND guild_id = ?3",
            params![member_id, account_id, guild_key(guild_id)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

fn guild_key(guild_id: Option<Snowflake>) -> String {
    guild_id.map(|g| g.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccountConfig, AccountRepo, init_memory};

    fn setup() -> (AutoproxyRepo, String) {
        let pool = init_memory().unwrap();
        let account = AccountRepo::new(pool.clone())
            .create(AccountConfig::default(), &[])
            .unwrap();
        (AutoproxyRepo::new(pool), account.id)
    }

    #[test]
    fn guild_and_global_records() {
        let (repo, account_id) = setup();

        repo.upsert(&Autoproxy {
            account_id: account_id.clone(),
            guild_id: None,
            mode: AutoproxyMode::Front,
            member_id: Some("m1".into()),
            expires_at: None,
        })
        .unwrap();
        repo.upsert(&Autoproxy {
            account_id: account_id.clone(),
            guild_id: Some(Snowflake(10)),
            mode: AutoproxyMode::Latch,
            member_id: None,
            expires_at: None,
        })
        .unwrap();
        repo.upsert(&Autoproxy {
            account_id: account_id.clone(),
            guild_id: Some(Snowflake(11)),
            mode: AutoproxyMode::Locked,
            member_id: None,
            expires_at: None,
        })
        .unwrap();

        let records = repo.for_guild(&account_id, Snowflake(10)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|a| a.guild_id.is_none() && a.mode == AutoproxyMode::Front));
        assert!(records.iter().any(|a| a.guild_id == Some(Snowflake(10))));
    }

    #[test]
    fn expired_records_are_ignored() {
        let (repo, account_id) = setup();
        repo.upsert(&Autoproxy {
            account_id: account_id.clone(),
            guild_id: None,
            mode: AutoproxyMode::Front,
            member_id: Some("m1".into()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        })
        .unwrap();

        assert!(repo.for_guild(&account_id, Snowflake(10)).unwrap().is_empty());
    }

    #[test]
    fn set_member_updates_scope() {
        let (repo, account_id) = setup();
        repo.upsert(&Autoproxy {
            account_id: account_id.clone(),
            guild_id: Some(Snowflake(10)),
            mode: AutoproxyMode::Latch,
            member_id: Some("m1".into()),
            expires_at: None,
        })
        .unwrap();

        repo.set_member(&account_id, Some(Snowflake(10)), Some("m2")).unwrap();
        let records = repo.for_guild(&account_id, Snowflake(10)).unwrap();
        assert_eq!(records[0].member_id.as_deref(), Some("m2"));

        repo.set_member(&account_id, Some(Snowflake(10)), None).unwrap();
        let records = repo.for_guild(&account_id, Snowflake(10)).unwrap();
        assert!(records[0].member_id.is_none());
    }
}
