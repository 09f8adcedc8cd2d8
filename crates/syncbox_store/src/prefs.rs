//! Persisted sync state and sync-scope preferences.

use crate::database::Database;
use crate::error::StoreResult;
use crate::types::TableName;
use rusqlite::types::{FromSql, ToSql};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::fmt;

const SYNC_ENABLED: &str = "sync.enabled";
const SESSION_TOKEN: &str = "sync.session_token";
const LAST_SYNC_AT: &str = "sync.last_sync_at";
const DISABLED_TABLES: &str = "sync.disabled_tables";

/// Opaque backend state used to resume incremental fetches.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Vec<u8>);

impl SessionToken {
    /// Wraps raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({} bytes)", self.0.len())
    }
}

/// Sync state persisted across launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPreferences {
    /// Global switch; fetch and send are no-ops when false.
    pub sync_enabled: bool,
    /// Resume token of the last fetch.
    pub session_token: Option<SessionToken>,
    /// Millisecond timestamp of the last sync that ended without failures.
    pub last_sync_at: Option<i64>,
    /// Tables excluded from sync.
    pub disabled_tables: BTreeSet<TableName>,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            session_token: None,
            last_sync_at: None,
            disabled_tables: BTreeSet::new(),
        }
    }
}

impl SyncPreferences {
    /// Tables currently included in sync, in dependency order.
    pub fn enabled_tables(&self) -> Vec<TableName> {
        TableName::ALL
            .into_iter()
            .filter(|t| !self.disabled_tables.contains(t))
            .collect()
    }
}

impl Database {
    /// Loads all persisted sync state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn load_preferences(&self) -> StoreResult<SyncPreferences> {
        self.read(|conn| {
            Ok(SyncPreferences {
                sync_enabled: sync_enabled(conn)?,
                session_token: get::<Vec<u8>>(conn, SESSION_TOKEN)?.map(SessionToken),
                last_sync_at: get(conn, LAST_SYNC_AT)?,
                disabled_tables: disabled_tables(conn)?,
            })
        })
    }

    /// Persists all sync state in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_preferences(&self, prefs: &SyncPreferences) -> StoreResult<()> {
        self.write(|tx| {
            set(tx, SYNC_ENABLED, &prefs.sync_enabled)?;
            match &prefs.session_token {
                Some(token) => set(tx, SESSION_TOKEN, &token.0)?,
                None => clear_session_token(tx)?,
            }
            match prefs.last_sync_at {
                Some(at) => set(tx, LAST_SYNC_AT, &at)?,
                None => unset(tx, LAST_SYNC_AT)?,
            }
            set(tx, DISABLED_TABLES, &join_tables(&prefs.disabled_tables))
        })
    }

    /// Global sync switch.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn sync_enabled(&self) -> StoreResult<bool> {
        self.read(sync_enabled)
    }

    /// Sets the global sync switch.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_sync_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write(|tx| set(tx, SYNC_ENABLED, &enabled))
    }

    /// The stored session resume token.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn session_token(&self) -> StoreResult<Option<SessionToken>> {
        self.read(|conn| Ok(get::<Vec<u8>>(conn, SESSION_TOKEN)?.map(SessionToken)))
    }

    /// Stores or clears the session resume token.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_session_token(&self, token: Option<&SessionToken>) -> StoreResult<()> {
        self.write(|tx| match token {
            Some(token) => set(tx, SESSION_TOKEN, &token.0),
            None => clear_session_token(tx),
        })
    }

    /// Time of the last sync that ended without failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn last_sync_at(&self) -> StoreResult<Option<i64>> {
        self.read(|conn| get(conn, LAST_SYNC_AT))
    }

    /// Records a successful sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_last_sync_at(&self, at_ms: i64) -> StoreResult<()> {
        self.write(|tx| set(tx, LAST_SYNC_AT, &at_ms))
    }

    /// Returns true unless `table` was excluded from sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn is_table_sync_enabled(&self, table: TableName) -> StoreResult<bool> {
        self.read(|conn| is_table_enabled(conn, table))
    }

    /// Tables currently included in sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn enabled_tables(&self) -> StoreResult<Vec<TableName>> {
        let disabled = self.read(disabled_tables)?;
        Ok(TableName::ALL
            .into_iter()
            .filter(|t| !disabled.contains(t))
            .collect())
    }

    /// Includes or excludes a table from sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_table_enabled(&self, table: TableName, enabled: bool) -> StoreResult<()> {
        self.write(|tx| {
            let mut disabled = disabled_tables(tx)?;
            if enabled {
                disabled.remove(&table);
            } else {
                disabled.insert(table);
            }
            set(tx, DISABLED_TABLES, &join_tables(&disabled))
        })
    }
}

pub(crate) fn is_table_enabled(conn: &Connection, table: TableName) -> StoreResult<bool> {
    Ok(!disabled_tables(conn)?.contains(&table))
}

pub(crate) fn clear_session_token(conn: &Connection) -> StoreResult<()> {
    unset(conn, SESSION_TOKEN)
}

fn sync_enabled(conn: &Connection) -> StoreResult<bool> {
    Ok(get::<bool>(conn, SYNC_ENABLED)?.unwrap_or(true))
}

fn disabled_tables(conn: &Connection) -> StoreResult<BTreeSet<TableName>> {
    let raw: Option<String> = get(conn, DISABLED_TABLES)?;
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

fn join_tables(tables: &BTreeSet<TableName>) -> String {
    tables
        .iter()
        .map(TableName::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn get<T: FromSql>(conn: &Connection, key: &str) -> StoreResult<Option<T>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set(conn: &Connection, key: &str, value: &dyn ToSql) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn unset(conn: &Connection, key: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM sync_state WHERE key = ?1", params![key])?;
    Ok(())
}
