//! The SQLite-backed local store.

use crate::entity::SyncEntity;
use crate::error::{StoreError, StoreResult};
use crate::outbox;
use crate::prefs;
use crate::types::{ChangeKind, RecordKey, TableName, UploadQueueEntry};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use syncbox_codec::EnvelopeOptions;
use tracing::{debug, info};

const QUEUE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS upload_queue (
    id          INTEGER PRIMARY KEY NOT NULL,
    object_id   TEXT NOT NULL,
    table_name  TEXT NOT NULL,
    change_kind INTEGER NOT NULL,
    state       INTEGER NOT NULL,
    fail_count  INTEGER NOT NULL DEFAULT 0,
    creation    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS upload_queue_key ON upload_queue (table_name, object_id, id);
CREATE TABLE IF NOT EXISTS sync_metadata (
    zone             TEXT NOT NULL,
    owner            TEXT NOT NULL,
    record_name      TEXT NOT NULL,
    change_tag       TEXT,
    last_modified_ms INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    PRIMARY KEY (zone, owner, record_name)
);
CREATE TABLE IF NOT EXISTS sync_state (
    key   TEXT PRIMARY KEY NOT NULL,
    value
);
";

/// Local database holding syncable rows, the upload queue, sync metadata
/// and persisted sync state.
///
/// All methods take `&self`; writes are serialized through one connection
/// and every logical operation runs in its own transaction.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    envelope: EnvelopeOptions,
}

impl Database {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be created.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "opened local store");
        Ok(db)
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        for table in TableName::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    object_id TEXT PRIMARY KEY NOT NULL,
                    creation  INTEGER NOT NULL,
                    modified  INTEGER NOT NULL,
                    removed   INTEGER NOT NULL DEFAULT 0,
                    body      BLOB NOT NULL
                );",
                table.sql_table()
            ))?;
        }
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            envelope: EnvelopeOptions::default(),
        })
    }

    /// Sets the envelope options used for row bodies.
    pub fn with_envelope_options(mut self, options: EnvelopeOptions) -> Self {
        self.envelope = options;
        self
    }

    /// The database file, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` inside a transaction, committing on success.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs `f` against the connection without a transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn envelope(&self) -> &EnvelopeOptions {
        &self.envelope
    }

    /// Saves a locally edited entity and appends its outbox entry.
    ///
    /// The change is an `Insert` when no row exists yet, otherwise an
    /// `Update`. If the entity's `modified` is not ahead of the stored row
    /// it is bumped to one past it, so the edit always wins LWW against
    /// what this device has already seen.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails; nothing is written
    /// in that case.
    pub fn save_local(&self, entity: impl Into<SyncEntity>) -> StoreResult<UploadQueueEntry> {
        let mut entity = entity.into();
        self.write(|tx| {
            let stored = stored_modified(tx, entity.table(), entity.object_id())?;
            let kind = match stored {
                None => ChangeKind::Insert,
                Some(modified) => {
                    if entity.modified() <= modified {
                        entity.set_modified(modified + 1);
                    }
                    ChangeKind::Update
                }
            };
            put_row(tx, &entity, &self.envelope)?;
            let mut entries = outbox::append(tx, &[(entity.key(), kind)])?;
            debug!(
                object_id = %entity.object_id(),
                table = %entity.table(),
                ?kind,
                "saved local change"
            );
            entries.pop().ok_or_else(|| StoreError::not_found("upload_queue", entity.object_id()))
        })
    }

    /// Deletes a row locally and appends a `Delete` outbox entry.
    ///
    /// Returns `None` if the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn delete_local(
        &self,
        table: TableName,
        object_id: &str,
    ) -> StoreResult<Option<UploadQueueEntry>> {
        self.write(|tx| {
            if delete_row(tx, table, object_id)? == 0 {
                return Ok(None);
            }
            let key = RecordKey::new(object_id, table);
            let mut entries = outbox::append(tx, &[(key, ChangeKind::Delete)])?;
            debug!(object_id, %table, "deleted local row");
            Ok(entries.pop())
        })
    }

    /// Marks a row as a tombstone and appends an `Update` outbox entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if the row does not exist.
    pub fn mark_removed(
        &self,
        table: TableName,
        object_id: &str,
        now_ms: i64,
    ) -> StoreResult<UploadQueueEntry> {
        self.write(|tx| {
            let mut entity = get_row(tx, table, object_id)?
                .ok_or_else(|| StoreError::not_found(table.as_str(), object_id))?;
            entity.set_removed(true);
            entity.set_modified(now_ms.max(entity.modified() + 1));
            put_row(tx, &entity, &self.envelope)?;
            let mut entries = outbox::append(tx, &[(entity.key(), ChangeKind::Update)])?;
            entries
                .pop()
                .ok_or_else(|| StoreError::not_found("upload_queue", object_id))
        })
    }

    /// Physically deletes tombstones last modified before `cutoff_ms` and
    /// queues their remote deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn purge_tombstones(&self, cutoff_ms: i64) -> StoreResult<usize> {
        self.write(|tx| {
            let mut purged = Vec::new();
            for table in TableName::ALL {
                let mut stmt = tx.prepare(&format!(
                    "SELECT object_id FROM {} WHERE removed = 1 AND modified < ?1",
                    table.sql_table()
                ))?;
                let ids = stmt
                    .query_map(params![cutoff_ms], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                for id in ids {
                    delete_row(tx, table, &id)?;
                    purged.push((RecordKey::new(id, table), ChangeKind::Delete));
                }
            }
            outbox::append(tx, &purged)?;
            if !purged.is_empty() {
                info!(count = purged.len(), "purged tombstones");
            }
            Ok(purged.len())
        })
    }

    /// Loads one row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the body cannot be decoded.
    pub fn get_record(&self, table: TableName, object_id: &str) -> StoreResult<Option<SyncEntity>> {
        self.read(|conn| get_row(conn, table, object_id))
    }

    /// Loads every row of a table, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a body cannot be decoded.
    pub fn list_records(&self, table: TableName) -> StoreResult<Vec<SyncEntity>> {
        self.read(|conn| list_rows(conn, table))
    }

    /// Number of rows in a table, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn record_count(&self, table: TableName) -> StoreResult<u64> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.sql_table()),
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Wipes every synced table, all sync metadata, the whole outbox and
    /// the session token in one transaction.
    ///
    /// The queue id high-water mark survives so ids are never reused.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is wiped in that case.
    pub fn wipe_synced_data(&self) -> StoreResult<()> {
        self.write(|tx| {
            for table in TableName::ALL {
                tx.execute(&format!("DELETE FROM {}", table.sql_table()), [])?;
            }
            tx.execute("DELETE FROM sync_metadata", [])?;
            tx.execute("DELETE FROM upload_queue", [])?;
            prefs::clear_session_token(tx)?;
            info!("wiped synced data");
            Ok(())
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub(crate) fn stored_modified(
    conn: &Connection,
    table: TableName,
    object_id: &str,
) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT modified FROM {} WHERE object_id = ?1",
                table.sql_table()
            ),
            params![object_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn get_row(
    conn: &Connection,
    table: TableName,
    object_id: &str,
) -> StoreResult<Option<SyncEntity>> {
    let body: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT body FROM {} WHERE object_id = ?1", table.sql_table()),
            params![object_id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|body| decode_row(table, &body)).transpose()
}

pub(crate) fn list_rows(conn: &Connection, table: TableName) -> StoreResult<Vec<SyncEntity>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT body FROM {} ORDER BY creation, object_id",
        table.sql_table()
    ))?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies.iter().map(|body| decode_row(table, body)).collect()
}

pub(crate) fn list_keys(conn: &Connection, table: TableName) -> StoreResult<Vec<RecordKey>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT object_id FROM {} ORDER BY creation, object_id",
        table.sql_table()
    ))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|id| id.map(|id| RecordKey::new(id, table)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

pub(crate) fn put_row(
    conn: &Connection,
    entity: &SyncEntity,
    options: &EnvelopeOptions,
) -> StoreResult<()> {
    let body = entity.encode(options)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (object_id, creation, modified, removed, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (object_id) DO UPDATE SET
                creation = excluded.creation,
                modified = excluded.modified,
                removed = excluded.removed,
                body = excluded.body",
            entity.table().sql_table()
        ),
        params![
            entity.object_id(),
            entity.creation(),
            entity.modified(),
            entity.removed(),
            body
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_row(conn: &Connection, table: TableName, object_id: &str) -> StoreResult<usize> {
    Ok(conn.execute(
        &format!("DELETE FROM {} WHERE object_id = ?1", table.sql_table()),
        params![object_id],
    )?)
}

fn decode_row(table: TableName, body: &[u8]) -> StoreResult<SyncEntity> {
    let entity = SyncEntity::decode(table, body)?;
    if entity.table() != table {
        return Err(StoreError::TableMismatch {
            expected: table.to_string(),
            found: entity.table().to_string(),
        });
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Conversation, Message};
    use crate::types::UploadState;

    fn conversation(id: &str, modified: i64, title: &str) -> Conversation {
        Conversation {
            object_id: id.into(),
            creation: 1,
            modified,
            title: title.into(),
            ..Default::default()
        }
    }

    #[test]
    fn save_local_inserts_then_updates() {
        let db = Database::open_in_memory().unwrap();

        let first = db.save_local(conversation("c-1", 10, "a")).unwrap();
        assert_eq!(first.change_kind, ChangeKind::Insert);
        assert_eq!(first.state, UploadState::Pending);

        let second = db.save_local(conversation("c-1", 20, "b")).unwrap();
        assert_eq!(second.change_kind, ChangeKind::Update);
        assert!(second.id > first.id);

        let stored = db.get_record(TableName::Conversation, "c-1").unwrap().unwrap();
        assert_eq!(stored.modified(), 20);
    }

    #[test]
    fn stale_local_edit_is_bumped_past_stored_row() {
        let db = Database::open_in_memory().unwrap();
        db.save_local(conversation("c-1", 50, "a")).unwrap();
        db.save_local(conversation("c-1", 40, "b")).unwrap();

        let stored = db.get_record(TableName::Conversation, "c-1").unwrap().unwrap();
        assert_eq!(stored.modified(), 51);
    }

    #[test]
    fn delete_local_missing_row_is_noop() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.delete_local(TableName::Message, "nope").unwrap().is_none());
        assert_eq!(db.outbox_entries().unwrap().len(), 0);
    }

    #[test]
    fn tombstones_are_purged_with_delete_entries() {
        let db = Database::open_in_memory().unwrap();
        db.save_local(Message {
            object_id: "m-1".into(),
            creation: 1,
            modified: 2,
            conversation_id: "c-1".into(),
            ..Default::default()
        })
        .unwrap();
        db.mark_removed(TableName::Message, "m-1", 100).unwrap();
        let row = db.get_record(TableName::Message, "m-1").unwrap().unwrap();
        assert!(row.removed());

        assert_eq!(db.purge_tombstones(50).unwrap(), 0);
        assert_eq!(db.purge_tombstones(101).unwrap(), 1);
        assert!(db.get_record(TableName::Message, "m-1").unwrap().is_none());

        let last = db.outbox_entries().unwrap().pop().unwrap();
        assert_eq!(last.change_kind, ChangeKind::Delete);
    }

    #[test]
    fn wipe_clears_rows_queue_and_token() {
        let db = Database::open_in_memory().unwrap();
        db.save_local(conversation("c-1", 1, "a")).unwrap();
        db.set_session_token(Some(&crate::prefs::SessionToken::new(vec![1, 2])))
            .unwrap();

        db.wipe_synced_data().unwrap();

        assert_eq!(db.record_count(TableName::Conversation).unwrap(), 0);
        assert!(db.outbox_entries().unwrap().is_empty());
        assert!(db.session_token().unwrap().is_none());
    }

    #[test]
    fn reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_local(conversation("c-1", 1, "kept")).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert_eq!(db.record_count(TableName::Conversation).unwrap(), 1);
        assert_eq!(db.outbox_entries().unwrap().len(), 1);
    }
}
