//! Upload queue (outbox) operations.
//!
//! Entries are append-only: only `state` and `fail_count` change in place.
//! For one record key the highest id is authoritative; older rows are
//! superseded and skipped by [`Database::list_pending`].

use crate::database::{self, Database};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    now_millis, ChangeKind, RecordKey, TableName, UploadQueueEntry, UploadState, MAX_FAIL_COUNT,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

const HIGH_WATER_KEY: &str = "outbox.last_id";

const ENTRY_COLUMNS: &str = "id, object_id, table_name, change_kind, state, fail_count, creation";

/// Outbox counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Rows waiting to be scheduled.
    pub pending: u64,
    /// Rows in an in-flight batch.
    pub uploading: u64,
    /// Rows acknowledged but not yet removed.
    pub finished: u64,
    /// Rows parked at the failure cap.
    pub poisoned: u64,
    /// Rows superseded by a newer entry for the same key.
    pub superseded: u64,
    /// All rows.
    pub total: u64,
}

impl Database {
    /// Appends one entry per change, assigning ids past the current maximum.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; no entry is appended then.
    pub fn enqueue(&self, changes: &[(RecordKey, ChangeKind)]) -> StoreResult<Vec<UploadQueueEntry>> {
        self.write(|tx| append(tx, changes))
    }

    /// Lists schedulable entries for `tables`.
    ///
    /// Only the newest entry per record key is considered, and only if it
    /// is pending and below the failure cap. Results are ordered by
    /// ascending creation time, then id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_pending(
        &self,
        tables: &[TableName],
        batch_size: usize,
    ) -> StoreResult<Vec<UploadQueueEntry>> {
        if tables.is_empty() || batch_size == 0 {
            return Ok(Vec::new());
        }
        let placeholders = (0..tables.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM upload_queue q
             WHERE q.id = (SELECT MAX(n.id) FROM upload_queue n
                           WHERE n.object_id = q.object_id AND n.table_name = q.table_name)
               AND q.state IN (?1, ?2)
               AND q.fail_count < ?3
               AND q.table_name IN ({placeholders})
             ORDER BY q.creation ASC, q.id ASC
             LIMIT {batch_size}"
        );
        let mut values = vec![
            Value::Integer(UploadState::Pending.to_code()),
            Value::Integer(UploadState::Failed.to_code()),
            Value::Integer(i64::from(MAX_FAIL_COUNT)),
        ];
        values.extend(tables.iter().map(|t| Value::Text(t.as_str().to_owned())));

        self.read(|conn| query_entries(conn, &sql, params_from_iter(values.iter())))
    }

    /// Moves entries to `state`.
    ///
    /// `Failed` is folded back to `Pending` with the failure count bumped
    /// (saturating at the cap). Returns the number of rows touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn change_state(&self, ids: &[i64], state: UploadState) -> StoreResult<usize> {
        self.write(|tx| {
            let mut touched = 0;
            for id in ids {
                touched += match state {
                    UploadState::Failed => tx.execute(
                        "UPDATE upload_queue
                         SET fail_count = MIN(fail_count + 1, ?1), state = ?2
                         WHERE id = ?3",
                        params![MAX_FAIL_COUNT, UploadState::Pending.to_code(), id],
                    )?,
                    other => tx.execute(
                        "UPDATE upload_queue SET state = ?1 WHERE id = ?2",
                        params![other.to_code(), id],
                    )?,
                };
            }
            Ok(touched)
        })
    }

    /// Removes the given entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn dequeue(&self, ids: &[i64]) -> StoreResult<usize> {
        self.write(|tx| {
            let mut removed = 0;
            for id in ids {
                removed += tx.execute("DELETE FROM upload_queue WHERE id = ?1", params![id])?;
            }
            Ok(removed)
        })
    }

    /// Removes every entry for `key` with an id at or below `max_id`.
    ///
    /// Newer entries for the same key stay queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn dequeue_up_to(&self, key: &RecordKey, max_id: i64) -> StoreResult<usize> {
        self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM upload_queue
                 WHERE object_id = ?1 AND table_name = ?2 AND id <= ?3",
                params![key.object_id, key.table.as_str(), max_id],
            )?)
        })
    }

    /// Removes every entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn dequeue_deleted(&self, key: &RecordKey) -> StoreResult<usize> {
        self.write(|tx| remove_key(tx, key))
    }

    /// Looks up one entry by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn queue_entry(&self, id: i64) -> StoreResult<Option<UploadQueueEntry>> {
        self.read(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM upload_queue WHERE id = ?1"),
                    params![id],
                    RawEntry::from_row,
                )
                .optional()?;
            raw.map(RawEntry::into_entry).transpose()
        })
    }

    /// All rows in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn outbox_entries(&self) -> StoreResult<Vec<UploadQueueEntry>> {
        self.read(|conn| {
            query_entries(
                conn,
                &format!("SELECT {ENTRY_COLUMNS} FROM upload_queue ORDER BY id"),
                [],
            )
        })
    }

    /// Rebuilds the outbox from the current rows.
    ///
    /// Every existing entry, poisoned ones included, is dropped and one
    /// `Insert` is queued per stored row. Returns the number of entries
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the old queue is kept then.
    pub fn reinitialize_outbox(&self) -> StoreResult<usize> {
        self.write(|tx| {
            tx.execute("DELETE FROM upload_queue", [])?;
            let mut changes = Vec::new();
            for table in TableName::ALL {
                changes.extend(
                    database::list_keys(tx, table)?
                        .into_iter()
                        .map(|key| (key, ChangeKind::Insert)),
                );
            }
            let entries = append(tx, &changes)?;
            info!(count = entries.len(), "reinitialized outbox");
            Ok(entries.len())
        })
    }

    /// Deletes rows superseded by a newer entry for the same key.
    ///
    /// Rows in an in-flight batch are kept until acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn prune_superseded(&self) -> StoreResult<usize> {
        self.write(|tx| {
            let pruned = tx.execute(
                "DELETE FROM upload_queue
                 WHERE state != ?1
                   AND id < (SELECT MAX(n.id) FROM upload_queue n
                             WHERE n.object_id = upload_queue.object_id
                               AND n.table_name = upload_queue.table_name)",
                params![UploadState::Uploading.to_code()],
            )?;
            if pruned > 0 {
                debug!(pruned, "pruned superseded outbox rows");
            }
            Ok(pruned)
        })
    }

    /// Folds rows left `Uploading` by an interrupted session back to
    /// `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn reset_uploading(&self) -> StoreResult<usize> {
        self.write(|tx| {
            let reset = tx.execute(
                "UPDATE upload_queue SET state = ?1 WHERE state = ?2",
                params![
                    UploadState::Pending.to_code(),
                    UploadState::Uploading.to_code()
                ],
            )?;
            if reset > 0 {
                warn!(reset, "requeued uploads interrupted by shutdown");
            }
            Ok(reset)
        })
    }

    /// Counts rows by state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn outbox_stats(&self) -> StoreResult<OutboxStats> {
        let entries = self.outbox_entries()?;
        let mut newest = std::collections::HashMap::new();
        for entry in &entries {
            newest
                .entry(entry.key())
                .and_modify(|id: &mut i64| *id = (*id).max(entry.id))
                .or_insert(entry.id);
        }

        let mut stats = OutboxStats {
            total: entries.len() as u64,
            ..Default::default()
        };
        for entry in &entries {
            if newest.get(&entry.key()) != Some(&entry.id) {
                stats.superseded += 1;
            }
            if entry.is_poisoned() {
                stats.poisoned += 1;
                continue;
            }
            match entry.state {
                UploadState::Pending | UploadState::Failed => stats.pending += 1,
                UploadState::Uploading => stats.uploading += 1,
                UploadState::Finish => stats.finished += 1,
            }
        }
        Ok(stats)
    }
}

/// Appends entries inside an open transaction.
pub(crate) fn append(
    conn: &Connection,
    changes: &[(RecordKey, ChangeKind)],
) -> StoreResult<Vec<UploadQueueEntry>> {
    if changes.is_empty() {
        return Ok(Vec::new());
    }
    let max_row: Option<i64> =
        conn.query_row("SELECT MAX(id) FROM upload_queue", [], |row| row.get(0))?;
    let high_water: Option<i64> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![HIGH_WATER_KEY],
            |row| row.get(0),
        )
        .optional()?;
    let mut next = max_row.unwrap_or(0).max(high_water.unwrap_or(0)) + 1;

    let creation = now_millis();
    let mut entries = Vec::with_capacity(changes.len());
    let mut stmt = conn.prepare_cached(
        "INSERT INTO upload_queue (id, object_id, table_name, change_kind, state, fail_count, creation)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
    )?;
    for (key, kind) in changes {
        stmt.execute(params![
            next,
            key.object_id,
            key.table.as_str(),
            kind.to_code(),
            UploadState::Pending.to_code(),
            creation
        ])?;
        entries.push(UploadQueueEntry {
            id: next,
            object_id: key.object_id.clone(),
            table: key.table,
            change_kind: *kind,
            state: UploadState::Pending,
            fail_count: 0,
            creation,
        });
        next += 1;
    }
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![HIGH_WATER_KEY, next - 1],
    )?;
    Ok(entries)
}

pub(crate) fn remove_key(conn: &Connection, key: &RecordKey) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM upload_queue WHERE object_id = ?1 AND table_name = ?2",
        params![key.object_id, key.table.as_str()],
    )?)
}

/// Removes the entries for `key` that are not part of an in-flight batch.
pub(crate) fn remove_idle_for_key(conn: &Connection, key: &RecordKey) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM upload_queue WHERE object_id = ?1 AND table_name = ?2 AND state != ?3",
        params![
            key.object_id,
            key.table.as_str(),
            UploadState::Uploading.to_code()
        ],
    )?)
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<UploadQueueEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawEntry::into_entry).collect()
}

/// A queue row before its codes are validated.
struct RawEntry {
    id: i64,
    object_id: String,
    table: String,
    change_kind: i64,
    state: i64,
    fail_count: i64,
    creation: i64,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            object_id: row.get(1)?,
            table: row.get(2)?,
            change_kind: row.get(3)?,
            state: row.get(4)?,
            fail_count: row.get(5)?,
            creation: row.get(6)?,
        })
    }

    fn into_entry(self) -> StoreResult<UploadQueueEntry> {
        Ok(UploadQueueEntry {
            id: self.id,
            object_id: self.object_id,
            table: self.table.parse()?,
            change_kind: ChangeKind::from_code(self.change_kind).ok_or(
                StoreError::InvalidCode {
                    what: "change_kind",
                    code: self.change_kind,
                },
            )?,
            state: UploadState::from_code(self.state).ok_or(StoreError::InvalidCode {
                what: "state",
                code: self.state,
            })?,
            fail_count: u32::try_from(self.fail_count).unwrap_or(MAX_FAIL_COUNT),
            creation: self.creation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(id, TableName::Conversation)
    }

    #[test]
    fn ids_are_never_reused() {
        let db = Database::open_in_memory().unwrap();
        let first = db.enqueue(&[(key("a"), ChangeKind::Insert)]).unwrap();
        let second = db.enqueue(&[(key("b"), ChangeKind::Insert)]).unwrap();
        db.dequeue(&[second[0].id]).unwrap();

        let third = db.enqueue(&[(key("c"), ChangeKind::Insert)]).unwrap();
        assert_eq!(first[0].id, 1);
        assert_eq!(third[0].id, second[0].id + 1);
    }

    #[test]
    fn newest_entry_per_key_wins() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue(&[
            (key("a"), ChangeKind::Insert),
            (key("a"), ChangeKind::Update),
            (key("b"), ChangeKind::Insert),
            (key("a"), ChangeKind::Delete),
        ])
        .unwrap();

        let pending = db.list_pending(&TableName::ALL, 100).unwrap();
        assert_eq!(pending.len(), 2);
        let a = pending.iter().find(|e| e.object_id == "a").unwrap();
        assert_eq!(a.change_kind, ChangeKind::Delete);
        assert_eq!(a.id, 4);
    }

    #[test]
    fn in_flight_newest_hides_key() {
        let db = Database::open_in_memory().unwrap();
        let entries = db.enqueue(&[(key("a"), ChangeKind::Insert)]).unwrap();
        db.change_state(&[entries[0].id], UploadState::Uploading).unwrap();
        assert!(db.list_pending(&TableName::ALL, 100).unwrap().is_empty());

        db.enqueue(&[(key("a"), ChangeKind::Update)]).unwrap();
        let pending = db.list_pending(&TableName::ALL, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change_kind, ChangeKind::Update);
    }

    #[test]
    fn disabled_tables_are_filtered() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue(&[
            (key("a"), ChangeKind::Insert),
            (RecordKey::new("m", TableName::Message), ChangeKind::Insert),
        ])
        .unwrap();

        let pending = db.list_pending(&[TableName::Message], 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table, TableName::Message);
        assert!(db.list_pending(&[], 100).unwrap().is_empty());
    }

    #[test]
    fn batch_size_bounds_page() {
        let db = Database::open_in_memory().unwrap();
        let changes: Vec<_> = (0..10)
            .map(|i| (key(&format!("k{i}")), ChangeKind::Insert))
            .collect();
        db.enqueue(&changes).unwrap();

        let page = db.list_pending(&TableName::ALL, 3).unwrap();
        assert_eq!(
            page.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn failed_folds_to_pending_and_counts() {
        let db = Database::open_in_memory().unwrap();
        let id = db.enqueue(&[(key("a"), ChangeKind::Insert)]).unwrap()[0].id;

        db.change_state(&[id], UploadState::Failed).unwrap();
        let entry = db.queue_entry(id).unwrap().unwrap();
        assert_eq!(entry.state, UploadState::Pending);
        assert_eq!(entry.fail_count, 1);
    }

    #[test]
    fn dequeue_up_to_keeps_newer_entries() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue(&[
            (key("a"), ChangeKind::Insert),
            (key("a"), ChangeKind::Update),
            (key("a"), ChangeKind::Update),
        ])
        .unwrap();

        assert_eq!(db.dequeue_up_to(&key("a"), 2).unwrap(), 2);
        let left = db.outbox_entries().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, 3);
    }

    #[test]
    fn prune_keeps_newest_and_in_flight() {
        let db = Database::open_in_memory().unwrap();
        let entries = db
            .enqueue(&[
                (key("a"), ChangeKind::Insert),
                (key("a"), ChangeKind::Update),
                (key("a"), ChangeKind::Update),
            ])
            .unwrap();
        db.change_state(&[entries[1].id], UploadState::Uploading).unwrap();

        assert_eq!(db.prune_superseded().unwrap(), 1);
        let ids: Vec<_> = db.outbox_entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn reset_uploading_and_stats() {
        let db = Database::open_in_memory().unwrap();
        let entries = db
            .enqueue(&[(key("a"), ChangeKind::Insert), (key("b"), ChangeKind::Insert)])
            .unwrap();
        db.change_state(&[entries[0].id], UploadState::Uploading).unwrap();

        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.uploading, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 2);

        assert_eq!(db.reset_uploading().unwrap(), 1);
        assert_eq!(db.outbox_stats().unwrap().pending, 2);
    }
}
