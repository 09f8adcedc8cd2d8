//! Sync metadata: the last-known remote state of each record.

use crate::database::Database;
use crate::error::StoreResult;
use crate::types::{RecordName, SyncMetadataEntry};
use rusqlite::{params, Connection, OptionalExtension};

const COLUMNS: &str = "zone, owner, record_name, change_tag, last_modified_ms, updated_at";

impl Database {
    /// Looks up metadata for one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn metadata_get(
        &self,
        zone: &str,
        owner: &str,
        record_name: &RecordName,
    ) -> StoreResult<Option<SyncMetadataEntry>> {
        self.read(|conn| get(conn, zone, owner, record_name))
    }

    /// Inserts or replaces metadata for one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn metadata_put(&self, entry: &SyncMetadataEntry) -> StoreResult<()> {
        self.write(|tx| put(tx, entry))
    }

    /// Removes metadata for one record. Returns true if a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn metadata_remove(
        &self,
        zone: &str,
        owner: &str,
        record_name: &RecordName,
    ) -> StoreResult<bool> {
        self.write(|tx| remove(tx, zone, owner, record_name))
    }

    /// Every metadata row, ordered by record name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn metadata_list(&self) -> StoreResult<Vec<SyncMetadataEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sync_metadata ORDER BY zone, owner, record_name"
            ))?;
            let rows = stmt
                .query_map([], from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drops all metadata. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn metadata_clear(&self) -> StoreResult<usize> {
        self.write(|tx| Ok(tx.execute("DELETE FROM sync_metadata", [])?))
    }
}

pub(crate) fn get(
    conn: &Connection,
    zone: &str,
    owner: &str,
    record_name: &RecordName,
) -> StoreResult<Option<SyncMetadataEntry>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM sync_metadata
                 WHERE zone = ?1 AND owner = ?2 AND record_name = ?3"
            ),
            params![zone, owner, record_name.as_str()],
            from_row,
        )
        .optional()?)
}

pub(crate) fn put(conn: &Connection, entry: &SyncMetadataEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_metadata (zone, owner, record_name, change_tag, last_modified_ms, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (zone, owner, record_name) DO UPDATE SET
            change_tag = excluded.change_tag,
            last_modified_ms = excluded.last_modified_ms,
            updated_at = excluded.updated_at",
        params![
            entry.zone,
            entry.owner,
            entry.record_name.as_str(),
            entry.change_tag,
            entry.last_modified_ms,
            entry.updated_at
        ],
    )?;
    Ok(())
}

pub(crate) fn remove(
    conn: &Connection,
    zone: &str,
    owner: &str,
    record_name: &RecordName,
) -> StoreResult<bool> {
    let removed = conn.execute(
        "DELETE FROM sync_metadata WHERE zone = ?1 AND owner = ?2 AND record_name = ?3",
        params![zone, owner, record_name.as_str()],
    )?;
    Ok(removed > 0)
}

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncMetadataEntry> {
    Ok(SyncMetadataEntry {
        zone: row.get(0)?,
        owner: row.get(1)?,
        record_name: RecordName::from_raw(row.get::<_, String>(2)?),
        change_tag: row.get(3)?,
        last_modified_ms: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableName;

    fn entry(tag: &str) -> SyncMetadataEntry {
        SyncMetadataEntry {
            zone: "Chats".into(),
            owner: "me".into(),
            record_name: RecordName::new("c-1", TableName::Conversation),
            change_tag: Some(tag.into()),
            last_modified_ms: 42,
            updated_at: 1,
        }
    }

    #[test]
    fn put_is_an_upsert() {
        let db = Database::open_in_memory().unwrap();
        db.metadata_put(&entry("t1")).unwrap();
        db.metadata_put(&entry("t2")).unwrap();

        let name = RecordName::new("c-1", TableName::Conversation);
        let got = db.metadata_get("Chats", "me", &name).unwrap().unwrap();
        assert_eq!(got.change_tag.as_deref(), Some("t2"));
        assert_eq!(db.metadata_list().unwrap().len(), 1);
    }

    #[test]
    fn key_includes_zone_and_owner() {
        let db = Database::open_in_memory().unwrap();
        db.metadata_put(&entry("t1")).unwrap();
        let name = RecordName::new("c-1", TableName::Conversation);

        assert!(db.metadata_get("Other", "me", &name).unwrap().is_none());
        assert!(!db.metadata_remove("Chats", "you", &name).unwrap());
        assert!(db.metadata_remove("Chats", "me", &name).unwrap());
        assert!(db.metadata_get("Chats", "me", &name).unwrap().is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let db = Database::open_in_memory().unwrap();
        db.metadata_put(&entry("t1")).unwrap();
        assert_eq!(db.metadata_clear().unwrap(), 1);
        assert!(db.metadata_list().unwrap().is_empty());
    }
}
