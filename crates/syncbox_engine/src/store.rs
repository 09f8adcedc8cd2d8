//! The local store surface the engine consumes.

use crate::error::SyncResult;
use syncbox_store::{
    Database, IncomingRecord, RecordKey, RecordName, RemoteApplyReport,
    SessionToken, SyncEntity, SyncMetadataEntry, SyncPreferences, TableName, UploadQueueEntry,
    UploadState,
};

/// Local persistence used by the engine.
///
/// Every method is one transaction. [`Database`] is the production
/// implementation.
pub trait LocalStore: Send + Sync + 'static {
    /// Schedulable entries: newest per key, enabled tables only, below the
    /// failure cap, oldest first.
    fn pending_upload_list(
        &self,
        tables: &[TableName],
        batch_size: usize,
    ) -> SyncResult<Vec<UploadQueueEntry>>;

    /// Moves entries to a new state.
    fn pending_upload_change_state(&self, ids: &[i64], state: UploadState) -> SyncResult<()>;

    /// Removes every entry for `key` up to and including `max_id`.
    fn pending_upload_dequeue_up_to(&self, key: &RecordKey, max_id: i64) -> SyncResult<()>;

    /// Returns true if the entry still exists.
    fn pending_upload_exists(&self, id: i64) -> SyncResult<bool>;

    /// Folds entries left in flight back to pending.
    fn pending_upload_reset_in_flight(&self) -> SyncResult<usize>;

    /// Rebuilds the outbox from every stored row.
    fn reinitialize_outbox(&self) -> SyncResult<usize>;

    /// Saves a local edit and queues it.
    fn save_local(&self, entity: SyncEntity) -> SyncResult<UploadQueueEntry>;

    /// Deletes a row locally and queues the deletion.
    fn delete_local(&self, key: &RecordKey) -> SyncResult<Option<UploadQueueEntry>>;

    /// Loads the live entity for a key.
    fn record(&self, key: &RecordKey) -> SyncResult<Option<SyncEntity>>;

    /// Applies remotely modified records with last-writer-wins.
    fn handle_remote_upsert(
        &self,
        zone: &str,
        owner: &str,
        records: &[IncomingRecord],
    ) -> SyncResult<RemoteApplyReport>;

    /// Applies remote deletions.
    fn handle_remote_deleted(
        &self,
        zone: &str,
        owner: &str,
        names: &[RecordName],
    ) -> SyncResult<RemoteApplyReport>;

    /// Looks up sync metadata.
    fn sync_metadata_get(
        &self,
        zone: &str,
        owner: &str,
        name: &RecordName,
    ) -> SyncResult<Option<SyncMetadataEntry>>;

    /// Stores sync metadata.
    fn sync_metadata_put(&self, entry: &SyncMetadataEntry) -> SyncResult<()>;

    /// Removes sync metadata.
    fn sync_metadata_remove(&self, zone: &str, owner: &str, name: &RecordName) -> SyncResult<()>;

    /// Drops all sync metadata.
    fn sync_metadata_clear(&self) -> SyncResult<()>;

    /// Returns true unless `table` is excluded from sync.
    fn is_table_sync_enabled(&self, table: TableName) -> SyncResult<bool>;

    /// Tables included in sync.
    fn enabled_tables(&self) -> SyncResult<Vec<TableName>>;

    /// Includes or excludes a table.
    fn set_table_enabled(&self, table: TableName, enabled: bool) -> SyncResult<()>;

    /// Loads persisted sync state.
    fn load_preferences(&self) -> SyncResult<SyncPreferences>;

    /// Sets the global sync switch.
    fn set_sync_enabled(&self, enabled: bool) -> SyncResult<()>;

    /// Stores or clears the session token.
    fn set_session_token(&self, token: Option<&SessionToken>) -> SyncResult<()>;

    /// Records a sync that ended without failures.
    fn set_last_sync_at(&self, at_ms: i64) -> SyncResult<()>;

    /// Wipes synced rows, metadata, the outbox and the session token.
    fn wipe_synced_data(&self) -> SyncResult<()>;
}

impl LocalStore for Database {
    fn pending_upload_list(
        &self,
        tables: &[TableName],
        batch_size: usize,
    ) -> SyncResult<Vec<UploadQueueEntry>> {
        Ok(self.list_pending(tables, batch_size)?)
    }

    fn pending_upload_change_state(&self, ids: &[i64], state: UploadState) -> SyncResult<()> {
        self.change_state(ids, state)?;
        Ok(())
    }

    fn pending_upload_dequeue_up_to(&self, key: &RecordKey, max_id: i64) -> SyncResult<()> {
        self.dequeue_up_to(key, max_id)?;
        Ok(())
    }

    fn pending_upload_exists(&self, id: i64) -> SyncResult<bool> {
        Ok(self.queue_entry(id)?.is_some())
    }

    fn pending_upload_reset_in_flight(&self) -> SyncResult<usize> {
        Ok(self.reset_uploading()?)
    }

    fn reinitialize_outbox(&self) -> SyncResult<usize> {
        Ok(Database::reinitialize_outbox(self)?)
    }

    fn save_local(&self, entity: SyncEntity) -> SyncResult<UploadQueueEntry> {
        Ok(Database::save_local(self, entity)?)
    }

    fn delete_local(&self, key: &RecordKey) -> SyncResult<Option<UploadQueueEntry>> {
        Ok(Database::delete_local(self, key.table, &key.object_id)?)
    }

    fn record(&self, key: &RecordKey) -> SyncResult<Option<SyncEntity>> {
        Ok(self.get_record(key.table, &key.object_id)?)
    }

    fn handle_remote_upsert(
        &self,
        zone: &str,
        owner: &str,
        records: &[IncomingRecord],
    ) -> SyncResult<RemoteApplyReport> {
        Ok(Database::handle_remote_upsert(self, zone, owner, records)?)
    }

    fn handle_remote_deleted(
        &self,
        zone: &str,
        owner: &str,
        names: &[RecordName],
    ) -> SyncResult<RemoteApplyReport> {
        Ok(Database::handle_remote_deleted(self, zone, owner, names)?)
    }

    fn sync_metadata_get(
        &self,
        zone: &str,
        owner: &str,
        name: &RecordName,
    ) -> SyncResult<Option<SyncMetadataEntry>> {
        Ok(self.metadata_get(zone, owner, name)?)
    }

    fn sync_metadata_put(&self, entry: &SyncMetadataEntry) -> SyncResult<()> {
        Ok(self.metadata_put(entry)?)
    }

    fn sync_metadata_remove(&self, zone: &str, owner: &str, name: &RecordName) -> SyncResult<()> {
        self.metadata_remove(zone, owner, name)?;
        Ok(())
    }

    fn sync_metadata_clear(&self) -> SyncResult<()> {
        self.metadata_clear()?;
        Ok(())
    }

    fn is_table_sync_enabled(&self, table: TableName) -> SyncResult<bool> {
        Ok(Database::is_table_sync_enabled(self, table)?)
    }

    fn enabled_tables(&self) -> SyncResult<Vec<TableName>> {
        Ok(Database::enabled_tables(self)?)
    }

    fn set_table_enabled(&self, table: TableName, enabled: bool) -> SyncResult<()> {
        Ok(Database::set_table_enabled(self, table, enabled)?)
    }

    fn load_preferences(&self) -> SyncResult<SyncPreferences> {
        Ok(Database::load_preferences(self)?)
    }

    fn set_sync_enabled(&self, enabled: bool) -> SyncResult<()> {
        Ok(Database::set_sync_enabled(self, enabled)?)
    }

    fn set_session_token(&self, token: Option<&SessionToken>) -> SyncResult<()> {
        Ok(Database::set_session_token(self, token)?)
    }

    fn set_last_sync_at(&self, at_ms: i64) -> SyncResult<()> {
        Ok(Database::set_last_sync_at(self, at_ms)?)
    }

    fn wipe_synced_data(&self) -> SyncResult<()> {
        Ok(Database::wipe_synced_data(self)?)
    }
}
