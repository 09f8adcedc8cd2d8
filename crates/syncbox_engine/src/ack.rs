//! Maps per-record send results to outbox and metadata actions.

use crate::backend::{FailedDelete, FailedSave, RecordFailure, SavedRecord, SendOutcome};
use crate::error::SyncResult;
use crate::scheduler::{release, BatchScheduler};
use crate::store::LocalStore;
use syncbox_codec::AssetStager;
use syncbox_store::{now_millis, RecordKey, RecordName, SyncMetadataEntry, UploadState};
use tracing::{debug, info, warn};

/// What an acknowledgment changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSummary {
    /// Saves confirmed.
    pub saved: usize,
    /// Deletes confirmed, including records already gone remotely.
    pub deleted: usize,
    /// Saves rejected because the server copy changed.
    pub conflicts: usize,
    /// Saves dropped because the record is gone remotely.
    pub gone: usize,
    /// Entries put back for a transient failure.
    pub retried: usize,
    /// Entries counted toward the failure cap.
    pub failed: usize,
    /// The zone must be created again.
    pub zone_missing: bool,
    /// The zone and its contents are gone; everything must be uploaded again.
    pub zone_reset: bool,
}

impl AckSummary {
    /// Returns true if any entry still needs sending.
    pub fn has_failures(&self) -> bool {
        self.retried > 0 || self.failed > 0 || self.conflicts > 0 || self.zone_missing || self.zone_reset
    }
}

/// Borrowed engine state an acknowledgment works on.
pub(crate) struct AckContext<'a, S: ?Sized> {
    pub store: &'a S,
    pub scheduler: &'a mut BatchScheduler,
    pub stager: &'a AssetStager,
    pub zone: &'a str,
    pub owner: &'a str,
}

impl<S: LocalStore + ?Sized> AckContext<'_, S> {
    /// Applies one send outcome.
    pub(crate) fn apply(&mut self, outcome: SendOutcome) -> SyncResult<AckSummary> {
        let mut summary = AckSummary::default();
        for saved in outcome.saved {
            self.saved(saved, &mut summary)?;
        }
        for name in outcome.deleted {
            self.deleted(&name, &mut summary)?;
        }
        for failed in outcome.failed_saves {
            self.failed_save(failed, &mut summary)?;
        }
        for failed in outcome.failed_deletes {
            self.failed_delete(failed, &mut summary)?;
        }
        Ok(summary)
    }

    fn saved(&mut self, saved: SavedRecord, summary: &mut AckSummary) -> SyncResult<()> {
        let Some(key) = parse(&saved.record_name) else {
            return Ok(());
        };
        let queue_id = saved.trace_key.queue_id;
        let intent = self.scheduler.take_matching(&key, queue_id);
        // Without the intent the sent copy is unknown, the local row may be newer.
        let modified = match intent.as_ref().and_then(|i| i.modified) {
            Some(modified) => modified,
            None => self
                .store
                .sync_metadata_get(self.zone, self.owner, &saved.record_name)?
                .map(|m| m.last_modified_ms)
                .unwrap_or_default(),
        };

        self.store.sync_metadata_put(&SyncMetadataEntry {
            zone: self.zone.to_owned(),
            owner: self.owner.to_owned(),
            record_name: saved.record_name,
            change_tag: saved.change_tag,
            last_modified_ms: modified,
            updated_at: now_millis(),
        })?;
        self.store.pending_upload_dequeue_up_to(&key, queue_id)?;
        if let Some(intent) = &intent {
            release(self.stager, intent);
        }
        summary.saved += 1;
        Ok(())
    }

    fn deleted(&mut self, name: &RecordName, summary: &mut AckSummary) -> SyncResult<()> {
        let Some(key) = parse(name) else {
            return Ok(());
        };
        match self.scheduler.take(&key) {
            Some(intent) => self
                .store
                .pending_upload_dequeue_up_to(&key, intent.queue_id)?,
            None => debug!(%key, "delete acknowledged without in-flight intent"),
        }
        self.store
            .sync_metadata_remove(self.zone, self.owner, name)?;
        summary.deleted += 1;
        Ok(())
    }

    fn failed_save(&mut self, failed: FailedSave, summary: &mut AckSummary) -> SyncResult<()> {
        let Some(key) = parse(&failed.record_name) else {
            return Ok(());
        };
        let queue_id = failed.trace_key.queue_id;
        if let Some(intent) = self.scheduler.take_matching(&key, queue_id) {
            release(self.stager, &intent);
        }
        let ids = [queue_id];

        match failed.failure {
            RecordFailure::ServerRecordChanged => {
                summary.conflicts += 1;
                match failed.server_record {
                    Some(server) => {
                        let report =
                            self.store
                                .handle_remote_upsert(self.zone, self.owner, &[server])?;
                        debug!(%key, ?report, "resolved version conflict");
                        self.store
                            .pending_upload_change_state(&ids, UploadState::Pending)?;
                    }
                    None => {
                        warn!(%key, "version conflict without server record");
                        self.store
                            .pending_upload_change_state(&ids, UploadState::Failed)?;
                        summary.failed += 1;
                    }
                }
            }
            RecordFailure::ZoneNotFound => {
                self.store
                    .pending_upload_change_state(&ids, UploadState::Pending)?;
                summary.zone_missing = true;
            }
            failure if failure.is_zone_reset() => {
                self.store
                    .pending_upload_change_state(&ids, UploadState::Pending)?;
                summary.zone_reset = true;
            }
            RecordFailure::UnknownItem => {
                info!(%key, "record gone remotely, dropping queued change");
                self.store
                    .sync_metadata_remove(self.zone, self.owner, &failed.record_name)?;
                self.store.pending_upload_dequeue_up_to(&key, queue_id)?;
                summary.gone += 1;
            }
            failure if failure.is_transient() => {
                debug!(%key, %failure, "transient send failure");
                self.store
                    .pending_upload_change_state(&ids, UploadState::Pending)?;
                summary.retried += 1;
            }
            failure => {
                warn!(%key, %failure, "send failed");
                self.store
                    .pending_upload_change_state(&ids, UploadState::Failed)?;
                summary.failed += 1;
            }
        }
        Ok(())
    }

    fn failed_delete(&mut self, failed: FailedDelete, summary: &mut AckSummary) -> SyncResult<()> {
        let Some(key) = parse(&failed.record_name) else {
            return Ok(());
        };
        let Some(intent) = self.scheduler.take(&key) else {
            debug!(%key, "delete failure without in-flight intent");
            return Ok(());
        };
        let ids = [intent.queue_id];

        match failed.failure {
            RecordFailure::UnknownItem | RecordFailure::ZoneNotFound => {
                self.converged_delete(&key, &failed.record_name, intent.queue_id)?;
                summary.deleted += 1;
            }
            failure if failure.is_zone_reset() => {
                self.converged_delete(&key, &failed.record_name, intent.queue_id)?;
                summary.deleted += 1;
                summary.zone_reset = true;
            }
            failure if failure.is_transient() => {
                self.store
                    .pending_upload_change_state(&ids, UploadState::Pending)?;
                summary.retried += 1;
            }
            failure => {
                warn!(%key, %failure, "delete failed");
                self.store
                    .pending_upload_change_state(&ids, UploadState::Failed)?;
                summary.failed += 1;
            }
        }
        Ok(())
    }

    fn converged_delete(&self, key: &RecordKey, name: &RecordName, queue_id: i64) -> SyncResult<()> {
        self.store.pending_upload_dequeue_up_to(key, queue_id)?;
        self.store.sync_metadata_remove(self.zone, self.owner, name)
    }
}

fn parse(name: &RecordName) -> Option<RecordKey> {
    match name.parse() {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "ignoring acknowledgment");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendLimits, TraceKey};
    use crate::config::SyncConfig;
    use syncbox_codec::EnvelopeOptions;
    use syncbox_store::{Conversation, Database, IncomingRecord, SyncEntity, TableName};

    struct Fixture {
        db: Database,
        stager: AssetStager,
        scheduler: BatchScheduler,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                db: Database::open_in_memory().unwrap(),
                stager: AssetStager::new(dir.path()).unwrap(),
                scheduler: BatchScheduler::new(&SyncConfig::new("dev", "Chats")),
                _dir: dir,
            }
        }

        fn send(&mut self) -> crate::backend::RemoteChangeBatch {
            self.scheduler
                .build(&self.db, &self.stager, BackendLimits::default())
                .unwrap()
                .unwrap()
                .batch
        }

        fn ack(&mut self, outcome: SendOutcome) -> AckSummary {
            AckContext {
                store: &self.db,
                scheduler: &mut self.scheduler,
                stager: &self.stager,
                zone: "Chats",
                owner: crate::config::DEFAULT_OWNER,
            }
            .apply(outcome)
            .unwrap()
        }

        fn meta(&self) -> Option<SyncMetadataEntry> {
            self.db
                .metadata_get("Chats", crate::config::DEFAULT_OWNER, &name())
                .unwrap()
        }
    }

    fn name() -> RecordName {
        RecordName::new("c-1", TableName::Conversation)
    }

    fn conversation(modified: i64, title: &str) -> Conversation {
        Conversation {
            object_id: "c-1".into(),
            modified,
            title: title.into(),
            ..Default::default()
        }
    }

    fn failed(trace_key: TraceKey, failure: RecordFailure) -> SendOutcome {
        SendOutcome {
            failed_saves: vec![FailedSave {
                record_name: name(),
                trace_key,
                failure,
                server_record: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn success_stores_tag_and_dequeues_older_rows() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "a")).unwrap();
        let batch = fx.send();
        // Edited again while the batch was in flight.
        let newer = fx.db.save_local(conversation(2, "b")).unwrap();

        let summary = fx.ack(SendOutcome {
            saved: vec![SavedRecord {
                record_name: name(),
                trace_key: batch.saves[0].trace_key.clone(),
                change_tag: Some("tag-1".into()),
            }],
            ..Default::default()
        });

        assert_eq!(summary.saved, 1);
        let meta = fx.meta().unwrap();
        assert_eq!(meta.change_tag.as_deref(), Some("tag-1"));
        assert_eq!(meta.last_modified_ms, 1);
        let left = fx.db.outbox_entries().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, newer.id);
    }

    #[test]
    fn success_without_intent_keeps_previous_modified() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "a")).unwrap();
        let first = fx.send();
        fx.ack(SendOutcome {
            saved: vec![SavedRecord {
                record_name: name(),
                trace_key: first.saves[0].trace_key.clone(),
                change_tag: Some("tag-1".into()),
            }],
            ..Default::default()
        });

        fx.db.save_local(conversation(2, "b")).unwrap();
        let second = fx.send();
        fx.scheduler.take(&parse(&name()).unwrap());
        fx.db.save_local(conversation(3, "c")).unwrap();

        let summary = fx.ack(SendOutcome {
            saved: vec![SavedRecord {
                record_name: name(),
                trace_key: second.saves[0].trace_key.clone(),
                change_tag: Some("tag-2".into()),
            }],
            ..Default::default()
        });

        assert_eq!(summary.saved, 1);
        let meta = fx.meta().unwrap();
        assert_eq!(meta.change_tag.as_deref(), Some("tag-2"));
        assert_eq!(meta.last_modified_ms, 1);
        assert_eq!(fx.db.outbox_entries().unwrap().len(), 1);
    }

    #[test]
    fn delete_ack_purges_queue_and_metadata() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "a")).unwrap();
        fx.db
            .metadata_put(&SyncMetadataEntry {
                zone: "Chats".into(),
                owner: crate::config::DEFAULT_OWNER.into(),
                record_name: name(),
                change_tag: Some("t".into()),
                last_modified_ms: 1,
                updated_at: 1,
            })
            .unwrap();
        fx.db.delete_local(TableName::Conversation, "c-1").unwrap();
        let batch = fx.send();
        assert_eq!(batch.deletes, vec![name()]);

        fx.ack(SendOutcome {
            deleted: vec![name()],
            ..Default::default()
        });

        assert!(fx.db.outbox_entries().unwrap().is_empty());
        assert!(fx.meta().is_none());
    }

    #[test]
    fn conflict_with_newer_server_copy_overwrites_and_requeues() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();
        let server = SyncEntity::from(conversation(5, "theirs"));

        let mut outcome = failed(batch.saves[0].trace_key.clone(), RecordFailure::ServerRecordChanged);
        outcome.failed_saves[0].server_record = Some(IncomingRecord {
            record_name: name(),
            change_tag: Some("server-tag".into()),
            payload: server.encode(&EnvelopeOptions::default()).unwrap(),
        });
        let summary = fx.ack(outcome);

        assert_eq!(summary.conflicts, 1);
        assert_eq!(fx.meta().unwrap().change_tag.as_deref(), Some("server-tag"));
        assert_eq!(
            fx.db.get_record(TableName::Conversation, "c-1").unwrap(),
            Some(server)
        );
        let entry = &fx.db.outbox_entries().unwrap()[0];
        assert_eq!(entry.state, UploadState::Pending);
    }

    #[test]
    fn conflict_without_server_copy_counts_failure() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();

        let summary = fx.ack(failed(
            batch.saves[0].trace_key.clone(),
            RecordFailure::ServerRecordChanged,
        ));
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.db.outbox_entries().unwrap()[0].fail_count, 1);
    }

    #[test]
    fn transient_failure_requeues_without_counting() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();

        let summary = fx.ack(failed(batch.saves[0].trace_key.clone(), RecordFailure::ZoneBusy));
        assert_eq!(summary.retried, 1);
        assert_eq!(fx.scheduler.in_flight(), 0);
        let entry = &fx.db.outbox_entries().unwrap()[0];
        assert_eq!(entry.state, UploadState::Pending);
        assert_eq!(entry.fail_count, 0);
    }

    #[test]
    fn unknown_item_drops_entry_and_metadata() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();

        let summary = fx.ack(failed(batch.saves[0].trace_key.clone(), RecordFailure::UnknownItem));
        assert_eq!(summary.gone, 1);
        assert!(fx.db.outbox_entries().unwrap().is_empty());
        assert!(fx.meta().is_none());
    }

    #[test]
    fn zone_failures_are_flagged() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();
        let summary = fx.ack(failed(batch.saves[0].trace_key.clone(), RecordFailure::ZoneNotFound));
        assert!(summary.zone_missing);
        assert!(summary.has_failures());

        let batch = fx.send();
        let summary = fx.ack(failed(
            batch.saves[0].trace_key.clone(),
            RecordFailure::EncryptedDataReset,
        ));
        assert!(summary.zone_reset);
        assert_eq!(fx.db.outbox_entries().unwrap()[0].state, UploadState::Pending);
    }

    #[test]
    fn other_failure_counts_toward_cap() {
        let mut fx = Fixture::new();
        fx.db.save_local(conversation(1, "mine")).unwrap();
        let batch = fx.send();

        let summary = fx.ack(failed(
            batch.saves[0].trace_key.clone(),
            RecordFailure::Other("quota exceeded".into()),
        ));
        assert_eq!(summary.failed, 1);
        let entry = &fx.db.outbox_entries().unwrap()[0];
        assert_eq!((entry.state, entry.fail_count), (UploadState::Pending, 1));
    }
}
