//! End-to-end tests for the sync engine against the in-memory backend.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use syncbox_codec::EnvelopeOptions;
use syncbox_engine::{
    AccountChange, EventSink, MemoryBackend, MemoryServer, RecordFailure, RemoteBackend,
    RemoteChangeBatch, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncHandle, SyncResult,
    SyncStatus, ZoneDeletionReason, DEFAULT_OWNER,
};
use syncbox_store::{
    Attachment, ChangeKind, Conversation, Database, RecordName, SessionToken, SyncEntity,
    TableName, UploadState,
};
use tempfile::TempDir;
use tokio::sync::Notify;

const ZONE: &str = "syncbox";

struct Device {
    db: Arc<Database>,
    handle: SyncHandle,
    staging: TempDir,
}

fn device_with<B: RemoteBackend>(name: &str, backend: B) -> Device {
    let staging = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let config = SyncConfig::new(name, ZONE).with_staging_dir(staging.path());
    let handle = SyncEngine::spawn(config, Arc::clone(&db), Arc::new(backend)).unwrap();
    Device {
        db,
        handle,
        staging,
    }
}

fn device(server: &MemoryServer, name: &str) -> Device {
    device_with(name, server.backend())
}

fn conversation(id: &str, title: &str, modified: i64) -> Conversation {
    Conversation {
        object_id: id.into(),
        title: title.into(),
        creation: 1,
        modified,
        ..Default::default()
    }
}

fn conversation_name(id: &str) -> RecordName {
    RecordName::new(id, TableName::Conversation)
}

fn title(db: &Database, id: &str) -> Option<String> {
    match db.get_record(TableName::Conversation, id).unwrap()? {
        SyncEntity::Conversation(c) => Some(c.title),
        other => panic!("unexpected entity {other:?}"),
    }
}

#[tokio::test]
async fn send_uploads_and_clears_outbox() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");

    a.handle
        .save(conversation("c-1", "Groceries", 1_000))
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();

    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
    let name = conversation_name("c-1");
    let meta = a.db.metadata_get(ZONE, DEFAULT_OWNER, &name).unwrap().unwrap();
    let remote = server.record(ZONE, &name).unwrap();
    assert_eq!(meta.change_tag, remote.change_tag);
    assert_eq!(meta.last_modified_ms, 1_000);
    assert!(a.db.last_sync_at().unwrap().is_some());

    let stats = a.handle.stats().await.unwrap();
    assert_eq!(stats.records_saved, 1);
    assert_eq!(a.handle.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn concurrent_renames_converge_on_newest() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    let b = device(&server, "device-b");

    b.handle
        .save(conversation("c-1", "from B", 1_000))
        .await
        .unwrap();
    a.handle
        .save(conversation("c-1", "from A", 2_000))
        .await
        .unwrap();

    b.handle.send_changes().await.unwrap();
    // Conflict: A keeps its newer copy and requeues it against B's tag.
    a.handle.send_changes().await.unwrap();
    assert_eq!(a.handle.stats().await.unwrap().conflicts, 1);
    a.handle.send_changes().await.unwrap();
    b.handle.fetch_changes().await.unwrap();

    assert_eq!(title(&a.db, "c-1").as_deref(), Some("from A"));
    assert_eq!(title(&b.db, "c-1").as_deref(), Some("from A"));
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
    assert_eq!(b.db.outbox_stats().unwrap().total, 0);

    let remote = server.record(ZONE, &conversation_name("c-1")).unwrap();
    let decoded = SyncEntity::decode(TableName::Conversation, &remote.payload).unwrap();
    assert_eq!(decoded.modified(), 2_000);
}

#[tokio::test]
async fn older_queued_edit_is_dropped_by_fetched_newer_copy() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    let b = device(&server, "device-b");

    a.handle
        .save(conversation("c-1", "from A", 2_000))
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();

    b.handle
        .save(conversation("c-1", "from B", 1_000))
        .await
        .unwrap();
    b.handle.fetch_changes().await.unwrap();
    assert_eq!(title(&b.db, "c-1").as_deref(), Some("from A"));

    assert_eq!(b.db.outbox_stats().unwrap().total, 0);

    // B's older edit is gone, so there is nothing to send.
    let name = conversation_name("c-1");
    let batches = server.sent_batches().len();
    let tag = server.record(ZONE, &name).unwrap().change_tag;
    b.handle.send_changes().await.unwrap();
    assert_eq!(server.sent_batches().len(), batches);
    assert_eq!(server.record(ZONE, &name).unwrap().change_tag, tag);
    let meta = b.db.metadata_get(ZONE, DEFAULT_OWNER, &name).unwrap().unwrap();
    assert_eq!(meta.change_tag, tag);
    assert_eq!(meta.last_modified_ms, 2_000);
}

#[tokio::test]
async fn local_delete_purges_remote_record_and_metadata() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    let name = conversation_name("c-1");

    a.handle
        .save(conversation("c-1", "Groceries", 1_000))
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();
    assert!(server.record(ZONE, &name).is_some());

    let entry = a
        .handle
        .delete(TableName::Conversation, "c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.change_kind, ChangeKind::Delete);
    a.handle.send_changes().await.unwrap();

    let last = server.sent_batches().pop().unwrap();
    assert_eq!(last.deletes, vec![name.clone()]);
    assert!(last.saves.is_empty());
    assert!(server.record(ZONE, &name).is_none());
    assert!(a.db.metadata_get(ZONE, DEFAULT_OWNER, &name).unwrap().is_none());
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn remote_changes_apply_and_advance_token() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    let b = device(&server, "device-b");

    a.handle
        .save(conversation("c-1", "Groceries", 1_000))
        .await
        .unwrap();
    a.handle.save(conversation("c-2", "Work", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();

    b.handle.fetch_changes().await.unwrap();
    assert_eq!(b.db.record_count(TableName::Conversation).unwrap(), 2);
    assert!(b.db.session_token().unwrap().is_some());
    assert_eq!(b.handle.stats().await.unwrap().remote_applied, 2);

    // Nothing new: the token keeps the second fetch empty.
    b.handle.fetch_changes().await.unwrap();
    assert_eq!(b.handle.stats().await.unwrap().remote_applied, 2);

    a.handle
        .delete(TableName::Conversation, "c-2")
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();
    b.handle.fetch_changes().await.unwrap();
    assert_eq!(b.db.record_count(TableName::Conversation).unwrap(), 1);
    assert_eq!(b.handle.stats().await.unwrap().remote_deleted, 1);
}

#[tokio::test]
async fn direct_remote_write_reaches_local_store() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    let entity = SyncEntity::from(conversation("c-9", "Written elsewhere", 5_000));
    let payload = entity.encode(&EnvelopeOptions::new()).unwrap();
    let tag = server.put_record(ZONE, conversation_name("c-9"), payload);

    a.handle.fetch_changes().await.unwrap();

    assert_eq!(title(&a.db, "c-9").as_deref(), Some("Written elsewhere"));
    let meta = a
        .db
        .metadata_get(ZONE, DEFAULT_OWNER, &conversation_name("c-9"))
        .unwrap()
        .unwrap();
    assert_eq!(meta.change_tag.as_deref(), Some(tag.as_str()));
    // Remote application never queues an upload.
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn failed_apply_keeps_token_and_refetches() {
    let server = MemoryServer::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let db = Arc::new(Database::open(&path).unwrap());
    let config = SyncConfig::new("device-a", ZONE).with_staging_dir(dir.path().join("assets"));
    let handle = SyncEngine::spawn(config, Arc::clone(&db), Arc::new(server.backend())).unwrap();

    db.save_local(conversation("a-bad", "local", 1_000)).unwrap();
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute(
            "UPDATE conversations SET body = x'00' WHERE object_id = 'a-bad'",
            [],
        )
        .unwrap();
    for (id, title) in [("a-bad", "remote"), ("b-good", "remote too")] {
        let entity = SyncEntity::from(conversation(id, title, 5_000));
        server.put_record(
            ZONE,
            conversation_name(id),
            entity.encode(&EnvelopeOptions::new()).unwrap(),
        );
    }

    let err = handle.fetch_changes().await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)), "{err:?}");
    assert!(db.session_token().unwrap().is_none());
    assert!(db.get_record(TableName::Conversation, "b-good").unwrap().is_none());
    assert!(db.last_sync_at().unwrap().is_none());

    // Once the row is readable again the same changes are delivered.
    db.save_local(conversation("a-bad", "repaired", 1_000)).unwrap();
    handle.fetch_changes().await.unwrap();
    assert_eq!(title(&db, "b-good").as_deref(), Some("remote too"));
    assert_eq!(title(&db, "a-bad").as_deref(), Some("remote"));
    assert!(db.session_token().unwrap().is_some());
    handle.shutdown().await;
}

#[tokio::test]
async fn sign_out_wipes_synced_state() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");

    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.save(conversation("c-2", "Two", 1_000)).await.unwrap();
    a.handle.sync_now().await.unwrap();
    a.handle.save(conversation("c-3", "Three", 1_000)).await.unwrap();
    a.handle.fetch_changes().await.unwrap();
    assert!(a.db.session_token().unwrap().is_some());
    assert!(!a.db.metadata_list().unwrap().is_empty());

    a.handle
        .account_changed(AccountChange::SignOut)
        .await
        .unwrap();

    assert_eq!(a.db.record_count(TableName::Conversation).unwrap(), 0);
    assert!(a.db.metadata_list().unwrap().is_empty());
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
    assert!(a.db.session_token().unwrap().is_none());
    // Remote data is untouched.
    assert_eq!(server.record_count(ZONE), 2);
}

#[tokio::test]
async fn sign_in_uploads_everything() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.save(conversation("c-2", "Two", 1_000)).await.unwrap();
    a.handle
        .delete(TableName::Conversation, "c-2")
        .await
        .unwrap();
    a.handle.save(conversation("c-3", "Three", 1_000)).await.unwrap();

    a.handle
        .account_changed(AccountChange::SignIn)
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();

    assert!(server.zone_exists(ZONE));
    assert_eq!(server.record_count(ZONE), 2);
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn purged_zone_event_wipes_and_cancels_fetch() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();

    server.push_event(SyncEvent::ZoneDeleted {
        zone: ZONE.into(),
        reason: ZoneDeletionReason::Purged,
    });
    let result = a.handle.fetch_changes().await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(a.db.record_count(TableName::Conversation).unwrap(), 0);
    assert!(a.db.metadata_list().unwrap().is_empty());
}

#[tokio::test]
async fn encrypted_data_reset_reuploads() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();
    server.drop_zone(ZONE);

    server.push_event(SyncEvent::ZoneDeleted {
        zone: ZONE.into(),
        reason: ZoneDeletionReason::EncryptedDataReset,
    });
    a.handle.fetch_changes().await.unwrap_err();
    a.handle.send_changes().await.unwrap();

    assert_eq!(server.record_count(ZONE), 1);
    assert_eq!(title(&a.db, "c-1").as_deref(), Some("One"));
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn missing_zone_is_recreated() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();

    server.drop_zone(ZONE);
    a.handle.save(conversation("c-2", "Two", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();
    assert_eq!(a.db.outbox_stats().unwrap().pending, 1);

    a.handle.send_changes().await.unwrap();
    assert!(server.zone_exists(ZONE));
    assert!(server.record(ZONE, &conversation_name("c-2")).is_some());
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn transient_request_failure_keeps_entries_pending() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.fetch_changes().await.unwrap();

    server.fail_next_request(RecordFailure::NetworkUnavailable);
    let err = a.handle.send_changes().await.unwrap_err();
    assert!(err.is_retryable());
    let stats = a.db.outbox_stats().unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(a.db.outbox_entries().unwrap()[0].fail_count, 0);
    assert!(a.handle.stats().await.unwrap().last_error.is_some());

    a.handle.send_changes().await.unwrap();
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn permanent_record_failure_counts_toward_cap() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    server.fail_record(
        conversation_name("c-1"),
        RecordFailure::Other("quota exceeded".into()),
    );

    a.handle.send_changes().await.unwrap();
    let entry = a.db.outbox_entries().unwrap().remove(0);
    assert_eq!(entry.fail_count, 1);
    assert_eq!(entry.state, UploadState::Pending);
    assert!(a.db.last_sync_at().unwrap().is_none());

    a.handle.send_changes().await.unwrap();
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn large_attachment_is_staged_and_released() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");

    // xorshift noise so compression cannot shrink it below the ceiling.
    let mut x = 0x2545_f491_4f6c_dd1du64;
    let data: Vec<u8> = (0..50 * 1024)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect();
    a.handle
        .save(Attachment {
            object_id: "att-1".into(),
            message_id: "m-1".into(),
            name: "photo.jpg".into(),
            mime_type: "image/jpeg".into(),
            data: data.clone(),
            creation: 1,
            modified: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();

    let name = RecordName::new("att-1", TableName::Attachment);
    let remote = server.record(ZONE, &name).unwrap();
    match SyncEntity::decode(TableName::Attachment, &remote.payload).unwrap() {
        SyncEntity::Attachment(att) => assert_eq!(att.data, data),
        other => panic!("unexpected entity {other:?}"),
    }
    let leftovers = std::fs::read_dir(a.staging.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn disabled_sync_sends_nothing() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.set_sync_enabled(false).await.unwrap();
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();

    a.handle.send_changes().await.unwrap();
    a.handle.fetch_changes().await.unwrap();
    assert!(server.sent_batches().is_empty());
    assert_eq!(server.fetch_count(), 0);

    a.handle.set_sync_enabled(true).await.unwrap();
    a.handle.send_changes().await.unwrap();
    assert_eq!(server.record_count(ZONE), 1);
}

#[tokio::test]
async fn disabled_table_stays_local() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle
        .set_table_enabled(TableName::Conversation, false)
        .await
        .unwrap();
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();
    assert_eq!(server.record_count(ZONE), 0);
    assert_eq!(a.db.outbox_stats().unwrap().pending, 1);

    a.handle
        .set_table_enabled(TableName::Conversation, true)
        .await
        .unwrap();
    a.handle.send_changes().await.unwrap();
    assert_eq!(server.record_count(ZONE), 1);
}

#[tokio::test]
async fn delete_remote_data_keeps_local_rows() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.sync_now().await.unwrap();

    a.handle.delete_remote_data().await.unwrap();

    assert!(!server.zone_exists(ZONE));
    assert!(a.db.metadata_list().unwrap().is_empty());
    assert!(a.db.session_token().unwrap().is_none());
    assert_eq!(a.db.record_count(TableName::Conversation).unwrap(), 1);
}

#[tokio::test]
async fn reinitialize_outbox_queues_every_row() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();
    a.handle.save(conversation("c-2", "Two", 1_000)).await.unwrap();
    a.handle.send_changes().await.unwrap();

    assert_eq!(a.handle.reinitialize_outbox().await.unwrap(), 2);
    assert_eq!(a.db.outbox_stats().unwrap().pending, 2);
    a.handle.send_changes().await.unwrap();
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

#[tokio::test]
async fn shutdown_stops_handles() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");
    a.handle.shutdown().await;

    let err = a.handle.send_changes().await.unwrap_err();
    assert!(matches!(err, SyncError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn local_edits_are_debounced_into_one_batch() {
    let server = MemoryServer::new();
    let a = device(&server, "device-a");

    for i in 0..3 {
        a.handle
            .save(conversation(&format!("c-{i}"), "Draft", 1_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // The timer restarted with the last save, at t=2s.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.sent_batches().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let batches = server.sent_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].saves.len(), 3);
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}

/// Holds every send until released.
struct GatedBackend {
    inner: MemoryBackend,
    gate: Arc<Notify>,
}

#[async_trait]
impl RemoteBackend for GatedBackend {
    async fn create_zone(&self, zone: &str) -> SyncResult<()> {
        self.inner.create_zone(zone).await
    }

    async fn delete_zone(&self, zone: &str) -> SyncResult<()> {
        self.inner.delete_zone(zone).await
    }

    async fn fetch_changes(
        &self,
        zone: &str,
        token: Option<SessionToken>,
        sink: &EventSink,
    ) -> SyncResult<()> {
        self.inner.fetch_changes(zone, token, sink).await
    }

    async fn send_changes(&self, batch: RemoteChangeBatch, sink: &EventSink) -> SyncResult<()> {
        self.gate.notified().await;
        self.inner.send_changes(batch, sink).await
    }
}

#[tokio::test]
async fn stop_cancels_in_flight_send_and_requeues() {
    let server = MemoryServer::new();
    let gate = Arc::new(Notify::new());
    let a = device_with(
        "device-a",
        GatedBackend {
            inner: server.backend(),
            gate: Arc::clone(&gate),
        },
    );
    a.handle.save(conversation("c-1", "One", 1_000)).await.unwrap();

    let mut status = a.handle.subscribe_status();
    let sender = a.handle.clone();
    let pending = tokio::spawn(async move { sender.send_changes().await });
    while *status.borrow_and_update() != SyncStatus::Synchronizing {
        status.changed().await.unwrap();
    }
    assert_eq!(a.db.outbox_stats().unwrap().uploading, 1);

    a.handle.stop().await.unwrap();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(a.handle.status(), SyncStatus::Idle);
    assert!(server.sent_batches().is_empty());

    // A new session puts the entry back and sends it.
    gate.notify_one();
    a.handle.send_changes().await.unwrap();
    assert_eq!(server.record_count(ZONE), 1);
    assert_eq!(a.db.outbox_stats().unwrap().total, 0);
}
