//! # syncbox Store
//!
//! The local side of syncbox: a SQLite database holding
//!
//! - syncable rows, one table per entity kind, bodies stored as payload
//!   envelopes
//! - the upload queue (outbox) of pending local mutations
//! - sync metadata, the last-known remote state of each record
//! - persisted sync state (global switch, session token, last sync time,
//!   per-table scope)
//!
//! Local writes append their outbox entry in the same transaction as the
//! row change. Remote changes are applied with last-writer-wins through
//! [`Database::handle_remote_upsert`] and [`Database::handle_remote_deleted`].
//!
//! ```
//! use syncbox_store::{Conversation, Database, TableName};
//!
//! let db = Database::open_in_memory().unwrap();
//! db.save_local(Conversation {
//!     object_id: "c-1".into(),
//!     title: "Groceries".into(),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let pending = db.list_pending(&TableName::ALL, 100).unwrap();
//! assert_eq!(pending.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod database;
mod entity;
mod error;
mod metadata;
mod outbox;
mod prefs;
mod types;

pub use conflict::{resolve, RemoteApplyReport, Resolution};
pub use database::Database;
pub use entity::{
    Attachment, CloudModel, ContextServer, Conversation, MemoryNote, Message, SyncEntity,
    SyncableRecord,
};
pub use error::{StoreError, StoreResult};
pub use outbox::OutboxStats;
pub use prefs::{SessionToken, SyncPreferences};
pub use types::{
    now_millis, ChangeKind, IncomingRecord, RecordKey, RecordName, SyncMetadataEntry, TableName,
    UploadQueueEntry, UploadState, MAX_FAIL_COUNT,
};
