//! Core types shared by the store and the sync engine.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Failure count at which an upload queue entry is parked.
pub const MAX_FAIL_COUNT: u32 = 100;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A syncable entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableName {
    /// Chat conversations.
    Conversation,
    /// Messages within a conversation.
    Message,
    /// Files attached to messages.
    Attachment,
    /// Cloud model endpoint configurations.
    CloudModel,
    /// Context server (tool provider) configurations.
    ContextServer,
    /// Long-term memory notes.
    Memory,
}

impl TableName {
    /// Every syncable table, in dependency order.
    pub const ALL: [TableName; 6] = [
        TableName::Conversation,
        TableName::Message,
        TableName::Attachment,
        TableName::CloudModel,
        TableName::ContextServer,
        TableName::Memory,
    ];

    /// The entity kind tag carried on the wire and in the upload queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Conversation => "Conversation",
            TableName::Message => "Message",
            TableName::Attachment => "Attachment",
            TableName::CloudModel => "CloudModel",
            TableName::ContextServer => "ContextServer",
            TableName::Memory => "Memory",
        }
    }

    /// The SQLite table holding rows of this kind.
    pub(crate) fn sql_table(&self) -> &'static str {
        match self {
            TableName::Conversation => "conversations",
            TableName::Message => "messages",
            TableName::Attachment => "attachments",
            TableName::CloudModel => "cloud_models",
            TableName::ContextServer => "context_servers",
            TableName::Memory => "memories",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        TableName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::unknown_table(s))
    }
}

/// Kind of local mutation recorded in the upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row deleted.
    Delete,
}

impl ChangeKind {
    /// Converts to the stored code.
    pub fn to_code(&self) -> i64 {
        match self {
            ChangeKind::Insert => 0,
            ChangeKind::Update => 1,
            ChangeKind::Delete => 2,
        }
    }

    /// Converts from the stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ChangeKind::Insert),
            1 => Some(ChangeKind::Update),
            2 => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Upload state of a queue entry.
///
/// `Failed` is never stored: a transition to it bumps the failure count and
/// folds the entry back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    /// Waiting to be scheduled.
    Pending,
    /// Included in an in-flight batch.
    Uploading,
    /// Upload failed; retried until the failure cap.
    Failed,
    /// Acknowledged by the remote side.
    Finish,
}

impl UploadState {
    /// Converts to the stored code.
    pub fn to_code(&self) -> i64 {
        match self {
            UploadState::Pending => 0,
            UploadState::Uploading => 1,
            UploadState::Failed => 2,
            UploadState::Finish => 3,
        }
    }

    /// Converts from the stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UploadState::Pending),
            1 => Some(UploadState::Uploading),
            2 => Some(UploadState::Failed),
            3 => Some(UploadState::Finish),
            _ => None,
        }
    }
}

/// One row of the upload queue (outbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadQueueEntry {
    /// Monotonically increasing, never reused.
    pub id: i64,
    /// Object id of the mutated row.
    pub object_id: String,
    /// Table of the mutated row.
    pub table: TableName,
    /// Mutation kind.
    pub change_kind: ChangeKind,
    /// Upload state.
    pub state: UploadState,
    /// Number of failed upload attempts.
    pub fail_count: u32,
    /// Append time in milliseconds.
    pub creation: i64,
}

impl UploadQueueEntry {
    /// The record key this entry refers to.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.object_id.clone(), self.table)
    }

    /// Returns true once the entry has hit the failure cap.
    pub fn is_poisoned(&self) -> bool {
        self.fail_count >= MAX_FAIL_COUNT
    }
}

/// Identity of a syncable row: `(object_id, table)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Object id.
    pub object_id: String,
    /// Table.
    pub table: TableName,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(object_id: impl Into<String>, table: TableName) -> Self {
        Self {
            object_id: object_id.into(),
            table,
        }
    }

    /// The remote record name for this key.
    pub fn record_name(&self) -> RecordName {
        RecordName::new(&self.object_id, self.table)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.object_id)
    }
}

/// Remote record name: the object id followed by the table tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordName(String);

impl RecordName {
    /// Builds the record name for `object_id` in `table`.
    pub fn new(object_id: &str, table: TableName) -> Self {
        Self(format!("{object_id}{}", table.as_str()))
    }

    /// Wraps a raw record name received from the backend.
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw record name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the name back into its record key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedRecordName`] if the name does not end
    /// in a table tag or has an empty object id.
    pub fn parse(&self) -> StoreResult<RecordKey> {
        TableName::ALL
            .into_iter()
            .find_map(|table| {
                self.0
                    .strip_suffix(table.as_str())
                    .filter(|id| !id.is_empty())
                    .map(|id| RecordKey::new(id, table))
            })
            .ok_or_else(|| StoreError::MalformedRecordName {
                name: self.0.clone(),
            })
    }
}

impl fmt::Display for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last-known remote state of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncMetadataEntry {
    /// Remote zone.
    pub zone: String,
    /// Zone owner (account identity).
    pub owner: String,
    /// Record name.
    pub record_name: RecordName,
    /// Optimistic-concurrency token from the backend.
    pub change_tag: Option<String>,
    /// `modified` of the record as last observed remotely.
    pub last_modified_ms: i64,
    /// When this entry was written locally.
    pub updated_at: i64,
}

/// A record received from the remote side, ready for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRecord {
    /// Remote record name.
    pub record_name: RecordName,
    /// Server change tag.
    pub change_tag: Option<String>,
    /// Payload envelope bytes.
    pub payload: Vec<u8>,
}
