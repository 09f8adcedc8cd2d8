//! Remote backend contract.
//!
//! A backend stores records in named zones, hands out change tags for
//! optimistic concurrency, and serves an incremental change feed resumed
//! from an opaque [`SessionToken`]. Results are reported through the
//! [`EventSink`] passed to each call, never by calling back into the
//! engine.

use crate::error::{SyncError, SyncResult};
use crate::event::EventSink;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use syncbox_codec::Payload;
use syncbox_store::{IncomingRecord, RecordName, SessionToken};
use thiserror::Error;

/// Why the backend rejected one record (or a whole request).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordFailure {
    /// The server copy changed since the change tag we sent.
    #[error("server record changed")]
    ServerRecordChanged,
    /// The zone does not exist.
    #[error("zone not found")]
    ZoneNotFound,
    /// The user deleted the zone from another device or the web.
    #[error("user deleted zone")]
    UserDeletedZone,
    /// The backend reset its encryption keys; zone contents are lost.
    #[error("encrypted data reset")]
    EncryptedDataReset,
    /// The record no longer exists remotely.
    #[error("unknown item")]
    UnknownItem,
    /// The request did not reach the server.
    #[error("network failure")]
    NetworkFailure,
    /// No network connection.
    #[error("network unavailable")]
    NetworkUnavailable,
    /// The service is temporarily down.
    #[error("service unavailable")]
    ServiceUnavailable,
    /// Too many requests.
    #[error("request rate limited")]
    RequestRateLimited,
    /// Another writer holds the zone.
    #[error("zone busy")]
    ZoneBusy,
    /// The account is signed out or its credentials expired.
    #[error("not authenticated")]
    NotAuthenticated,
    /// The operation was cancelled.
    #[error("operation cancelled")]
    OperationCancelled,
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl RecordFailure {
    /// Returns true for failures that go away on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecordFailure::NetworkFailure
                | RecordFailure::NetworkUnavailable
                | RecordFailure::ServiceUnavailable
                | RecordFailure::RequestRateLimited
                | RecordFailure::ZoneBusy
                | RecordFailure::NotAuthenticated
                | RecordFailure::OperationCancelled
        )
    }

    /// Returns true if the zone is gone along with its contents.
    pub fn is_zone_reset(&self) -> bool {
        matches!(
            self,
            RecordFailure::UserDeletedZone | RecordFailure::EncryptedDataReset
        )
    }
}

/// Per-request limits imposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    /// Maximum saves plus deletes in one batch.
    pub max_batch_records: usize,
    /// Maximum total payload bytes in one batch.
    pub max_batch_bytes: u64,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_batch_records: 400,
            max_batch_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Ties an outgoing save to the exact outbox row that produced it.
///
/// Rendered on the wire as `{queue_id}#{object_id}#{device_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceKey {
    /// Outbox entry id.
    pub queue_id: i64,
    /// Object id of the record.
    pub object_id: String,
    /// Device that queued the change.
    pub device_id: String,
}

impl fmt::Display for TraceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.queue_id, self.object_id, self.device_id)
    }
}

impl FromStr for TraceKey {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let malformed = || SyncError::remote(RecordFailure::Other(format!("malformed trace key: {s}")));
        let (queue_id, rest) = s.split_once('#').ok_or_else(malformed)?;
        let (object_id, device_id) = rest.rsplit_once('#').ok_or_else(malformed)?;
        Ok(Self {
            queue_id: queue_id.parse().map_err(|_| malformed())?,
            object_id: object_id.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

/// One record to save remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveIntent {
    /// Remote record name.
    pub record_name: RecordName,
    /// Last known change tag, `None` for records never seen remotely.
    pub change_tag: Option<String>,
    /// Acknowledgment trace key.
    pub trace_key: TraceKey,
    /// Encoded entity.
    pub payload: Payload,
}

/// Saves and deletes sent to one zone in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChangeBatch {
    /// Target zone.
    pub zone: String,
    /// Records to save.
    pub saves: Vec<SaveIntent>,
    /// Records to delete.
    pub deletes: Vec<RecordName>,
}

impl RemoteChangeBatch {
    /// Creates an empty batch for `zone`.
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            saves: Vec::new(),
            deletes: Vec::new(),
        }
    }

    /// Number of saves plus deletes.
    pub fn len(&self) -> usize {
        self.saves.len() + self.deletes.len()
    }

    /// Returns true if the batch carries nothing.
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }

    /// Total payload bytes.
    pub fn payload_bytes(&self) -> u64 {
        self.saves.iter().map(|s| s.payload.len()).sum()
    }
}

/// A save the backend accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
    /// Remote record name.
    pub record_name: RecordName,
    /// Trace key of the intent.
    pub trace_key: TraceKey,
    /// New server change tag.
    pub change_tag: Option<String>,
}

/// A save the backend rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSave {
    /// Remote record name.
    pub record_name: RecordName,
    /// Trace key of the intent.
    pub trace_key: TraceKey,
    /// Failure class.
    pub failure: RecordFailure,
    /// Current server copy, on [`RecordFailure::ServerRecordChanged`].
    pub server_record: Option<IncomingRecord>,
}

/// A delete the backend rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelete {
    /// Remote record name.
    pub record_name: RecordName,
    /// Failure class.
    pub failure: RecordFailure,
}

/// Per-record results of one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Accepted saves.
    pub saved: Vec<SavedRecord>,
    /// Accepted deletes.
    pub deleted: Vec<RecordName>,
    /// Rejected saves.
    pub failed_saves: Vec<FailedSave>,
    /// Rejected deletes.
    pub failed_deletes: Vec<FailedDelete>,
}

impl SendOutcome {
    /// Returns true if any record was accepted.
    pub fn made_progress(&self) -> bool {
        !self.saved.is_empty() || !self.deleted.is_empty()
    }
}

/// Modifications and deletions from one page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    /// Records created or modified remotely.
    pub modifications: Vec<IncomingRecord>,
    /// Records deleted remotely.
    pub deletions: Vec<RecordName>,
}

impl RemoteChanges {
    /// Returns true if the page is empty.
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.deletions.is_empty()
    }
}

/// A remote record store.
///
/// `fetch_changes` reports pages through [`SyncEvent::FetchedChanges`]
/// followed by [`SyncEvent::StateUpdated`]; `send_changes` reports
/// [`SyncEvent::SentChanges`]. Returning an error means the request failed
/// as a whole.
///
/// [`SyncEvent::FetchedChanges`]: crate::SyncEvent::FetchedChanges
/// [`SyncEvent::StateUpdated`]: crate::SyncEvent::StateUpdated
/// [`SyncEvent::SentChanges`]: crate::SyncEvent::SentChanges
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Batch limits.
    fn limits(&self) -> BackendLimits {
        BackendLimits::default()
    }

    /// Creates `zone` if it does not exist.
    async fn create_zone(&self, zone: &str) -> SyncResult<()>;

    /// Deletes `zone` and everything in it.
    async fn delete_zone(&self, zone: &str) -> SyncResult<()>;

    /// Fetches changes to `zone` since `token`.
    async fn fetch_changes(
        &self,
        zone: &str,
        token: Option<SessionToken>,
        sink: &EventSink,
    ) -> SyncResult<()>;

    /// Sends one batch.
    async fn send_changes(&self, batch: RemoteChangeBatch, sink: &EventSink) -> SyncResult<()>;
}
