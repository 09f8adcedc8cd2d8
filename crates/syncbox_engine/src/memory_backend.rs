//! In-memory backend.
//!
//! [`MemoryServer`] plays the remote record store: zones of records with
//! server-assigned change tags, a change feed keyed by a sequence number,
//! and hooks to inject failures and account events. Several engines can
//! share one server through their own [`MemoryBackend`].

use crate::backend::{
    BackendLimits, FailedDelete, FailedSave, RecordFailure, RemoteBackend, RemoteChangeBatch,
    RemoteChanges, SavedRecord, SendOutcome,
};
use crate::error::SyncResult;
use crate::event::{EventSink, SyncEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use syncbox_store::{IncomingRecord, RecordName, SessionToken};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    change_tag: String,
    payload: Vec<u8>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Zone {
    records: BTreeMap<RecordName, StoredRecord>,
    deletions: Vec<(u64, RecordName)>,
}

#[derive(Debug, Default)]
struct ServerState {
    zones: HashMap<String, Zone>,
    seq: u64,
    record_failures: HashMap<RecordName, RecordFailure>,
    request_failures: VecDeque<RecordFailure>,
    pending_events: Vec<SyncEvent>,
    sent: Vec<SentBatch>,
    fetches: usize,
}

impl ServerState {
    fn next_tag(&mut self) -> (u64, String) {
        self.seq += 1;
        (self.seq, format!("tag-{}", self.seq))
    }
}

/// Names in one batch received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBatch {
    /// Saved record names, in batch order.
    pub saves: Vec<RecordName>,
    /// Deleted record names, in batch order.
    pub deletes: Vec<RecordName>,
}

/// Shared in-memory remote store.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Creates an empty server with no zones.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend talking to this server with default limits.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            server: self.clone(),
            limits: BackendLimits::default(),
        }
    }

    /// Returns true if `zone` exists.
    pub fn zone_exists(&self, zone: &str) -> bool {
        self.inner.lock().zones.contains_key(zone)
    }

    /// Removes a zone without notifying anyone.
    pub fn drop_zone(&self, zone: &str) -> bool {
        self.inner.lock().zones.remove(zone).is_some()
    }

    /// Number of records in `zone`.
    pub fn record_count(&self, zone: &str) -> usize {
        self.inner
            .lock()
            .zones
            .get(zone)
            .map_or(0, |z| z.records.len())
    }

    /// A stored record as a client would receive it.
    pub fn record(&self, zone: &str, name: &RecordName) -> Option<IncomingRecord> {
        let state = self.inner.lock();
        let stored = state.zones.get(zone)?.records.get(name)?;
        Some(IncomingRecord {
            record_name: name.clone(),
            change_tag: Some(stored.change_tag.clone()),
            payload: stored.payload.clone(),
        })
    }

    /// Writes a record directly, as another client would. Creates the zone
    /// if needed and returns the new change tag.
    pub fn put_record(&self, zone: &str, name: RecordName, payload: Vec<u8>) -> String {
        let mut state = self.inner.lock();
        let (seq, change_tag) = state.next_tag();
        state.zones.entry(zone.to_string()).or_default().records.insert(
            name,
            StoredRecord {
                change_tag: change_tag.clone(),
                payload,
                seq,
            },
        );
        change_tag
    }

    /// Deletes a record directly, as another client would.
    pub fn delete_record(&self, zone: &str, name: &RecordName) -> bool {
        let mut state = self.inner.lock();
        state.seq += 1;
        let seq = state.seq;
        let Some(z) = state.zones.get_mut(zone) else {
            return false;
        };
        let removed = z.records.remove(name).is_some();
        if removed {
            z.deletions.push((seq, name.clone()));
        }
        removed
    }

    /// Fails the next save or delete of `name` with `failure`.
    pub fn fail_record(&self, name: RecordName, failure: RecordFailure) {
        self.inner.lock().record_failures.insert(name, failure);
    }

    /// Fails the next fetch or send request as a whole.
    pub fn fail_next_request(&self, failure: RecordFailure) {
        self.inner.lock().request_failures.push_back(failure);
    }

    /// Queues an event delivered at the start of the next fetch.
    pub fn push_event(&self, event: SyncEvent) {
        self.inner.lock().pending_events.push(event);
    }

    /// Every batch received so far.
    pub fn sent_batches(&self) -> Vec<SentBatch> {
        self.inner.lock().sent.clone()
    }

    /// Number of fetch requests received.
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetches
    }

    fn apply_batch(&self, batch: RemoteChangeBatch) -> SyncResult<SendOutcome> {
        let mut guard = self.inner.lock();
        if let Some(failure) = guard.request_failures.pop_front() {
            return Err(failure.into());
        }
        guard.sent.push(SentBatch {
            saves: batch.saves.iter().map(|s| s.record_name.clone()).collect(),
            deletes: batch.deletes.clone(),
        });

        let mut outcome = SendOutcome::default();
        if !guard.zones.contains_key(&batch.zone) {
            for save in batch.saves {
                outcome.failed_saves.push(FailedSave {
                    record_name: save.record_name,
                    trace_key: save.trace_key,
                    failure: RecordFailure::ZoneNotFound,
                    server_record: None,
                });
            }
            for record_name in batch.deletes {
                outcome.failed_deletes.push(FailedDelete {
                    record_name,
                    failure: RecordFailure::ZoneNotFound,
                });
            }
            return Ok(outcome);
        }

        let state = &mut *guard;
        for save in batch.saves {
            if let Some(failure) = state.record_failures.remove(&save.record_name) {
                outcome.failed_saves.push(FailedSave {
                    record_name: save.record_name,
                    trace_key: save.trace_key,
                    failure,
                    server_record: None,
                });
                continue;
            }
            let payload = save.payload.read()?;
            let current = state
                .zones
                .get(&batch.zone)
                .and_then(|z| z.records.get(&save.record_name))
                .map(|r| (r.change_tag.clone(), r.payload.clone()));
            match (current, save.change_tag.as_deref()) {
                (Some((change_tag, payload)), tag) if tag != Some(change_tag.as_str()) => {
                    outcome.failed_saves.push(FailedSave {
                        server_record: Some(IncomingRecord {
                            record_name: save.record_name.clone(),
                            change_tag: Some(change_tag),
                            payload,
                        }),
                        record_name: save.record_name,
                        trace_key: save.trace_key,
                        failure: RecordFailure::ServerRecordChanged,
                    });
                }
                (None, Some(_)) => {
                    outcome.failed_saves.push(FailedSave {
                        record_name: save.record_name,
                        trace_key: save.trace_key,
                        failure: RecordFailure::UnknownItem,
                        server_record: None,
                    });
                }
                _ => {
                    state.seq += 1;
                    let seq = state.seq;
                    let change_tag = format!("tag-{seq}");
                    if let Some(zone) = state.zones.get_mut(&batch.zone) {
                        zone.records.insert(
                            save.record_name.clone(),
                            StoredRecord {
                                change_tag: change_tag.clone(),
                                payload,
                                seq,
                            },
                        );
                    }
                    outcome.saved.push(SavedRecord {
                        record_name: save.record_name,
                        trace_key: save.trace_key,
                        change_tag: Some(change_tag),
                    });
                }
            }
        }

        for record_name in batch.deletes {
            if let Some(failure) = state.record_failures.remove(&record_name) {
                outcome.failed_deletes.push(FailedDelete {
                    record_name,
                    failure,
                });
                continue;
            }
            state.seq += 1;
            let seq = state.seq;
            if let Some(zone) = state.zones.get_mut(&batch.zone) {
                if zone.records.remove(&record_name).is_some() {
                    zone.deletions.push((seq, record_name.clone()));
                }
            }
            outcome.deleted.push(record_name);
        }
        Ok(outcome)
    }

    fn changes_since(
        &self,
        zone: &str,
        token: Option<&SessionToken>,
    ) -> (Vec<SyncEvent>, SyncResult<(RemoteChanges, u64)>) {
        let mut state = self.inner.lock();
        state.fetches += 1;
        let events = std::mem::take(&mut state.pending_events);
        if let Some(failure) = state.request_failures.pop_front() {
            return (events, Err(failure.into()));
        }
        let Some(z) = state.zones.get(zone) else {
            return (events, Err(RecordFailure::ZoneNotFound.into()));
        };

        let since = token.map_or(0, decode_token);
        let modifications = z
            .records
            .iter()
            .filter(|(_, r)| r.seq > since)
            .map(|(name, r)| IncomingRecord {
                record_name: name.clone(),
                change_tag: Some(r.change_tag.clone()),
                payload: r.payload.clone(),
            })
            .collect();
        let deletions = z
            .deletions
            .iter()
            .filter(|(seq, name)| *seq > since && !z.records.contains_key(name))
            .map(|(_, name)| name.clone())
            .collect();
        let changes = RemoteChanges {
            modifications,
            deletions,
        };
        (events, Ok((changes, state.seq)))
    }
}

/// Malformed tokens restart the feed from the beginning.
fn decode_token(token: &SessionToken) -> u64 {
    <[u8; 8]>::try_from(token.as_bytes()).map_or(0, u64::from_be_bytes)
}

/// [`RemoteBackend`] over a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    server: MemoryServer,
    limits: BackendLimits,
}

impl MemoryBackend {
    /// Overrides the batch limits.
    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The server behind this backend.
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn limits(&self) -> BackendLimits {
        self.limits
    }

    async fn create_zone(&self, zone: &str) -> SyncResult<()> {
        self.server
            .inner
            .lock()
            .zones
            .entry(zone.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_zone(&self, zone: &str) -> SyncResult<()> {
        if self.server.drop_zone(zone) {
            Ok(())
        } else {
            Err(RecordFailure::ZoneNotFound.into())
        }
    }

    async fn fetch_changes(
        &self,
        zone: &str,
        token: Option<SessionToken>,
        sink: &EventSink,
    ) -> SyncResult<()> {
        let (events, result) = self.server.changes_since(zone, token.as_ref());
        for event in events {
            sink.emit(event);
        }
        let (changes, seq) = result?;
        debug!(
            zone,
            modified = changes.modifications.len(),
            deleted = changes.deletions.len(),
            "memory fetch"
        );
        if !changes.is_empty() {
            sink.emit(SyncEvent::FetchedChanges(changes));
        }
        sink.emit(SyncEvent::StateUpdated(SessionToken::new(seq.to_be_bytes())));
        Ok(())
    }

    async fn send_changes(&self, batch: RemoteChangeBatch, sink: &EventSink) -> SyncResult<()> {
        let outcome = self.server.apply_batch(batch)?;
        sink.emit(SyncEvent::SentChanges(outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_decoding_tolerates_garbage() {
        assert_eq!(decode_token(&SessionToken::new(7u64.to_be_bytes())), 7);
        assert_eq!(decode_token(&SessionToken::new(vec![1, 2, 3])), 0);
    }

    #[test]
    fn direct_writes_bump_tags() {
        let server = MemoryServer::new();
        let name = RecordName::from_raw("Conversation_a");
        let first = server.put_record("zone", name.clone(), vec![1]);
        let second = server.put_record("zone", name.clone(), vec![2]);
        assert_ne!(first, second);
        let record = server.record("zone", &name).unwrap();
        assert_eq!(record.change_tag.as_deref(), Some(second.as_str()));
        assert_eq!(record.payload, vec![2]);
        assert!(server.delete_record("zone", &name));
        assert_eq!(server.record_count("zone"), 0);
    }
}
