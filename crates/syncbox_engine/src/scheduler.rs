//! Builds remote change batches from the outbox.

use crate::backend::{BackendLimits, RemoteChangeBatch, SaveIntent, TraceKey};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::store::LocalStore;
use std::collections::HashMap;
use syncbox_codec::{AssetStager, EnvelopeOptions, Payload, StagedAsset};
use syncbox_store::{ChangeKind, RecordKey, UploadState};
use tracing::{debug, warn};

/// An outbox entry included in an in-flight batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIntent {
    /// Outbox entry id.
    pub queue_id: i64,
    /// Change kind.
    pub kind: ChangeKind,
    /// `modified` of the entity as sent; `None` for deletes.
    pub modified: Option<i64>,
    /// Staged payload file to release on acknowledgment.
    pub staged: Option<StagedAsset>,
}

/// A batch ready to send.
#[derive(Debug)]
pub struct BuiltBatch {
    /// The batch.
    pub batch: RemoteChangeBatch,
    /// True if more entries were pending than fit.
    pub has_more: bool,
}

/// Turns pending outbox entries into bounded batches and tracks what is in
/// flight, one intent per record key.
#[derive(Debug)]
pub struct BatchScheduler {
    device_id: String,
    zone: String,
    owner: String,
    batch_size: usize,
    inline_ceiling: usize,
    envelope: EnvelopeOptions,
    intents: HashMap<RecordKey, PendingIntent>,
}

impl BatchScheduler {
    /// Creates a scheduler for `config`.
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            zone: config.zone.clone(),
            owner: config.owner.clone(),
            batch_size: config.batch_size,
            inline_ceiling: config.inline_ceiling,
            envelope: config.envelope_options(),
            intents: HashMap::new(),
        }
    }

    /// Builds the next batch, or `None` if nothing is schedulable.
    ///
    /// Included entries move to `Uploading`. Intents whose outbox row has
    /// disappeared are dropped first, and an intent superseded by a newer
    /// entry for the same key is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; no entry changes state then.
    pub fn build<S: LocalStore + ?Sized>(
        &mut self,
        store: &S,
        stager: &AssetStager,
        limits: BackendLimits,
    ) -> SyncResult<Option<BuiltBatch>> {
        let tables = store.enabled_tables()?;
        if tables.is_empty() {
            return Ok(None);
        }
        self.drop_stale(store, stager)?;

        let entries = store.pending_upload_list(&tables, self.batch_size)?;
        let mut has_more = entries.len() >= self.batch_size;
        let mut batch = RemoteChangeBatch::new(self.zone.clone());
        let mut fresh: Vec<(RecordKey, PendingIntent)> = Vec::new();
        let mut bytes = 0u64;

        let built = (|| -> SyncResult<()> {
            for entry in entries {
                if batch.len() >= limits.max_batch_records {
                    has_more = true;
                    break;
                }
                let key = entry.key();
                if let Some(old) = self.intents.remove(&key) {
                    debug!(%key, old = old.queue_id, new = entry.id, "superseded in-flight intent");
                    release(stager, &old);
                }

                if entry.change_kind == ChangeKind::Delete {
                    batch.deletes.push(key.record_name());
                    fresh.push((
                        key,
                        PendingIntent {
                            queue_id: entry.id,
                            kind: ChangeKind::Delete,
                            modified: None,
                            staged: None,
                        },
                    ));
                    continue;
                }

                let Some(entity) = store.record(&key)? else {
                    debug!(%key, id = entry.id, "row no longer exists, dropping entry");
                    store.pending_upload_dequeue_up_to(&key, entry.id)?;
                    continue;
                };
                let encoded = match entity.encode(&self.envelope) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(%key, error = %e, "failed to encode entity");
                        store.pending_upload_change_state(&[entry.id], UploadState::Failed)?;
                        continue;
                    }
                };
                let len = encoded.len() as u64;
                if !batch.is_empty() && bytes + len > limits.max_batch_bytes {
                    has_more = true;
                    break;
                }

                let record_name = key.record_name();
                let change_tag = store
                    .sync_metadata_get(&self.zone, &self.owner, &record_name)?
                    .and_then(|m| m.change_tag);
                let payload = Payload::prepare(encoded, self.inline_ceiling, stager)?;
                bytes += len;

                fresh.push((
                    key,
                    PendingIntent {
                        queue_id: entry.id,
                        kind: entry.change_kind,
                        modified: Some(entity.modified()),
                        staged: payload.staged().cloned(),
                    },
                ));
                batch.saves.push(SaveIntent {
                    record_name,
                    change_tag,
                    trace_key: TraceKey {
                        queue_id: entry.id,
                        object_id: entry.object_id,
                        device_id: self.device_id.clone(),
                    },
                    payload,
                });
            }
            if !fresh.is_empty() {
                let ids: Vec<i64> = fresh.iter().map(|(_, intent)| intent.queue_id).collect();
                store.pending_upload_change_state(&ids, UploadState::Uploading)?;
            }
            Ok(())
        })();

        if let Err(e) = built {
            for (_, intent) in &fresh {
                release(stager, intent);
            }
            return Err(e);
        }
        if batch.is_empty() {
            return Ok(None);
        }

        debug!(
            saves = batch.saves.len(),
            deletes = batch.deletes.len(),
            bytes,
            has_more,
            "built batch"
        );
        self.intents.extend(fresh);
        Ok(Some(BuiltBatch { batch, has_more }))
    }

    /// Removes the in-flight intent for `key`.
    pub fn take(&mut self, key: &RecordKey) -> Option<PendingIntent> {
        self.intents.remove(key)
    }

    /// Removes the in-flight intent for `key` if it came from `queue_id`.
    pub fn take_matching(&mut self, key: &RecordKey, queue_id: i64) -> Option<PendingIntent> {
        match self.intents.get(key) {
            Some(intent) if intent.queue_id == queue_id => self.intents.remove(key),
            _ => None,
        }
    }

    /// Removes every in-flight intent.
    pub fn drain(&mut self) -> Vec<(RecordKey, PendingIntent)> {
        self.intents.drain().collect()
    }

    /// Number of in-flight intents.
    pub fn in_flight(&self) -> usize {
        self.intents.len()
    }

    fn drop_stale<S: LocalStore + ?Sized>(
        &mut self,
        store: &S,
        stager: &AssetStager,
    ) -> SyncResult<()> {
        let mut stale = Vec::new();
        for (key, intent) in &self.intents {
            if !store.pending_upload_exists(intent.queue_id)? {
                stale.push(key.clone());
            }
        }
        for key in stale {
            if let Some(intent) = self.intents.remove(&key) {
                debug!(%key, id = intent.queue_id, "dropping intent for pruned entry");
                release(stager, &intent);
            }
        }
        Ok(())
    }
}

/// Deletes the staged file of an intent, if any.
pub(crate) fn release(stager: &AssetStager, intent: &PendingIntent) {
    if let Some(asset) = &intent.staged {
        if let Err(e) = stager.release(asset) {
            warn!(path = %asset.path().display(), error = %e, "failed to release staged asset");
        }
    }
}
