//! Last-writer-wins resolution of remote changes against local rows.

use crate::database::{self, Database};
use crate::entity::SyncEntity;
use crate::error::StoreResult;
use crate::metadata;
use crate::outbox;
use crate::prefs;
use crate::types::{now_millis, ChangeKind, IncomingRecord, RecordName, SyncMetadataEntry};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Outcome of comparing a remote entity with local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No local row: store the remote entity.
    Insert(SyncEntity),
    /// Both sides agree, or the remote copy is an echo of something this
    /// device has already moved past.
    Noop,
    /// The local row is newer: keep it and push it again.
    KeepLocal,
    /// The remote entity is newer: replace the local row with it.
    Overwrite(SyncEntity),
}

/// Resolves `remote` against the local row by `modified` timestamp.
///
/// `last_seen_remote` is the `modified` recorded in sync metadata; it is
/// the baseline when no local row exists, so a stale echo of a record
/// deleted locally does not bring it back. Local-only fields of the
/// result are taken from `local`.
pub fn resolve(
    local: Option<&SyncEntity>,
    mut remote: SyncEntity,
    last_seen_remote: Option<i64>,
) -> Resolution {
    match local {
        None => match last_seen_remote {
            Some(seen) if seen >= remote.modified() => Resolution::Noop,
            _ => {
                remote.preserve_local_fields(None);
                Resolution::Insert(remote)
            }
        },
        Some(local) => match local.modified().cmp(&remote.modified()) {
            Ordering::Equal => Resolution::Noop,
            Ordering::Greater => Resolution::KeepLocal,
            Ordering::Less => {
                remote.preserve_local_fields(Some(local));
                Resolution::Overwrite(remote)
            }
        },
    }
}

/// Counts from applying a batch of remote changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteApplyReport {
    /// New rows stored.
    pub inserted: usize,
    /// Local rows replaced by newer remote copies. Their queued entries
    /// that were not in flight are dropped.
    pub overwritten: usize,
    /// Records already converged.
    pub unchanged: usize,
    /// Local rows that were newer and got queued again.
    pub kept_local: usize,
    /// Rows deleted.
    pub deleted: usize,
    /// Records skipped: disabled table, bad name or undecodable payload.
    pub skipped: usize,
}

impl Database {
    /// Applies remotely modified records.
    ///
    /// Each record is resolved and written in its own transaction. Records
    /// of sync-disabled tables, with unparseable names, or with payloads
    /// that fail to decode are skipped and logged.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage operation fails. Records applied
    /// before the failure stay applied.
    pub fn handle_remote_upsert(
        &self,
        zone: &str,
        owner: &str,
        records: &[IncomingRecord],
    ) -> StoreResult<RemoteApplyReport> {
        let mut report = RemoteApplyReport::default();
        for record in records {
            let key = match record.record_name.parse() {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "skipping remote record");
                    report.skipped += 1;
                    continue;
                }
            };
            if !self.is_table_sync_enabled(key.table)? {
                debug!(%key, "table sync disabled, skipping remote record");
                report.skipped += 1;
                continue;
            }
            let remote = match SyncEntity::decode(key.table, &record.payload) {
                Ok(entity) if entity.object_id() == key.object_id => entity,
                Ok(entity) => {
                    warn!(%key, found = %entity.object_id(), "record name does not match payload");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "failed to decode remote record");
                    report.skipped += 1;
                    continue;
                }
            };
            let remote_modified = remote.modified();

            self.write(|tx| {
                let local = database::get_row(tx, key.table, &key.object_id)?;
                let known = metadata::get(tx, zone, owner, &record.record_name)?;
                let seen = known.as_ref().map(|m| m.last_modified_ms);
                let meta = SyncMetadataEntry {
                    zone: zone.to_owned(),
                    owner: owner.to_owned(),
                    record_name: record.record_name.clone(),
                    change_tag: record.change_tag.clone(),
                    last_modified_ms: remote_modified.max(seen.unwrap_or(i64::MIN)),
                    updated_at: now_millis(),
                };

                match resolve(local.as_ref(), remote, seen) {
                    Resolution::Insert(entity) => {
                        database::put_row(tx, &entity, self.envelope())?;
                        metadata::put(tx, &meta)?;
                        report.inserted += 1;
                    }
                    Resolution::Overwrite(entity) => {
                        database::put_row(tx, &entity, self.envelope())?;
                        metadata::put(tx, &meta)?;
                        let dropped = outbox::remove_idle_for_key(tx, &key)?;
                        if dropped > 0 {
                            debug!(%key, dropped, "queued local edits lost to newer remote copy");
                        }
                        report.overwritten += 1;
                    }
                    Resolution::KeepLocal => {
                        metadata::put(tx, &meta)?;
                        outbox::append(tx, &[(key.clone(), ChangeKind::Update)])?;
                        debug!(%key, "local copy is newer, queued again");
                        report.kept_local += 1;
                    }
                    Resolution::Noop => {
                        let tag_changed = known
                            .as_ref()
                            .map_or(true, |m| m.change_tag != record.change_tag);
                        if tag_changed {
                            metadata::put(tx, &meta)?;
                        }
                        report.unchanged += 1;
                    }
                }
                Ok(())
            })?;
        }
        Ok(report)
    }

    /// Applies remote deletions: the row, its metadata and any queued
    /// entries for it are removed together.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage operation fails.
    pub fn handle_remote_deleted(
        &self,
        zone: &str,
        owner: &str,
        record_names: &[RecordName],
    ) -> StoreResult<RemoteApplyReport> {
        let mut report = RemoteApplyReport::default();
        for name in record_names {
            let key = match name.parse() {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "skipping remote deletion");
                    report.skipped += 1;
                    continue;
                }
            };
            self.write(|tx| {
                if !prefs::is_table_enabled(tx, key.table)? {
                    report.skipped += 1;
                    return Ok(());
                }
                database::delete_row(tx, key.table, &key.object_id)?;
                metadata::remove(tx, zone, owner, name)?;
                outbox::remove_key(tx, &key)?;
                report.deleted += 1;
                Ok(())
            })?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CloudModel, Conversation};

    fn conversation(modified: i64, title: &str) -> SyncEntity {
        Conversation {
            object_id: "c-1".into(),
            creation: 1,
            modified,
            title: title.into(),
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn missing_local_inserts() {
        let remote = conversation(5, "remote");
        assert_eq!(
            resolve(None, remote.clone(), None),
            Resolution::Insert(remote)
        );
    }

    #[test]
    fn stale_echo_without_local_row_is_ignored() {
        assert_eq!(resolve(None, conversation(5, "old"), Some(7)), Resolution::Noop);
        assert_eq!(resolve(None, conversation(7, "same"), Some(7)), Resolution::Noop);
        assert!(matches!(
            resolve(None, conversation(8, "new"), Some(7)),
            Resolution::Insert(_)
        ));
    }

    #[test]
    fn timestamps_decide() {
        let local = conversation(10, "local");
        assert_eq!(
            resolve(Some(&local), conversation(10, "other"), None),
            Resolution::Noop
        );
        assert_eq!(
            resolve(Some(&local), conversation(9, "older"), None),
            Resolution::KeepLocal
        );
        assert_eq!(
            resolve(Some(&local), conversation(11, "newer"), None),
            Resolution::Overwrite(conversation(11, "newer"))
        );
    }

    #[test]
    fn overwrite_keeps_local_probe_status() {
        let model = |modified, status: &str| {
            SyncEntity::from(CloudModel {
                object_id: "m-1".into(),
                modified,
                display_name: format!("v{modified}"),
                last_probe_status: Some(status.into()),
                ..Default::default()
            })
        };
        let local = model(1, "reachable");
        match resolve(Some(&local), model(2, "timeout"), None) {
            Resolution::Overwrite(SyncEntity::CloudModel(m)) => {
                assert_eq!(m.display_name, "v2");
                assert_eq!(m.last_probe_status.as_deref(), Some("reachable"));
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }
}
