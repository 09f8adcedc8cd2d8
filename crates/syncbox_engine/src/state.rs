//! Engine state and protocol event handlers.
//!
//! Handlers mutate state and the local store, then return [`Effect`]s.
//! They have no access to the backend or the engine's channel, so they
//! cannot start a fetch, a send or a cancellation themselves.

use crate::ack::{AckContext, AckSummary};
use crate::backend::{RecordFailure, RemoteChanges, SendOutcome};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{AccountChange, SyncEvent, ZoneDeletionReason};
use crate::scheduler::{release, BatchScheduler};
use crate::store::LocalStore;
use serde::Serialize;
use std::sync::Arc;
use syncbox_codec::AssetStager;
use syncbox_store::{SessionToken, UploadState};
use tracing::{debug, info, warn};

/// Externally visible sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    /// Nothing in flight.
    Idle,
    /// A fetch or a send is running.
    Synchronizing,
}

/// Counters since the engine started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Fetches that completed.
    pub fetches_completed: u64,
    /// Send batches that completed.
    pub sends_completed: u64,
    /// Saves confirmed by the backend.
    pub records_saved: u64,
    /// Deletes confirmed by the backend.
    pub records_deleted: u64,
    /// Remote records inserted or overwritten locally.
    pub remote_applied: u64,
    /// Remote deletions applied locally.
    pub remote_deleted: u64,
    /// Version conflicts seen on send.
    pub conflicts: u64,
    /// Entries requeued after a transient failure.
    pub retries: u64,
    /// Entries counted toward the failure cap.
    pub failures: u64,
    /// Last error, rendered.
    pub last_error: Option<String>,
}

/// Follow-up work requested by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Start a send pass now.
    Send,
    /// Restart the debounce timer.
    ScheduleSend,
    /// Start a fetch now.
    Fetch,
    /// Abort in-flight work and drop the session.
    ResetSession,
}

/// What the engine knows about the remote zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZoneState {
    /// Create before use.
    Unknown,
    /// Known to exist.
    Ready,
    /// Delete and create again before use.
    NeedsReset,
}

/// In-memory session, dropped on stop and recreated on next use.
#[derive(Debug)]
pub(crate) struct Session {
    pub token: Option<SessionToken>,
    pub zone: ZoneState,
}

pub(crate) struct EngineState<S: ?Sized> {
    pub config: SyncConfig,
    pub store: Arc<S>,
    pub stager: AssetStager,
    pub scheduler: BatchScheduler,
    pub session: Option<Session>,
    pub stats: SyncStats,
    /// Set when a pass in the current sync sequence left work behind.
    pub pass_failed: bool,
    /// Set when the last send outcome confirmed at least one record.
    pub send_progress: bool,
    /// Why the running fetch could not apply its changes. While set, the
    /// change feed token is not advanced.
    pub fetch_failure: Option<SyncError>,
    fetching: u32,
    sending: u32,
}

impl<S: LocalStore + ?Sized> EngineState<S> {
    pub fn new(config: SyncConfig, store: Arc<S>, stager: AssetStager) -> Self {
        let scheduler = BatchScheduler::new(&config);
        Self {
            config,
            store,
            stager,
            scheduler,
            session: None,
            stats: SyncStats::default(),
            pass_failed: false,
            send_progress: false,
            fetch_failure: None,
            fetching: 0,
            sending: 0,
        }
    }

    pub fn status(&self) -> SyncStatus {
        if self.fetching > 0 || self.sending > 0 {
            SyncStatus::Synchronizing
        } else {
            SyncStatus::Idle
        }
    }

    /// Creates the session on first use.
    ///
    /// Entries left `Uploading` by a previous session are put back.
    pub fn ensure_session(&mut self) -> SyncResult<&mut Session> {
        if self.session.is_none() {
            let prefs = self.store.load_preferences()?;
            let requeued = self.store.pending_upload_reset_in_flight()?;
            self.clear_in_flight();
            info!(requeued, resumed = prefs.session_token.is_some(), "sync session started");
            self.session = Some(Session {
                token: prefs.session_token,
                zone: ZoneState::Unknown,
            });
        }
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(SyncError::Cancelled),
        }
    }

    /// Drops the session and everything in flight. Durable data is kept.
    pub fn reset(&mut self) {
        self.session = None;
        self.fetching = 0;
        self.sending = 0;
        self.send_progress = false;
        self.fetch_failure = None;
        self.clear_in_flight();
    }

    /// Forgets in-flight intents and releases their staged files.
    pub fn clear_in_flight(&mut self) {
        for (_, intent) in self.scheduler.drain() {
            release(&self.stager, &intent);
        }
    }

    pub fn record_error(&mut self, error: &SyncError) {
        warn!(%error, "sync error");
        self.pass_failed = true;
        self.stats.last_error = Some(error.to_string());
    }

    pub fn handle_event(&mut self, event: SyncEvent) -> SyncResult<Vec<Effect>> {
        match event {
            SyncEvent::WillFetch => {
                self.fetching += 1;
                Ok(Vec::new())
            }
            SyncEvent::DidFetch => {
                self.fetching = self.fetching.saturating_sub(1);
                Ok(Vec::new())
            }
            SyncEvent::WillSend => {
                self.sending += 1;
                Ok(Vec::new())
            }
            SyncEvent::DidSend => {
                self.sending = self.sending.saturating_sub(1);
                Ok(Vec::new())
            }
            SyncEvent::FetchedChanges(changes) => {
                if self.fetch_failure.is_some() {
                    debug!("earlier changes failed to apply, skipping page");
                    return Ok(Vec::new());
                }
                self.on_fetched(changes).map_err(|e| {
                    let shared = e.share();
                    self.fetch_failure = Some(e);
                    shared
                })
            }
            SyncEvent::StateUpdated(_) if self.fetch_failure.is_some() => {
                warn!("keeping change feed token, fetched changes were not applied");
                Ok(Vec::new())
            }
            SyncEvent::StateUpdated(token) => {
                self.store.set_session_token(Some(&token))?;
                if let Some(session) = self.session.as_mut() {
                    session.token = Some(token);
                }
                Ok(Vec::new())
            }
            SyncEvent::SentChanges(outcome) => self.on_sent(outcome),
            SyncEvent::ZoneCreated { zone } => {
                debug!(%zone, "zone ready");
                if let Some(session) = self.session.as_mut() {
                    session.zone = ZoneState::Ready;
                }
                Ok(Vec::new())
            }
            SyncEvent::AccountChanged(change) => self.handle_account_change(change),
            SyncEvent::ZoneDeleted { zone, reason } => self.on_zone_deleted(&zone, reason),
        }
    }

    pub fn handle_account_change(&mut self, change: AccountChange) -> SyncResult<Vec<Effect>> {
        info!(?change, "account changed");
        match change {
            AccountChange::SignIn => {
                let queued = self.store.reinitialize_outbox()?;
                self.clear_in_flight();
                self.ensure_session()?.zone = ZoneState::Unknown;
                debug!(queued, "queued local data for upload");
                Ok(vec![Effect::Fetch, Effect::Send])
            }
            AccountChange::SignOut | AccountChange::SwitchAccount => {
                self.store.wipe_synced_data()?;
                Ok(vec![Effect::ResetSession])
            }
        }
    }

    /// Puts in-flight entries back after a send pass ends.
    ///
    /// Anything the backend did not acknowledge is retried, or counted as
    /// a failure when the whole request failed permanently.
    pub fn finish_send(&mut self, result: &SyncResult<()>) -> SyncResult<Vec<Effect>> {
        let mut effects = Vec::new();
        if let Err(SyncError::Remote(failure)) = result {
            if *failure == RecordFailure::ZoneNotFound {
                if let Some(session) = self.session.as_mut() {
                    session.zone = ZoneState::Unknown;
                }
                effects.push(Effect::ScheduleSend);
            } else if failure.is_zone_reset() {
                self.reupload_everything(ZoneState::NeedsReset)?;
                effects.push(Effect::ScheduleSend);
            }
        }

        let leftover = self.scheduler.drain();
        if leftover.is_empty() {
            return Ok(effects);
        }
        let state = match result {
            Err(e) if !e.is_retryable() && effects.is_empty() => UploadState::Failed,
            _ => UploadState::Pending,
        };
        if result.is_ok() {
            warn!(count = leftover.len(), "send ended without acknowledging every record");
        }
        let ids: Vec<i64> = leftover.iter().map(|(_, i)| i.queue_id).collect();
        for (_, intent) in &leftover {
            release(&self.stager, intent);
        }
        self.store.pending_upload_change_state(&ids, state)?;
        self.pass_failed = true;
        Ok(effects)
    }

    fn on_fetched(&mut self, changes: RemoteChanges) -> SyncResult<Vec<Effect>> {
        let zone = self.config.zone.as_str();
        let owner = self.config.owner.as_str();
        let upserts = self
            .store
            .handle_remote_upsert(zone, owner, &changes.modifications)?;
        let deletes = self
            .store
            .handle_remote_deleted(zone, owner, &changes.deletions)?;
        debug!(?upserts, ?deletes, "applied remote changes");

        self.stats.remote_applied += (upserts.inserted + upserts.overwritten) as u64;
        self.stats.remote_deleted += deletes.deleted as u64;
        if upserts.kept_local > 0 {
            Ok(vec![Effect::ScheduleSend])
        } else {
            Ok(Vec::new())
        }
    }

    fn on_sent(&mut self, outcome: SendOutcome) -> SyncResult<Vec<Effect>> {
        self.send_progress |= outcome.made_progress();
        let summary = AckContext {
            store: &*self.store,
            scheduler: &mut self.scheduler,
            stager: &self.stager,
            zone: &self.config.zone,
            owner: &self.config.owner,
        }
        .apply(outcome)?;
        self.count(&summary);

        let mut effects = Vec::new();
        if summary.zone_reset {
            self.reupload_everything(ZoneState::NeedsReset)?;
            effects.push(Effect::ScheduleSend);
        } else if summary.zone_missing {
            if let Some(session) = self.session.as_mut() {
                session.zone = ZoneState::Unknown;
            }
            effects.push(Effect::ScheduleSend);
        } else if summary.conflicts > 0 {
            effects.push(Effect::ScheduleSend);
        }
        Ok(effects)
    }

    fn on_zone_deleted(
        &mut self,
        zone: &str,
        reason: ZoneDeletionReason,
    ) -> SyncResult<Vec<Effect>> {
        info!(zone, ?reason, "zone deleted");
        match reason {
            ZoneDeletionReason::Deleted => {
                self.store.sync_metadata_clear()?;
                self.store.set_session_token(None)?;
                if let Some(session) = self.session.as_mut() {
                    session.token = None;
                    session.zone = ZoneState::Unknown;
                }
                Ok(Vec::new())
            }
            ZoneDeletionReason::Purged => {
                self.store.wipe_synced_data()?;
                Ok(vec![Effect::ResetSession])
            }
            ZoneDeletionReason::EncryptedDataReset => {
                self.reupload_everything(ZoneState::Unknown)?;
                Ok(vec![Effect::Send])
            }
        }
    }

    /// The remote zone lost its contents: forget remote state and queue
    /// every local row again.
    fn reupload_everything(&mut self, zone: ZoneState) -> SyncResult<()> {
        self.store.sync_metadata_clear()?;
        self.store.set_session_token(None)?;
        let queued = self.store.reinitialize_outbox()?;
        self.clear_in_flight();
        let session = self.ensure_session()?;
        session.token = None;
        session.zone = zone;
        info!(queued, "zone reset, uploading everything again");
        Ok(())
    }

    fn count(&mut self, summary: &AckSummary) {
        self.stats.records_saved += summary.saved as u64;
        self.stats.records_deleted += summary.deleted as u64;
        self.stats.conflicts += summary.conflicts as u64;
        self.stats.retries += summary.retried as u64;
        self.stats.failures += summary.failed as u64;
        if summary.has_failures() {
            self.pass_failed = true;
        }
    }
}
