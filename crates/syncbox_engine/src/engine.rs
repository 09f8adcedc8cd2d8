//! The sync orchestrator.
//!
//! A single task owns all engine state. Callers, backend events, the
//! debounce timer and finished backend calls all reach it as messages on
//! one channel, so every state transition is serialized.

use crate::backend::{RecordFailure, RemoteBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{AccountChange, EventSink, SyncEvent, ZoneDeletionReason};
use crate::state::{Effect, EngineState, SyncStats, SyncStatus, ZoneState};
use crate::store::LocalStore;
use std::sync::Arc;
use syncbox_codec::AssetStager;
use syncbox_store::{now_millis, RecordKey, SyncEntity, TableName, UploadQueueEntry};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Backend calls the engine tracks to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Fetch,
    Send,
    DeleteZone,
}

pub(crate) enum Envelope {
    Command(Command),
    Event {
        generation: u64,
        event: SyncEvent,
    },
    Timer {
        generation: u64,
        seq: u64,
    },
    Done {
        generation: u64,
        job: JobKind,
        result: SyncResult<()>,
    },
}

pub(crate) enum Command {
    Save {
        entity: SyncEntity,
        respond_to: Reply<UploadQueueEntry>,
    },
    Delete {
        key: RecordKey,
        respond_to: Reply<Option<UploadQueueEntry>>,
    },
    NotifyLocalChange {
        respond_to: Reply<()>,
    },
    Fetch {
        respond_to: Reply<()>,
    },
    Send {
        respond_to: Reply<()>,
    },
    Stop {
        respond_to: Reply<()>,
    },
    AccountChanged {
        change: AccountChange,
        respond_to: Reply<()>,
    },
    ReinitializeOutbox {
        respond_to: Reply<usize>,
    },
    DeleteRemoteData {
        respond_to: Reply<()>,
    },
    SetTableEnabled {
        table: TableName,
        enabled: bool,
        respond_to: Reply<()>,
    },
    SetSyncEnabled {
        enabled: bool,
        respond_to: Reply<()>,
    },
    Stats {
        respond_to: Reply<SyncStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Callers waiting on one backend call, plus whether another round was
/// requested while it ran.
struct Job {
    waiters: Vec<Reply<()>>,
    rerun: bool,
    has_more: bool,
}

impl Job {
    fn new(waiter: Option<Reply<()>>) -> Self {
        Self {
            waiters: waiter.into_iter().collect(),
            rerun: false,
            has_more: false,
        }
    }

    fn join(&mut self, waiter: Option<Reply<()>>) {
        self.waiters.extend(waiter);
        self.rerun = true;
    }

    fn finish(self, result: SyncResult<()>) {
        let mut waiters = self.waiters.into_iter();
        let Some(first) = waiters.next() else {
            return;
        };
        for waiter in waiters {
            let shared = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(e.share()),
            };
            let _ = waiter.send(shared);
        }
        let _ = first.send(result);
    }
}

fn reply<T>(waiter: Option<Reply<T>>, result: SyncResult<T>) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(result);
    }
}

/// Starts sync engines.
pub struct SyncEngine;

impl SyncEngine {
    /// Spawns the engine task on the current tokio runtime.
    ///
    /// Staged files older than `config.asset_max_age` left behind by a
    /// previous run are removed first. The engine stops when every
    /// [`SyncHandle`] is dropped or [`SyncHandle::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging directory cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<S, B>(config: SyncConfig, store: Arc<S>, backend: Arc<B>) -> SyncResult<SyncHandle>
    where
        S: LocalStore + ?Sized,
        B: RemoteBackend + ?Sized,
    {
        let stager = AssetStager::new(&config.staging_dir)?;
        match stager.sweep(config.asset_max_age) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale staged assets"),
            Err(error) => warn!(%error, "failed to sweep staged assets"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        info!(zone = %config.zone, device = %config.device_id, "sync engine started");
        let actor = Actor {
            state: EngineState::new(config, store, stager),
            backend,
            tx: tx.downgrade(),
            rx,
            status_tx,
            generation: 0,
            tasks: Vec::new(),
            debounce: None,
            debounce_seq: 0,
            fetch_job: None,
            send_job: None,
            zone_job: None,
            pass_active: false,
        };
        tokio::spawn(actor.run());

        Ok(SyncHandle {
            tx,
            status: status_rx,
        })
    }
}

/// Cloneable handle to a running engine.
///
/// Every method returns [`SyncError::Stopped`] once the engine is gone.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: UnboundedSender<Envelope>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Command(make(respond_to)))
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Saves a local edit, queues it for upload and schedules a send.
    pub async fn save(&self, entity: impl Into<SyncEntity>) -> SyncResult<UploadQueueEntry> {
        let entity = entity.into();
        self.request(|respond_to| Command::Save { entity, respond_to })
            .await
    }

    /// Deletes a row locally, queues the deletion and schedules a send.
    ///
    /// Returns `None` if the row did not exist.
    pub async fn delete(
        &self,
        table: TableName,
        object_id: impl Into<String>,
    ) -> SyncResult<Option<UploadQueueEntry>> {
        let key = RecordKey::new(object_id, table);
        self.request(|respond_to| Command::Delete { key, respond_to })
            .await
    }

    /// Schedules a send after writes made directly to the store.
    pub async fn notify_local_change(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::NotifyLocalChange { respond_to })
            .await
    }

    /// Fetches remote changes and waits for them to be applied.
    pub async fn fetch_changes(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::Fetch { respond_to }).await
    }

    /// Sends pending changes and waits until the outbox is drained or a
    /// pass makes no progress.
    pub async fn send_changes(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::Send { respond_to }).await
    }

    /// Fetches, then sends.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.fetch_changes().await?;
        self.send_changes().await
    }

    /// Cancels in-flight work and drops the session. Local data and the
    /// outbox are kept; the next request starts a new session.
    pub async fn stop(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::Stop { respond_to }).await
    }

    /// Reports an account change.
    pub async fn account_changed(&self, change: AccountChange) -> SyncResult<()> {
        self.request(|respond_to| Command::AccountChanged { change, respond_to })
            .await
    }

    /// Rebuilds the outbox from every stored row and schedules a send.
    pub async fn reinitialize_outbox(&self) -> SyncResult<usize> {
        self.request(|respond_to| Command::ReinitializeOutbox { respond_to })
            .await
    }

    /// Deletes the remote zone. Local rows and the outbox stay.
    pub async fn delete_remote_data(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::DeleteRemoteData { respond_to })
            .await
    }

    /// Includes or excludes a table from sync.
    pub async fn set_table_enabled(&self, table: TableName, enabled: bool) -> SyncResult<()> {
        self.request(|respond_to| Command::SetTableEnabled {
            table,
            enabled,
            respond_to,
        })
        .await
    }

    /// Turns sync on or off. Turning it off stops the session.
    pub async fn set_sync_enabled(&self, enabled: bool) -> SyncResult<()> {
        self.request(|respond_to| Command::SetSyncEnabled {
            enabled,
            respond_to,
        })
        .await
    }

    /// Counters since the engine started.
    pub async fn stats(&self) -> SyncResult<SyncStats> {
        self.request(|respond_to| Command::Stats { respond_to })
            .await
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// A receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops the engine task. In-flight work is cancelled.
    pub async fn shutdown(&self) {
        let (respond_to, rx) = oneshot::channel();
        if self
            .tx
            .send(Envelope::Command(Command::Shutdown { respond_to }))
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Actor<S: ?Sized, B: ?Sized> {
    state: EngineState<S>,
    backend: Arc<B>,
    tx: WeakUnboundedSender<Envelope>,
    rx: UnboundedReceiver<Envelope>,
    status_tx: watch::Sender<SyncStatus>,
    /// Bumped on every session reset; older messages are ignored.
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    debounce_seq: u64,
    fetch_job: Option<Job>,
    send_job: Option<Job>,
    zone_job: Option<Job>,
    pass_active: bool,
}

impl<S, B> Actor<S, B>
where
    S: LocalStore + ?Sized,
    B: RemoteBackend + ?Sized,
{
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Envelope::Command(Command::Shutdown { respond_to }) => {
                    self.reset_session();
                    let _ = respond_to.send(());
                    break;
                }
                Envelope::Command(command) => self.handle_command(command),
                Envelope::Event { generation, event } => {
                    if generation == self.generation {
                        let result = self.state.handle_event(event);
                        self.apply(result);
                    }
                }
                Envelope::Timer { generation, seq } => {
                    if generation == self.generation && seq == self.debounce_seq {
                        self.debounce = None;
                        self.start_send(None);
                    }
                }
                Envelope::Done {
                    generation,
                    job,
                    result,
                } => {
                    if generation == self.generation {
                        self.finish_job(job, result);
                    }
                }
            }
            self.publish_status();
        }
        self.reset_session();
        info!("sync engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Save { entity, respond_to } => {
                let result = self.state.store.save_local(entity);
                if result.is_ok() {
                    self.schedule_send();
                }
                let _ = respond_to.send(result);
            }
            Command::Delete { key, respond_to } => {
                let result = self.state.store.delete_local(&key);
                if matches!(result, Ok(Some(_))) {
                    self.schedule_send();
                }
                let _ = respond_to.send(result);
            }
            Command::NotifyLocalChange { respond_to } => {
                self.schedule_send();
                let _ = respond_to.send(Ok(()));
            }
            Command::Fetch { respond_to } => self.start_fetch(Some(respond_to)),
            Command::Send { respond_to } => self.start_send(Some(respond_to)),
            Command::Stop { respond_to } => {
                self.reset_session();
                let _ = respond_to.send(Ok(()));
            }
            Command::AccountChanged { change, respond_to } => {
                match self.state.handle_account_change(change) {
                    Ok(effects) => {
                        self.run_effects(effects);
                        let _ = respond_to.send(Ok(()));
                    }
                    Err(e) => {
                        self.state.record_error(&e);
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            Command::ReinitializeOutbox { respond_to } => {
                let result = self.state.store.reinitialize_outbox();
                if result.is_ok() {
                    self.state.clear_in_flight();
                    self.schedule_send();
                }
                let _ = respond_to.send(result);
            }
            Command::DeleteRemoteData { respond_to } => self.start_zone_delete(respond_to),
            Command::SetTableEnabled {
                table,
                enabled,
                respond_to,
            } => {
                let result = self.state.store.set_table_enabled(table, enabled);
                if result.is_ok() && enabled {
                    self.schedule_send();
                }
                let _ = respond_to.send(result);
            }
            Command::SetSyncEnabled {
                enabled,
                respond_to,
            } => {
                let result = self.state.store.set_sync_enabled(enabled);
                if result.is_ok() {
                    if enabled {
                        self.schedule_send();
                    } else {
                        self.reset_session();
                    }
                }
                let _ = respond_to.send(result);
            }
            Command::Stats { respond_to } => {
                let _ = respond_to.send(Ok(self.state.stats.clone()));
            }
            Command::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn apply(&mut self, result: SyncResult<Vec<Effect>>) {
        match result {
            Ok(effects) => self.run_effects(effects),
            Err(e) => self.state.record_error(&e),
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send => self.start_send(None),
                Effect::ScheduleSend => self.schedule_send(),
                Effect::Fetch => self.start_fetch(None),
                Effect::ResetSession => self.reset_session(),
            }
        }
    }

    fn sync_enabled(&self) -> SyncResult<bool> {
        Ok(self.state.store.load_preferences()?.sync_enabled)
    }

    fn sink(&self) -> SyncResult<EventSink> {
        let tx = self.tx.upgrade().ok_or(SyncError::Stopped)?;
        Ok(EventSink::new(tx, self.generation))
    }

    fn spawn_task<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn begin_pass(&mut self) {
        if !self.pass_active {
            self.pass_active = true;
            self.state.pass_failed = false;
        }
    }

    /// Records a successful sync once every job of the pass has finished.
    fn settle(&mut self) {
        if !self.pass_active
            || self.fetch_job.is_some()
            || self.send_job.is_some()
            || self.zone_job.is_some()
        {
            return;
        }
        self.pass_active = false;
        if self.state.pass_failed {
            return;
        }
        if let Err(e) = self.state.store.set_last_sync_at(now_millis()) {
            self.state.record_error(&e);
        }
    }

    fn start_fetch(&mut self, waiter: Option<Reply<()>>) {
        match self.sync_enabled() {
            Ok(true) => {}
            Ok(false) => return reply(waiter, Ok(())),
            Err(e) => return reply(waiter, Err(e)),
        }
        if let Some(job) = self.fetch_job.as_mut() {
            job.join(waiter);
            return;
        }
        self.begin_pass();
        match self.spawn_fetch() {
            Ok(true) => self.fetch_job = Some(Job::new(waiter)),
            Ok(false) => {
                self.settle();
                reply(waiter, Ok(()));
            }
            Err(e) => {
                self.state.record_error(&e);
                self.settle();
                reply(waiter, Err(e));
            }
        }
    }

    /// Returns false when the fetch was skipped.
    fn spawn_fetch(&mut self) -> SyncResult<bool> {
        let session = self.state.ensure_session()?;
        // The zone is about to be replaced; its contents are stale.
        if session.zone == ZoneState::NeedsReset {
            return Ok(false);
        }
        let token = session.token.clone();
        let zone_state = session.zone;
        let sink = self.sink()?;
        self.state.fetch_failure = None;
        let backend = Arc::clone(&self.backend);
        let zone = self.state.config.zone.clone();
        debug!(%zone, resumed = token.is_some(), "fetching changes");

        self.spawn_task(async move {
            sink.emit(SyncEvent::WillFetch);
            let result = match prepare_zone(&*backend, &zone, zone_state, &sink).await {
                Ok(()) => backend.fetch_changes(&zone, token, &sink).await,
                Err(e) => Err(e),
            };
            sink.emit(SyncEvent::DidFetch);
            sink.done(JobKind::Fetch, result);
        });
        Ok(true)
    }

    fn start_send(&mut self, waiter: Option<Reply<()>>) {
        match self.sync_enabled() {
            Ok(true) => {}
            Ok(false) => return reply(waiter, Ok(())),
            Err(e) => return reply(waiter, Err(e)),
        }
        if let Some(job) = self.send_job.as_mut() {
            job.join(waiter);
            return;
        }
        self.begin_pass();
        match self.spawn_send() {
            Ok(Some(has_more)) => {
                let mut job = Job::new(waiter);
                job.has_more = has_more;
                self.send_job = Some(job);
            }
            Ok(None) => {
                self.settle();
                reply(waiter, Ok(()));
            }
            Err(e) => {
                self.state.record_error(&e);
                self.settle();
                reply(waiter, Err(e));
            }
        }
    }

    /// Builds and sends the next batch. Returns `None` if nothing is
    /// schedulable, otherwise whether more entries remain.
    fn spawn_send(&mut self) -> SyncResult<Option<bool>> {
        let zone_state = self.state.ensure_session()?.zone;
        let sink = self.sink()?;
        let limits = self.backend.limits();
        let state = &mut self.state;
        let Some(built) = state
            .scheduler
            .build(&*state.store, &state.stager, limits)?
        else {
            return Ok(None);
        };

        let backend = Arc::clone(&self.backend);
        let zone = self.state.config.zone.clone();
        let batch = built.batch;
        debug!(
            %zone,
            saves = batch.saves.len(),
            deletes = batch.deletes.len(),
            has_more = built.has_more,
            "sending batch"
        );

        self.spawn_task(async move {
            sink.emit(SyncEvent::WillSend);
            let result = match prepare_zone(&*backend, &zone, zone_state, &sink).await {
                Ok(()) => backend.send_changes(batch, &sink).await,
                Err(e) => Err(e),
            };
            sink.emit(SyncEvent::DidSend);
            sink.done(JobKind::Send, result);
        });
        Ok(Some(built.has_more))
    }

    fn start_zone_delete(&mut self, respond_to: Reply<()>) {
        if let Some(job) = self.zone_job.as_mut() {
            job.waiters.push(respond_to);
            return;
        }
        let sink = match self.sink() {
            Ok(sink) => sink,
            Err(e) => return reply(Some(respond_to), Err(e)),
        };
        let backend = Arc::clone(&self.backend);
        let zone = self.state.config.zone.clone();
        info!(%zone, "deleting remote zone");

        self.spawn_task(async move {
            let result = match backend.delete_zone(&zone).await {
                Ok(()) | Err(SyncError::Remote(RecordFailure::ZoneNotFound)) => {
                    sink.emit(SyncEvent::ZoneDeleted {
                        zone,
                        reason: ZoneDeletionReason::Deleted,
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            };
            sink.done(JobKind::DeleteZone, result);
        });
        self.zone_job = Some(Job::new(Some(respond_to)));
    }

    fn finish_job(&mut self, job: JobKind, result: SyncResult<()>) {
        let completed = match job {
            JobKind::Fetch => self.finish_fetch(result),
            JobKind::Send => self.finish_send(result),
            JobKind::DeleteZone => {
                if let Err(e) = &result {
                    self.state.record_error(e);
                }
                self.zone_job.take().map(|job| (job, result))
            }
        };
        self.settle();
        if let Some((job, result)) = completed {
            job.finish(result);
        }
    }

    /// Returns the job to complete, or `None` if it was started again.
    fn finish_fetch(&mut self, result: SyncResult<()>) -> Option<(Job, SyncResult<()>)> {
        // The apply error was recorded when it happened.
        let result = match (result, self.state.fetch_failure.take()) {
            (Ok(()), Some(failure)) => return self.fetch_job.take().map(|job| (job, Err(failure))),
            (result, _) => result,
        };
        match &result {
            Ok(()) => self.state.stats.fetches_completed += 1,
            Err(e) => {
                self.state.record_error(e);
                if matches!(e, SyncError::Remote(RecordFailure::ZoneNotFound)) {
                    if let Some(session) = self.state.session.as_mut() {
                        session.zone = ZoneState::Unknown;
                    }
                }
            }
        }

        let mut job = self.fetch_job.take()?;
        if job.rerun && result.is_ok() {
            job.rerun = false;
            match self.spawn_fetch() {
                Ok(true) => {
                    self.fetch_job = Some(job);
                    return None;
                }
                Ok(false) => {}
                Err(e) => {
                    self.state.record_error(&e);
                    return Some((job, Err(e)));
                }
            }
        }
        Some((job, result))
    }

    /// Returns the job to complete, or `None` if another batch was sent.
    fn finish_send(&mut self, result: SyncResult<()>) -> Option<(Job, SyncResult<()>)> {
        match &result {
            Ok(()) => self.state.stats.sends_completed += 1,
            Err(e) => self.state.record_error(e),
        }
        let followup = self.state.finish_send(&result);
        self.apply(followup);
        let progress = std::mem::take(&mut self.state.send_progress);

        let mut job = self.send_job.take()?;
        if result.is_ok() && (job.rerun || (job.has_more && progress)) {
            job.rerun = false;
            match self.spawn_send() {
                Ok(Some(has_more)) => {
                    job.has_more = has_more;
                    self.send_job = Some(job);
                    return None;
                }
                Ok(None) => {}
                Err(e) => {
                    self.state.record_error(&e);
                    return Some((job, Err(e)));
                }
            }
        }
        Some((job, result))
    }

    /// Restarts the debounce timer.
    fn schedule_send(&mut self) {
        self.cancel_debounce();
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let generation = self.generation;
        let seq = self.debounce_seq;
        let delay = self.state.config.debounce;
        self.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Envelope::Timer { generation, seq });
        }));
    }

    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        self.debounce_seq += 1;
    }

    /// Aborts in-flight work and drops the session. Waiters get
    /// [`SyncError::Cancelled`].
    fn reset_session(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.cancel_debounce();
        self.generation += 1;
        self.pass_active = false;
        self.state.reset();
        for job in [
            self.fetch_job.take(),
            self.send_job.take(),
            self.zone_job.take(),
        ]
        .into_iter()
        .flatten()
        {
            job.finish(Err(SyncError::Cancelled));
        }
        debug!(generation = self.generation, "sync session reset");
    }

    fn publish_status(&self) {
        let status = self.state.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Makes sure the zone exists before use, replacing it if required.
async fn prepare_zone<B: RemoteBackend + ?Sized>(
    backend: &B,
    zone: &str,
    state: ZoneState,
    sink: &EventSink,
) -> SyncResult<()> {
    match state {
        ZoneState::Ready => return Ok(()),
        ZoneState::NeedsReset => match backend.delete_zone(zone).await {
            Ok(()) | Err(SyncError::Remote(RecordFailure::ZoneNotFound)) => {}
            Err(e) => return Err(e),
        },
        ZoneState::Unknown => {}
    }
    backend.create_zone(zone).await?;
    sink.emit(SyncEvent::ZoneCreated {
        zone: zone.to_string(),
    });
    Ok(())
}
