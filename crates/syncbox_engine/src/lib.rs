//! # syncbox Engine
//!
//! Orchestrates synchronization between a [`LocalStore`] and a
//! [`RemoteBackend`].
//!
//! This crate provides:
//! - A batch scheduler that turns the outbox into backend requests
//! - Acknowledgment handling, including version conflicts and zone loss
//! - An actor that owns all sync state and serializes every transition
//! - A debounced send after local edits
//! - An in-memory backend for tests and tooling
//!
//! ## Architecture
//!
//! [`SyncEngine::spawn`] starts one task that owns the session, the
//! scheduler's in-flight intents and the job bookkeeping. Callers talk to
//! it through a [`SyncHandle`]; backends report progress as [`SyncEvent`]s
//! through an [`EventSink`]. Event handlers return follow-up effects
//! instead of starting work themselves, so a backend callback can never
//! re-enter a fetch, a send or a cancellation.
//!
//! ## Key Invariants
//!
//! - At most one fetch and one send run at a time; later requests join them
//! - An outbox entry is removed only after the backend confirms it
//! - Events from a stopped session are ignored
//! - Entries left in flight by a crash go back to pending on next start

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod backend;
mod config;
mod engine;
mod error;
mod event;
mod memory_backend;
mod scheduler;
mod state;
mod store;

pub use backend::{
    BackendLimits, FailedDelete, FailedSave, RecordFailure, RemoteBackend, RemoteChangeBatch,
    RemoteChanges, SaveIntent, SavedRecord, SendOutcome, TraceKey,
};
pub use config::{SyncConfig, DEFAULT_BATCH_SIZE, DEFAULT_DEBOUNCE, DEFAULT_OWNER};
pub use engine::{SyncEngine, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use event::{AccountChange, EventSink, SyncEvent, ZoneDeletionReason};
pub use memory_backend::{MemoryBackend, MemoryServer, SentBatch};
pub use scheduler::{BatchScheduler, BuiltBatch, PendingIntent};
pub use state::{SyncStats, SyncStatus};
pub use store::LocalStore;
