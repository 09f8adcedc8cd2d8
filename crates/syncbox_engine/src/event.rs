//! Protocol events and the sink backends report them through.

use crate::backend::{RemoteChanges, SendOutcome};
use crate::engine::{Envelope, JobKind};
use crate::error::SyncResult;
use serde::Serialize;
use syncbox_store::SessionToken;
use tokio::sync::mpsc::UnboundedSender;

/// Identity change reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccountChange {
    /// An account signed in.
    SignIn,
    /// The account signed out.
    SignOut,
    /// A different account signed in.
    SwitchAccount,
}

/// Why a zone went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZoneDeletionReason {
    /// Deleted by this engine.
    Deleted,
    /// Deleted by the user elsewhere; local synced data goes too.
    Purged,
    /// The backend lost its encryption keys; contents must be uploaded again.
    EncryptedDataReset,
}

/// Events delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A fetch is starting.
    WillFetch,
    /// One page of remote changes.
    FetchedChanges(RemoteChanges),
    /// New resume token for the change feed.
    StateUpdated(SessionToken),
    /// A fetch ended.
    DidFetch,
    /// A send is starting.
    WillSend,
    /// Per-record results of a send.
    SentChanges(SendOutcome),
    /// A send ended.
    DidSend,
    /// The zone was created.
    ZoneCreated {
        /// Zone name.
        zone: String,
    },
    /// The account identity changed.
    AccountChanged(AccountChange),
    /// The zone was deleted.
    ZoneDeleted {
        /// Zone name.
        zone: String,
        /// Why.
        reason: ZoneDeletionReason,
    },
}

/// Write-only handle for reporting [`SyncEvent`]s to the engine.
///
/// Events are queued behind whatever the engine is doing and handled one
/// at a time. Events from a session that has since been stopped are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<Envelope>,
    generation: u64,
}

impl EventSink {
    pub(crate) fn new(tx: UnboundedSender<Envelope>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Reports an event. Does nothing once the engine has shut down.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(Envelope::Event {
            generation: self.generation,
            event,
        });
    }

    pub(crate) fn done(&self, job: JobKind, result: SyncResult<()>) {
        let _ = self.tx.send(Envelope::Done {
            generation: self.generation,
            job,
            result,
        });
    }
}
