//! Syncable entity kinds.

use crate::types::{RecordKey, TableName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use syncbox_codec::{CodecResult, EnvelopeOptions};

/// A row that replicates across devices.
///
/// `modified` never decreases for an object across writers that have seen
/// the previous value; equal timestamps mean the copies have converged.
pub trait SyncableRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Entity kind tag.
    const TABLE: TableName;

    /// Stable identity across devices.
    fn object_id(&self) -> &str;
    /// Creation time in milliseconds.
    fn creation(&self) -> i64;
    /// Last modification time in milliseconds.
    fn modified(&self) -> i64;
    /// Tombstone flag.
    fn removed(&self) -> bool;
    /// Sets the modification time.
    fn set_modified(&mut self, modified: i64);
    /// Sets the tombstone flag.
    fn set_removed(&mut self, removed: bool);

    /// Carries local-only runtime fields over from the local row.
    ///
    /// With `None` (no local row yet) the fields are reset to their defaults.
    fn preserve_local_fields(&mut self, _local: Option<&Self>) {}
}

macro_rules! syncable {
    ($ty:ident, $table:expr) => {
        impl SyncableRecord for $ty {
            const TABLE: TableName = $table;

            fn object_id(&self) -> &str {
                &self.object_id
            }
            fn creation(&self) -> i64 {
                self.creation
            }
            fn modified(&self) -> i64 {
                self.modified
            }
            fn removed(&self) -> bool {
                self.removed
            }
            fn set_modified(&mut self, modified: i64) {
                self.modified = modified;
            }
            fn set_removed(&mut self, removed: bool) {
                self.removed = removed;
            }
        }
    };
    ($ty:ident, $table:expr, local: [$($field:ident),+]) => {
        impl SyncableRecord for $ty {
            const TABLE: TableName = $table;

            fn object_id(&self) -> &str {
                &self.object_id
            }
            fn creation(&self) -> i64 {
                self.creation
            }
            fn modified(&self) -> i64 {
                self.modified
            }
            fn removed(&self) -> bool {
                self.removed
            }
            fn set_modified(&mut self, modified: i64) {
                self.modified = modified;
            }
            fn set_removed(&mut self, removed: bool) {
                self.removed = removed;
            }
            fn preserve_local_fields(&mut self, local: Option<&Self>) {
                match local {
                    Some(local) => {
                        $(self.$field = local.$field.clone();)+
                    }
                    None => {
                        $(self.$field = Default::default();)+
                    }
                }
            }
        }
    };
}

/// A chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Conversation {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// Display title.
    pub title: String,
    /// Icon identifier.
    pub icon: Option<String>,
    /// Preferred model for new turns.
    pub model_id: Option<String>,
    /// Pinned by the user.
    pub is_favorite: bool,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// Owning conversation.
    pub conversation_id: String,
    /// Author role (`user`, `assistant`, `system`, `tool`).
    pub role: String,
    /// Message text.
    pub content: String,
    /// Model reasoning trace, if any.
    pub reasoning: Option<String>,
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attachment {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// Owning message.
    pub message_id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// File contents.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A cloud model endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloudModel {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// API endpoint.
    pub endpoint: String,
    /// Model identifier sent to the endpoint.
    pub model_identifier: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Context window in tokens.
    pub context_length: u32,
    /// Result of the last reachability probe on this device.
    pub last_probe_status: Option<String>,
}

/// A context server (tool provider) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextServer {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// Display name.
    pub name: String,
    /// Server endpoint.
    pub endpoint: String,
    /// Enabled by the user.
    pub is_enabled: bool,
    /// Live connection status on this device.
    pub connection_status: Option<String>,
}

/// A long-term memory note.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryNote {
    /// Object id.
    pub object_id: String,
    /// Creation time (ms).
    pub creation: i64,
    /// Modification time (ms).
    pub modified: i64,
    /// Tombstone flag.
    pub removed: bool,
    /// Note text.
    pub content: String,
    /// Conversation the note was captured from.
    pub conversation_id: Option<String>,
}

syncable!(Conversation, TableName::Conversation);
syncable!(Message, TableName::Message);
syncable!(Attachment, TableName::Attachment);
syncable!(CloudModel, TableName::CloudModel, local: [last_probe_status]);
syncable!(ContextServer, TableName::ContextServer, local: [connection_status]);
syncable!(MemoryNote, TableName::Memory);

/// Any syncable entity.
///
/// Serializes as the inner record, without a table tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SyncEntity {
    /// A conversation.
    Conversation(Conversation),
    /// A message.
    Message(Message),
    /// An attachment.
    Attachment(Attachment),
    /// A cloud model configuration.
    CloudModel(CloudModel),
    /// A context server configuration.
    ContextServer(ContextServer),
    /// A memory note.
    Memory(MemoryNote),
}

macro_rules! each {
    ($entity:expr, $inner:ident => $body:expr) => {
        match $entity {
            SyncEntity::Conversation($inner) => $body,
            SyncEntity::Message($inner) => $body,
            SyncEntity::Attachment($inner) => $body,
            SyncEntity::CloudModel($inner) => $body,
            SyncEntity::ContextServer($inner) => $body,
            SyncEntity::Memory($inner) => $body,
        }
    };
}

impl SyncEntity {
    /// Entity kind.
    pub fn table(&self) -> TableName {
        match self {
            SyncEntity::Conversation(_) => TableName::Conversation,
            SyncEntity::Message(_) => TableName::Message,
            SyncEntity::Attachment(_) => TableName::Attachment,
            SyncEntity::CloudModel(_) => TableName::CloudModel,
            SyncEntity::ContextServer(_) => TableName::ContextServer,
            SyncEntity::Memory(_) => TableName::Memory,
        }
    }

    /// Object id.
    pub fn object_id(&self) -> &str {
        each!(self, e => e.object_id())
    }

    /// Record key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.object_id(), self.table())
    }

    /// Creation time (ms).
    pub fn creation(&self) -> i64 {
        each!(self, e => e.creation())
    }

    /// Modification time (ms).
    pub fn modified(&self) -> i64 {
        each!(self, e => e.modified())
    }

    /// Tombstone flag.
    pub fn removed(&self) -> bool {
        each!(self, e => e.removed())
    }

    /// Sets the modification time.
    pub fn set_modified(&mut self, modified: i64) {
        each!(self, e => e.set_modified(modified))
    }

    /// Sets the tombstone flag.
    pub fn set_removed(&mut self, removed: bool) {
        each!(self, e => e.set_removed(removed))
    }

    /// Carries local-only fields over from `local` when it is the same kind.
    pub fn preserve_local_fields(&mut self, local: Option<&SyncEntity>) {
        match (self, local) {
            (SyncEntity::CloudModel(remote), Some(SyncEntity::CloudModel(local))) => {
                remote.preserve_local_fields(Some(local))
            }
            (SyncEntity::ContextServer(remote), Some(SyncEntity::ContextServer(local))) => {
                remote.preserve_local_fields(Some(local))
            }
            (entity, _) => each!(entity, e => e.preserve_local_fields(None)),
        }
    }

    /// Encodes the entity into a payload envelope.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self, options: &EnvelopeOptions) -> CodecResult<Vec<u8>> {
        each!(self, e => syncbox_codec::encode(e, options))
    }

    /// Decodes an envelope holding an entity of `table`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the envelope is invalid or the body does
    /// not describe an entity of `table`.
    pub fn decode(table: TableName, bytes: &[u8]) -> CodecResult<Self> {
        Ok(match table {
            TableName::Conversation => SyncEntity::Conversation(syncbox_codec::decode(bytes)?),
            TableName::Message => SyncEntity::Message(syncbox_codec::decode(bytes)?),
            TableName::Attachment => SyncEntity::Attachment(syncbox_codec::decode(bytes)?),
            TableName::CloudModel => SyncEntity::CloudModel(syncbox_codec::decode(bytes)?),
            TableName::ContextServer => SyncEntity::ContextServer(syncbox_codec::decode(bytes)?),
            TableName::Memory => SyncEntity::Memory(syncbox_codec::decode(bytes)?),
        })
    }
}

macro_rules! into_entity {
    ($($ty:ident => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for SyncEntity {
                fn from(value: $ty) -> Self {
                    SyncEntity::$variant(value)
                }
            }
        )+
    };
}

into_entity!(
    Conversation => Conversation,
    Message => Message,
    Attachment => Attachment,
    CloudModel => CloudModel,
    ContextServer => ContextServer,
    MemoryNote => Memory,
);
