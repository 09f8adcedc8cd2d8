//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload envelope error.
    #[error("codec error: {0}")]
    Codec(#[from] syncbox_codec::CodecError),

    /// A table tag that does not name a syncable table.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// The unrecognized tag.
        name: String,
    },

    /// A record name that does not end in a known table tag.
    #[error("malformed record name: {name}")]
    MalformedRecordName {
        /// The record name.
        name: String,
    },

    /// A stored enum code that is out of range.
    #[error("invalid {what} code {code}")]
    InvalidCode {
        /// Which column held the code.
        what: &'static str,
        /// The stored value.
        code: i64,
    },

    /// Record not found.
    #[error("record not found: {object_id} in {table}")]
    RecordNotFound {
        /// Table tag.
        table: String,
        /// Object id.
        object_id: String,
    },

    /// The decoded entity does not belong to the table it was stored under.
    #[error("entity of table {found} stored under {expected}")]
    TableMismatch {
        /// Table the caller asked for.
        expected: String,
        /// Table the entity reports.
        found: String,
    },
}

impl StoreError {
    /// Creates an unknown table error.
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    /// Creates a record not found error.
    pub fn not_found(table: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            object_id: object_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::not_found("Conversation", "c-1");
        assert_eq!(err.to_string(), "record not found: c-1 in Conversation");

        let err = StoreError::InvalidCode {
            what: "state",
            code: 9,
        };
        assert_eq!(err.to_string(), "invalid state code 9");
    }
}
