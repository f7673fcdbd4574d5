//! Error types for the chainsink pipeline.
//!
//! Every variant aborts the event being processed. Nothing is retried
//! internally: recovery happens by restarting and replaying from the
//! persisted cursor.

use thiserror::Error;

/// Result alias used across chainsink crates.
pub type Result<T, E = SinkError> = std::result::Result<T, E>;

/// Errors that can occur while sinking change-sets into a store.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(
        "received a change for a table named {table} we don't know about on {identifier} (available tables: {available})"
    )]
    Schema {
        table: String,
        identifier: String,
        available: String,
    },

    #[error("primary key resolution failed for table {table}: {reason}")]
    KeyResolution { table: String, reason: String },

    #[error("database {operation} on table {table}: {reason}")]
    Apply {
        operation: &'static str,
        table: String,
        reason: String,
    },

    #[error("{0}")]
    Conversion(String),

    #[error("\"{element}\" is not supported as {dialect} Array type")]
    UnsupportedArrayType {
        element: String,
        dialect: &'static str,
    },

    #[error("cursor error: {0}")]
    Cursor(String),

    #[error("failed to flush at block {block}: {reason}")]
    Flush { block: String, reason: String },

    #[error("undo to block {last_valid_block} failed: {reason}")]
    Undo { last_valid_block: u64, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SinkError {
    /// Every sink error stops the process; recovery is a restart from the
    /// persisted cursor.
    pub fn is_fatal_for_process(&self) -> bool {
        true
    }

    /// Returns `true` if the error comes from an unknown table or column.
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::Schema { .. })
    }

    /// Returns `true` if a field value could not be typed.
    pub fn is_conversion(&self) -> bool {
        matches!(self, Self::Conversion(_) | Self::UnsupportedArrayType { .. })
    }

    /// Wrap a store failure that happened while committing a flush.
    pub(crate) fn flush(block: impl std::fmt::Display, err: SinkError) -> Self {
        Self::Flush {
            block: block.to_string(),
            reason: err.to_string(),
        }
    }
}
