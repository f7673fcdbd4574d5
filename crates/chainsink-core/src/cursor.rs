//! Sink cursor — binds a stream position to the durable store state.
//!
//! Exactly one cursor row exists per [`StreamIdentity`]. It is written once
//! (blank) at first start and afterwards only ever updated, by flushes and by
//! undo.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SinkError};
use crate::types::BlockRef;

/// The sink's current position in the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Opaque resumption token handed back to the stream on restart.
    pub token: String,
    /// Block the token points at.
    pub block: BlockRef,
}

impl Cursor {
    pub fn new(token: impl Into<String>, block: BlockRef) -> Self {
        Self {
            token: token.into(),
            block,
        }
    }

    /// A cursor that starts the stream from the beginning.
    pub fn blank() -> Self {
        Self::default()
    }

    /// Returns `true` if this cursor carries no position.
    pub fn is_blank(&self) -> bool {
        self.token.is_empty()
    }

    /// Block number the cursor points at.
    pub fn block_number(&self) -> u64 {
        self.block.number
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_blank() {
            write!(f, "<blank>")
        } else {
            write!(f, "{}", self.block)
        }
    }
}

// ─── StreamIdentity ──────────────────────────────────────────────────────────

/// Fingerprint of the output module configuration the cursor belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamIdentity(String);

impl StreamIdentity {
    /// Use an externally computed module hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash the output module name together with its serialized configuration.
    pub fn from_module(name: &str, config: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Resume protocol ─────────────────────────────────────────────────────────

/// A cursor row as persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCursor {
    pub identity: StreamIdentity,
    pub cursor: Cursor,
}

/// Outcome of looking up the cursor for a stream identity at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// No cursor row at all: first run.
    NotFound,
    /// A cursor row exists for this identity.
    Found(Cursor),
    /// The only cursor row belongs to another identity.
    Mismatch {
        stored_identity: StreamIdentity,
        cursor: Cursor,
    },
}

impl CursorState {
    /// Classify the stored cursor rows against the current identity.
    pub fn resolve(identity: &StreamIdentity, stored: Vec<StoredCursor>) -> Result<Self> {
        if stored.is_empty() {
            return Ok(Self::NotFound);
        }

        if let Some(row) = stored.iter().find(|row| &row.identity == identity) {
            return Ok(Self::Found(row.cursor.clone()));
        }

        match <[StoredCursor; 1]>::try_from(stored) {
            Ok([row]) => Ok(Self::Mismatch {
                stored_identity: row.identity,
                cursor: row.cursor,
            }),
            Err(rows) => Err(SinkError::Cursor(format!(
                "{} cursors found for other modules ({}) but none for {identity}",
                rows.len(),
                rows.iter()
                    .map(|r| r.identity.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// What to do when the stored cursor belongs to another module configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleMismatchPolicy {
    /// Discard the stored position and restart from a blank cursor.
    #[default]
    Restart,
    /// Refuse to start.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(identity: &str, block: u64) -> StoredCursor {
        StoredCursor {
            identity: StreamIdentity::new(identity),
            cursor: Cursor::new(format!("c{block}"), BlockRef::new(block, "")),
        }
    }

    #[test]
    fn blank_cursor() {
        let cursor = Cursor::blank();
        assert!(cursor.is_blank());
        assert_eq!(cursor.block_number(), 0);
        assert_eq!(cursor.to_string(), "<blank>");
    }

    #[test]
    fn identity_depends_on_config() {
        let a = StreamIdentity::from_module("db_out", b"start=10");
        let b = StreamIdentity::from_module("db_out", b"start=11");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a, StreamIdentity::from_module("db_out", b"start=10"));
    }

    #[test]
    fn resolve_not_found() {
        let id = StreamIdentity::new("aaa");
        assert_eq!(CursorState::resolve(&id, vec![]).unwrap(), CursorState::NotFound);
    }

    #[test]
    fn resolve_found_among_many() {
        let id = StreamIdentity::new("aaa");
        let state = CursorState::resolve(&id, vec![stored("bbb", 5), stored("aaa", 9)]).unwrap();
        assert_eq!(state, CursorState::Found(stored("aaa", 9).cursor));
    }

    #[test]
    fn resolve_mismatch() {
        let id = StreamIdentity::new("aaa");
        match CursorState::resolve(&id, vec![stored("bbb", 5)]).unwrap() {
            CursorState::Mismatch {
                stored_identity,
                cursor,
            } => {
                assert_eq!(stored_identity.as_str(), "bbb");
                assert_eq!(cursor.block_number(), 5);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn resolve_ambiguous_is_error() {
        let id = StreamIdentity::new("aaa");
        let err = CursorState::resolve(&id, vec![stored("bbb", 5), stored("ccc", 6)]).unwrap_err();
        assert!(err.to_string().contains("bbb, ccc"));
    }
}
