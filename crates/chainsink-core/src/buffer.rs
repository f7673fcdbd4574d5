//! Pending buffer — converted row mutations waiting for the next flush.
//!
//! Mutations are kept in arrival order and never merged: each one may carry a
//! different reversible block, and undo must be able to unwind them one by
//! one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::convert::Value;

/// Kind of buffered mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    /// Update that inserts the row when it does not exist yet.
    Upsert,
    Delete,
}

impl OpKind {
    /// Verb used in error messages.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// A validated, converted row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub kind: OpKind,
    pub table: String,
    /// Primary key as received, `column → raw value`.
    pub raw_key: BTreeMap<String, String>,
    /// Primary key converted to column types, in column-name order.
    pub key: Vec<(String, Value)>,
    /// Non-key column values. Empty for deletes.
    pub values: BTreeMap<String, Value>,
    /// Originating block when the mutation is not final yet.
    pub reversible_block: Option<u64>,
}

impl PendingOp {
    pub fn is_reversible(&self) -> bool {
        self.reversible_block.is_some()
    }

    /// Key and value columns together, key first.
    pub fn all_columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key
            .iter()
            .map(|(c, v)| (c.as_str(), v))
            .chain(self.values.iter().map(|(c, v)| (c.as_str(), v)))
    }

    /// Serialized raw key, as stored in history records.
    pub fn raw_key_json(&self) -> String {
        serde_json::to_string(&self.raw_key).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Ordered list of mutations applied since the last flush.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    ops: Vec<PendingOp>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PendingOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[PendingOp] {
        &self.ops
    }

    /// Number of buffered row mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Current length, to roll back to if a block fails half-way.
    pub fn mark(&self) -> usize {
        self.ops.len()
    }

    /// Drop everything pushed after `mark`.
    pub fn rollback_to(&mut self, mark: usize) {
        self.ops.truncate(mark);
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
