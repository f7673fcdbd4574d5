//! In-memory store backend.
//!
//! Keeps rows, history records and cursors in RAM. Every write works on a copy
//! of the state that replaces the live one only when the whole operation
//! succeeded, which gives the same all-or-nothing behavior as a SQL
//! transaction. Useful for tests and dry runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chainsink_core::buffer::{OpKind, PendingOp};
use chainsink_core::convert::{Dialect, Value};
use chainsink_core::cursor::{Cursor, StoredCursor, StreamIdentity};
use chainsink_core::error::{Result, SinkError};
use chainsink_core::loader::{Store, StoreDescriptor};
use chainsink_core::schema::TableRegistry;

use crate::key_json;

/// A stored row, `column → value`.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct HistoryRecord {
    op: HistoryOp,
    table: String,
    key: String,
    prev: Option<Row>,
    block: u64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// `table → key → row`
    tables: BTreeMap<String, BTreeMap<String, Row>>,
    history: Vec<HistoryRecord>,
    cursors: Vec<StoredCursor>,
}

/// In-memory [`Store`]. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    descriptor: StoreDescriptor,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// An empty store exposing the tables of `registry`, converting values
    /// with PostgreSQL rules.
    pub fn new(registry: TableRegistry) -> Self {
        Self::with_dialect(registry, Dialect::Postgres)
    }

    pub fn with_dialect(registry: TableRegistry, dialect: Dialect) -> Self {
        Self {
            descriptor: StoreDescriptor {
                dialect,
                database: "memory".into(),
                schema: "public".into(),
                registry,
            },
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Row of `table` whose primary key columns equal `key`.
    pub fn row(&self, table: &str, key: &[(&str, Value)]) -> Option<Row> {
        let key = key_json(key.iter().map(|(c, v)| (*c, v)));
        self.lock().tables.get(table)?.get(&key).cloned()
    }

    /// All rows of `table`, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of history records currently kept.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Cursor stored for `identity`, if any.
    pub fn cursor(&self, identity: &StreamIdentity) -> Option<Cursor> {
        self.lock()
            .cursors
            .iter()
            .find(|c| &c.identity == identity)
            .map(|c| c.cursor.clone())
    }

    /// Run `f` against a copy of the state and publish the copy on success.
    fn transaction<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut live = self.lock();
        let mut draft = live.clone();
        let out = f(&mut draft)?;
        *live = draft;
        Ok(out)
    }
}

impl MemoryState {
    fn apply(&mut self, op: &PendingOp) -> Result<()> {
        let key = key_json(op.key.iter().map(|(c, v)| (c.as_str(), v)));
        let rows = self.tables.entry(op.table.clone()).or_default();
        let prev = rows.get(&key).cloned();

        let (history_op, next) = match (op.kind, &prev) {
            (OpKind::Insert, Some(_)) => {
                return Err(SinkError::Apply {
                    operation: "insert",
                    table: op.table.clone(),
                    reason: format!("duplicate primary key {}", op.raw_key_json()),
                })
            }
            (OpKind::Insert, None) | (OpKind::Upsert, None) => {
                let row: Row = op
                    .all_columns()
                    .map(|(c, v)| (c.to_string(), v.clone()))
                    .collect();
                (Some(HistoryOp::Insert), Some(row))
            }
            (OpKind::Update, None) => {
                return Err(SinkError::Apply {
                    operation: "update",
                    table: op.table.clone(),
                    reason: format!("no row found for primary key {}", op.raw_key_json()),
                })
            }
            (OpKind::Update, Some(existing)) | (OpKind::Upsert, Some(existing)) => {
                let mut row = existing.clone();
                for (c, v) in &op.values {
                    row.insert(c.clone(), v.clone());
                }
                (Some(HistoryOp::Update), Some(row))
            }
            (OpKind::Delete, Some(_)) => (Some(HistoryOp::Delete), None),
            (OpKind::Delete, None) => (None, None),
        };

        match next {
            Some(row) => {
                rows.insert(key.clone(), row);
            }
            None => {
                rows.remove(&key);
            }
        }

        if let (Some(block), Some(history_op)) = (op.reversible_block, history_op) {
            self.history.push(HistoryRecord {
                op: history_op,
                table: op.table.clone(),
                key,
                prev,
                block,
            });
        }
        Ok(())
    }

    fn unwind_above(&mut self, last_valid_block: u64) {
        let (undone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.history)
            .into_iter()
            .partition(|h| h.block > last_valid_block);
        self.history = kept;

        for record in undone.into_iter().rev() {
            let rows = self.tables.entry(record.table).or_default();
            match (record.op, record.prev) {
                (HistoryOp::Insert, _) => {
                    rows.remove(&record.key);
                }
                (HistoryOp::Update, Some(prev)) | (HistoryOp::Delete, Some(prev)) => {
                    rows.insert(record.key, prev);
                }
                (_, None) => {}
            }
        }
    }

    fn set_cursor(&mut self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()> {
        let row = self
            .cursors
            .iter_mut()
            .find(|c| &c.identity == identity)
            .ok_or_else(|| {
                SinkError::Storage(format!(
                    "cursor row for module {identity} not found, 0 rows updated"
                ))
            })?;
        row.cursor = cursor.clone();
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    async fn load_cursors(&self) -> Result<Vec<StoredCursor>> {
        Ok(self.lock().cursors.clone())
    }

    async fn write_cursor(&self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()> {
        self.transaction(|state| {
            state.cursors = vec![StoredCursor {
                identity: identity.clone(),
                cursor: cursor.clone(),
            }];
            Ok(())
        })
    }

    async fn commit(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<()> {
        self.transaction(|state| {
            for op in ops {
                state.apply(op)?;
            }
            state.history.retain(|h| h.block > final_block);
            state.set_cursor(identity, cursor)
        })
    }

    async fn revert(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<()> {
        self.transaction(|state| {
            for op in ops {
                state.apply(op)?;
            }
            state.unwind_above(last_valid_block);
            state.set_cursor(identity, cursor)
        })
    }
}
