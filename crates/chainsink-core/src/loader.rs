//! Loader — validates and buffers row mutations, and hands them to a
//! [`Store`] backend on flush and on undo.
//!
//! The store owns the database side: introspected schema, cursor rows, and the
//! single transaction that commits rows, history records and the cursor
//! together.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::buffer::{OpKind, PendingBuffer, PendingOp};
use crate::config::UpdateMissingRow;
use crate::convert::{Dialect, Value, ValueConverter};
use crate::cursor::{Cursor, CursorState, StoredCursor, StreamIdentity};
use crate::error::{Result, SinkError};
use crate::schema::{TableInfo, TableRegistry};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Static description of a store, built when it connects.
#[derive(Debug, Clone)]
pub struct StoreDescriptor {
    pub dialect: Dialect,
    pub database: String,
    pub schema: String,
    pub registry: TableRegistry,
}

impl StoreDescriptor {
    /// Human-readable location used in diagnostics, e.g. `postgres:sink/public`.
    pub fn identifier(&self) -> String {
        format!(
            "{}:{}/{}",
            self.dialect.name().to_ascii_lowercase(),
            self.database,
            self.schema
        )
    }
}

/// A SQL backend the loader writes to.
///
/// Every method that writes runs as one transaction: either all of its effects
/// are visible afterwards or none are.
#[async_trait]
pub trait Store: Send + Sync {
    fn descriptor(&self) -> &StoreDescriptor;

    /// All persisted cursor rows.
    async fn load_cursors(&self) -> Result<Vec<StoredCursor>>;

    /// Replace every cursor row with a single row for `identity`.
    async fn write_cursor(&self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()>;

    /// Apply `ops` in order, recording history for reversible ones, prune
    /// history at or below `final_block`, then update the cursor row.
    ///
    /// Fails if the cursor row for `identity` does not exist.
    async fn commit(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<()>;

    /// Apply `ops`, unwind every history record above `last_valid_block`
    /// newest first, then update the cursor row.
    async fn revert(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<()>;
}

// ─── Loader ──────────────────────────────────────────────────────────────────

/// Buffers mutations for a [`Store`] until the next flush.
pub struct Loader<S: Store> {
    store: S,
    buffer: PendingBuffer,
    batch_row_flush_interval: u64,
    update_missing_row: UpdateMissingRow,
}

impl<S: Store> Loader<S> {
    pub fn new(store: S, batch_row_flush_interval: u64, update_missing_row: UpdateMissingRow) -> Self {
        Self {
            store,
            buffer: PendingBuffer::new(),
            batch_row_flush_interval,
            update_missing_row,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn registry(&self) -> &TableRegistry {
        &self.store.descriptor().registry
    }

    fn converter(&self) -> &'static dyn ValueConverter {
        self.store.descriptor().dialect.converter()
    }

    // ─── Schema lookups ──────────────────────────────────────────────────────

    pub fn has_table(&self, table: &str) -> bool {
        self.registry().has_table(table)
    }

    pub fn available_tables(&self) -> Vec<String> {
        self.registry().available_tables()
    }

    pub fn identifier(&self) -> String {
        self.store.descriptor().identifier()
    }

    pub fn database(&self) -> &str {
        &self.store.descriptor().database
    }

    pub fn schema(&self) -> &str {
        &self.store.descriptor().schema
    }

    /// Expand an opaque primary key against the table's key column.
    pub fn primary_key(&self, table: &str, key: &str) -> Result<BTreeMap<String, String>> {
        self.registry().primary_key(table, key)
    }

    /// Check a composite primary key against the table's key columns.
    pub fn check_composite_key(&self, table: &str, keys: &BTreeMap<String, String>) -> Result<()> {
        self.registry().check_composite_key(table, keys)
    }

    // ─── Buffering ───────────────────────────────────────────────────────────

    /// Buffer a row insertion. Every required column must be provided.
    pub fn insert(
        &mut self,
        table: &str,
        primary_key: BTreeMap<String, String>,
        changes: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<()> {
        let op = self.prepare(OpKind::Insert, table, primary_key, changes, reversible_block)?;
        let info = self.table_info(table)?;
        let missing: Vec<&str> = info
            .columns
            .iter()
            .filter(|c| c.is_required())
            .filter(|c| {
                !op.key.iter().any(|(k, _)| k == &c.name) && !op.values.contains_key(&c.name)
            })
            .map(|c| c.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(SinkError::Apply {
                operation: "insert",
                table: table.to_string(),
                reason: format!("missing required column(s): {}", missing.join(", ")),
            });
        }
        self.buffer.push(op);
        Ok(())
    }

    /// Buffer a row update. A missing row is handled per [`UpdateMissingRow`].
    pub fn update(
        &mut self,
        table: &str,
        primary_key: BTreeMap<String, String>,
        changes: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<()> {
        let kind = match self.update_missing_row {
            UpdateMissingRow::Fail => OpKind::Update,
            UpdateMissingRow::Upsert => OpKind::Upsert,
        };
        let op = self.prepare(kind, table, primary_key, changes, reversible_block)?;
        self.buffer.push(op);
        Ok(())
    }

    /// Buffer a row deletion.
    pub fn delete(
        &mut self,
        table: &str,
        primary_key: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<()> {
        let op = self.prepare(OpKind::Delete, table, primary_key, BTreeMap::new(), reversible_block)?;
        self.buffer.push(op);
        Ok(())
    }

    /// Buffered mutations, in arrival order.
    pub fn pending(&self) -> &[PendingOp] {
        self.buffer.ops()
    }

    /// Number of buffered row mutations.
    pub fn pending_rows(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the row flush trigger has been reached.
    pub fn flush_needed(&self) -> bool {
        self.batch_row_flush_interval > 0
            && self.buffer.len() as u64 >= self.batch_row_flush_interval
    }

    /// Buffer position to roll back to if a block fails half-way.
    pub fn mark(&self) -> usize {
        self.buffer.mark()
    }

    pub fn rollback_to(&mut self, mark: usize) {
        self.buffer.rollback_to(mark);
    }

    fn table_info(&self, table: &str) -> Result<&TableInfo> {
        self.registry().table(table).ok_or_else(|| SinkError::Schema {
            table: table.to_string(),
            identifier: self.identifier(),
            available: self.available_tables().join(", "),
        })
    }

    fn prepare(
        &self,
        kind: OpKind,
        table: &str,
        raw_key: BTreeMap<String, String>,
        changes: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<PendingOp> {
        let info = self.table_info(table)?;

        let key = raw_key
            .iter()
            .map(|(column, raw)| Ok((column.clone(), self.convert(kind, info, column, raw)?)))
            .collect::<Result<Vec<_>>>()?;

        let values = changes
            .into_iter()
            .filter(|(column, _)| !raw_key.contains_key(column))
            .map(|(column, raw)| {
                let value = self.convert(kind, info, &column, &raw)?;
                Ok((column, value))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(PendingOp {
            kind,
            table: table.to_string(),
            raw_key,
            key,
            values,
            reversible_block,
        })
    }

    fn convert(&self, kind: OpKind, info: &TableInfo, column: &str, raw: &str) -> Result<Value> {
        let col = info.get(column).ok_or_else(|| SinkError::Apply {
            operation: kind.verb(),
            table: info.name.clone(),
            reason: format!("unknown column {column:?}"),
        })?;

        if raw.is_empty() && col.nullable && !col.column_type.is_text() {
            return Ok(Value::Null);
        }

        self.converter()
            .convert(raw, &col.column_type)
            .map_err(|e| match e {
                SinkError::Conversion(msg) => {
                    SinkError::Conversion(format!("{}.{column}: {msg}", info.name))
                }
                other => other,
            })
    }

    // ─── Cursor, flush and undo ──────────────────────────────────────────────

    /// Look up the cursor for `identity`.
    pub async fn load_cursor(&self, identity: &StreamIdentity) -> Result<CursorState> {
        let stored = self.store.load_cursors().await?;
        CursorState::resolve(identity, stored)
    }

    /// Replace the stored cursor rows with `cursor` for `identity`.
    pub async fn write_cursor(&self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()> {
        self.store
            .write_cursor(identity, cursor)
            .await
            .map_err(|e| SinkError::Cursor(format!("write cursor: {e}")))
    }

    /// Commit the buffer together with `cursor`. Returns the number of rows
    /// written. On failure the buffer is left untouched.
    pub async fn flush(
        &mut self,
        identity: &StreamIdentity,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<usize> {
        self.store
            .commit(self.buffer.ops(), identity, cursor, final_block)
            .await
            .map_err(|e| SinkError::flush(&cursor.block, e))?;
        let rows = self.buffer.len();
        self.buffer.clear();
        Ok(rows)
    }

    /// Commit what is buffered, then revert everything above `last_valid_block`
    /// and move the cursor back to `cursor`.
    pub async fn revert(
        &mut self,
        identity: &StreamIdentity,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<()> {
        self.store
            .revert(self.buffer.ops(), identity, cursor, last_valid_block)
            .await
            .map_err(|e| SinkError::Undo {
                last_valid_block,
                reason: e.to_string(),
            })?;
        self.buffer.clear();
        Ok(())
    }
}
