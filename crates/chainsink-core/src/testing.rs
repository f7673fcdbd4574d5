//! In-crate test store that records what the loader hands it.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::buffer::PendingOp;
use crate::convert::{ColumnType, Dialect};
use crate::cursor::{Cursor, StoredCursor, StreamIdentity};
use crate::error::{Result, SinkError};
use crate::loader::{Store, StoreDescriptor};
use crate::schema::{ColumnInfo, TableInfo, TableRegistry};

#[derive(Debug, Default)]
pub struct Recorded {
    pub cursors: Vec<StoredCursor>,
    /// Every op committed, in order.
    pub committed: Vec<PendingOp>,
    /// `(cursor, final_block)` per successful commit.
    pub commits: Vec<(Cursor, u64)>,
    /// `(cursor, last_valid_block)` per successful revert.
    pub reverts: Vec<(Cursor, u64)>,
    pub fail_commits: bool,
}

pub struct RecordingStore {
    descriptor: StoreDescriptor,
    pub state: Mutex<Recorded>,
}

impl RecordingStore {
    pub fn new() -> Self {
        let registry = TableRegistry::new()
            .with_table(
                TableInfo::new("accounts")
                    .primary_key(["id"])
                    .column(ColumnInfo::new("id", ColumnType::Text).not_null())
                    .column(ColumnInfo::new("balance", ColumnType::Text).not_null())
                    .column(ColumnInfo::new("nonce", ColumnType::Integer)),
            )
            .with_table(
                TableInfo::new("transfers")
                    .primary_key(["tx_hash", "log_index"])
                    .column(ColumnInfo::new("tx_hash", ColumnType::Text).not_null())
                    .column(ColumnInfo::new("log_index", ColumnType::Integer).not_null())
                    .column(ColumnInfo::new("amount", ColumnType::Float)),
            );
        Self {
            descriptor: StoreDescriptor {
                dialect: Dialect::Sqlite,
                database: "memory".into(),
                schema: "main".into(),
                registry,
            },
            state: Mutex::new(Recorded::default()),
        }
    }

    fn check_cursor_row(state: &Recorded, identity: &StreamIdentity) -> Result<()> {
        if state.cursors.iter().any(|c| &c.identity == identity) {
            Ok(())
        } else {
            Err(SinkError::Storage(format!(
                "no cursor row for {identity}, 0 rows updated"
            )))
        }
    }

    fn set_cursor(state: &mut Recorded, identity: &StreamIdentity, cursor: &Cursor) {
        for row in state.cursors.iter_mut().filter(|c| &c.identity == identity) {
            row.cursor = cursor.clone();
        }
    }
}

#[async_trait]
impl Store for RecordingStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    async fn load_cursors(&self) -> Result<Vec<StoredCursor>> {
        Ok(self.state.lock().unwrap().cursors.clone())
    }

    async fn write_cursor(&self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()> {
        self.state.lock().unwrap().cursors = vec![StoredCursor {
            identity: identity.clone(),
            cursor: cursor.clone(),
        }];
        Ok(())
    }

    async fn commit(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commits {
            return Err(SinkError::Storage("connection reset".into()));
        }
        Self::check_cursor_row(&state, identity)?;
        state.committed.extend_from_slice(ops);
        state.commits.push((cursor.clone(), final_block));
        Self::set_cursor(&mut state, identity, cursor);
        Ok(())
    }

    async fn revert(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_cursor_row(&state, identity)?;
        state.committed.extend_from_slice(ops);
        state
            .committed
            .retain(|op| op.reversible_block.map_or(true, |b| b <= last_valid_block));
        state.reverts.push((cursor.clone(), last_valid_block));
        Self::set_cursor(&mut state, identity, cursor);
        Ok(())
    }
}
