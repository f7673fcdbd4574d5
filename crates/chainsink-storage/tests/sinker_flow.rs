//! End-to-end sinker flows against the bundled backends.
//!
//! Every scenario runs once on the in-memory store and once on an in-memory
//! SQLite database, driving a [`Sinker`] with hand-built blocks and checking
//! the rows and cursor left behind.

use async_trait::async_trait;
use sqlx::Row;
use std::collections::BTreeMap;

use chainsink_core::{
    BlockRef, BlockScopedData, BlockUndoSignal, ColumnInfo, ColumnType, Cursor, DatabaseChanges,
    MemorySource, ModuleMismatchPolicy, Operation, PrimaryKey, SinkError, SinkEvent, Sinker,
    SinkerBuilder, SinkerConfig, Store, StreamIdentity, TableChange, TableInfo, TableRegistry,
    Value,
};
use chainsink_core::types::{Clock, MapOutput, ModuleOutput};
use chainsink_storage::{MemoryStore, SqliteStore};

const MODULE: &str = "db_out";

// ─── Helpers ──────────────────────────────────────────────────────────────────

#[async_trait]
trait Harness: Store + Clone + 'static {
    /// `id → balance` for every row of `accounts`.
    async fn balances(&self) -> BTreeMap<String, i64>;
    /// `(owner, token) → amount` for every row of `positions`.
    async fn positions(&self) -> BTreeMap<(String, String), i64>;
    async fn history_len(&self) -> usize;
}

#[async_trait]
impl Harness for MemoryStore {
    async fn balances(&self) -> BTreeMap<String, i64> {
        self.rows("accounts")
            .into_iter()
            .map(|row| {
                let id = match &row["id"] {
                    Value::Text(s) => s.clone(),
                    other => panic!("unexpected id {other:?}"),
                };
                let balance = match &row["balance"] {
                    Value::Int(i) => *i,
                    other => panic!("unexpected balance {other:?}"),
                };
                (id, balance)
            })
            .collect()
    }

    async fn positions(&self) -> BTreeMap<(String, String), i64> {
        self.rows("positions")
            .into_iter()
            .map(|row| {
                let text = |col: &str| match &row[col] {
                    Value::Text(s) => s.clone(),
                    other => panic!("unexpected {col} {other:?}"),
                };
                let amount = match &row["amount"] {
                    Value::Int(i) => *i,
                    other => panic!("unexpected amount {other:?}"),
                };
                ((text("owner"), text("token")), amount)
            })
            .collect()
    }

    async fn history_len(&self) -> usize {
        MemoryStore::history_len(self)
    }
}

#[async_trait]
impl Harness for SqliteStore {
    async fn balances(&self) -> BTreeMap<String, i64> {
        sqlx::query("SELECT id, balance FROM accounts")
            .fetch_all(self.pool())
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<i64, _>("balance")))
            .collect()
    }

    async fn positions(&self) -> BTreeMap<(String, String), i64> {
        sqlx::query("SELECT owner, token, amount FROM positions")
            .fetch_all(self.pool())
            .await
            .unwrap()
            .into_iter()
            .map(|r| {
                (
                    (r.get::<String, _>("owner"), r.get::<String, _>("token")),
                    r.get::<i64, _>("amount"),
                )
            })
            .collect()
    }

    async fn history_len(&self) -> usize {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM substreams_history")
            .fetch_one(self.pool())
            .await
            .unwrap();
        count as usize
    }
}

fn memory() -> MemoryStore {
    MemoryStore::new(TableRegistry::new().with_table(
        TableInfo::new("accounts")
            .primary_key(["id"])
            .column(ColumnInfo::new("id", ColumnType::Text).not_null())
            .column(ColumnInfo::new("balance", ColumnType::Integer).not_null()),
        )
        .with_table(
            TableInfo::new("positions")
                .primary_key(["owner", "token"])
                .column(ColumnInfo::new("owner", ColumnType::Text).not_null())
                .column(ColumnInfo::new("token", ColumnType::Text).not_null())
                .column(ColumnInfo::new("amount", ColumnType::Integer).not_null()),
        ),
    )
}

async fn sqlite() -> SqliteStore {
    let mut store = SqliteStore::in_memory().await.unwrap();
    store
        .execute_ddl("CREATE TABLE accounts (id TEXT NOT NULL PRIMARY KEY, balance INTEGER NOT NULL)")
        .await
        .unwrap();
    store
        .execute_ddl(
            "CREATE TABLE positions (owner TEXT NOT NULL, token TEXT NOT NULL, \
             amount INTEGER NOT NULL, PRIMARY KEY (owner, token))",
        )
        .await
        .unwrap();
    store
}

fn identity() -> StreamIdentity {
    StreamIdentity::new("hash-a")
}

fn create(id: &str, balance: i64) -> TableChange {
    TableChange::new("accounts", PrimaryKey::Pk(id.into()), Operation::Create)
        .field("balance", balance.to_string())
}

fn update(id: &str, balance: i64) -> TableChange {
    TableChange::new("accounts", PrimaryKey::Pk(id.into()), Operation::Update)
        .field("balance", balance.to_string())
}

fn delete(id: &str) -> TableChange {
    TableChange::new("accounts", PrimaryKey::Pk(id.into()), Operation::Delete)
}

fn position(owner: &str, token: &str, op: Operation, amount: Option<i64>) -> TableChange {
    let key = BTreeMap::from([
        ("owner".to_string(), owner.to_string()),
        ("token".to_string(), token.to_string()),
    ]);
    let change = TableChange::new("positions", PrimaryKey::CompositePk(key), op);
    match amount {
        Some(amount) => change.field("amount", amount.to_string()),
        None => change,
    }
}

fn block(n: u64, final_height: u64, changes: Vec<TableChange>) -> BlockScopedData {
    let changes = DatabaseChanges {
        table_changes: changes,
    };
    BlockScopedData {
        clock: Clock {
            number: n,
            id: format!("0x{n:02x}"),
            timestamp: None,
        },
        final_block_height: final_height,
        is_live: false,
        cursor: format!("c{n}"),
        output: ModuleOutput {
            name: MODULE.into(),
            map_output: Some(MapOutput::from_changes(&changes).unwrap()),
        },
    }
}

fn undo_to(n: u64) -> BlockUndoSignal {
    BlockUndoSignal {
        last_valid_block: BlockRef::new(n, format!("0x{n:02x}")),
        last_valid_cursor: format!("c{n}"),
    }
}

fn every_block() -> SinkerConfig {
    SinkerBuilder::new().batch_block_flush_interval(1).build().unwrap()
}

async fn stored_cursor<S: Store>(store: &S) -> Cursor {
    let rows = store.load_cursors().await.unwrap();
    assert_eq!(rows.len(), 1, "exactly one cursor row expected");
    rows[0].cursor.clone()
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

async fn failed_flush_is_atomic<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), every_block(), MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    sinker.handle_block_scoped_data(block(1, 1, vec![create("a", 1)])).await.unwrap();
    let err = sinker
        .handle_block_scoped_data(block(2, 2, vec![create("b", 2), update("ghost", 3)]))
        .await
        .unwrap_err();
    match &err {
        SinkError::Flush { reason, .. } => assert!(reason.contains("no row found"), "got {reason}"),
        other => panic!("expected flush error, got {other}"),
    }

    assert_eq!(store.balances().await, BTreeMap::from([("a".to_string(), 1)]));
    assert_eq!(stored_cursor(&store).await.token, "c1");
}

async fn undo_restores_earlier_state<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), every_block(), MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    sinker.handle_block_scoped_data(block(1, 0, vec![create("a", 1)])).await.unwrap();
    let after_first = store.balances().await;

    sinker
        .handle_block_scoped_data(block(2, 0, vec![update("a", 2), create("b", 5)]))
        .await
        .unwrap();
    sinker
        .handle_block_scoped_data(block(3, 0, vec![delete("b"), create("c", 9)]))
        .await
        .unwrap();
    assert_eq!(
        store.balances().await,
        BTreeMap::from([("a".to_string(), 2), ("c".to_string(), 9)])
    );

    sinker.handle_block_undo_signal(undo_to(1)).await.unwrap();
    assert_eq!(store.balances().await, after_first);
    assert_eq!(stored_cursor(&store).await.token, "c1");

    sinker.handle_block_scoped_data(block(2, 0, vec![update("a", 7)])).await.unwrap();
    assert_eq!(store.balances().await, BTreeMap::from([("a".to_string(), 7)]));
    assert_eq!(stored_cursor(&store).await.token, "c2");
}

async fn undo_past_finality_is_refused<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), every_block(), MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    sinker.handle_block_scoped_data(block(10, 9, vec![create("a", 1)])).await.unwrap();
    sinker.handle_block_scoped_data(block(11, 9, vec![update("a", 2)])).await.unwrap();

    let err = sinker.handle_block_undo_signal(undo_to(8)).await.unwrap_err();
    assert!(matches!(err, SinkError::Undo { last_valid_block: 8, .. }), "got {err}");
    assert_eq!(store.balances().await, BTreeMap::from([("a".to_string(), 2)]));
}

async fn fresh_store_starts_blank<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), SinkerConfig::default(), MODULE, identity()).unwrap();
    let from = sinker.prepare().await.unwrap();
    assert!(from.is_blank());

    let rows = store.load_cursors().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].identity, identity());
    assert!(rows[0].cursor.is_blank());
}

async fn module_change_restarts<S: Harness>(store: S) {
    store
        .write_cursor(&StreamIdentity::new("hash-old"), &Cursor::new("c50", BlockRef::new(50, "0x32")))
        .await
        .unwrap();

    let config = SinkerBuilder::new()
        .on_module_mismatch(ModuleMismatchPolicy::Restart)
        .build()
        .unwrap();
    let sinker = Sinker::new(store.clone(), config, MODULE, identity()).unwrap();
    assert!(sinker.prepare().await.unwrap().is_blank());

    let rows = store.load_cursors().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].identity, identity());
}

async fn run_flushes_at_end_of_stream<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), SinkerConfig::default(), MODULE, identity()).unwrap();
    let source = MemorySource::new(vec![
        SinkEvent::Data(block(1, 0, vec![create("a", 1)])),
        SinkEvent::Data(block(2, 0, vec![create("b", 2)])),
        SinkEvent::Undo(undo_to(1)),
        SinkEvent::Data(block(2, 1, vec![create("c", 3)])),
    ]);

    sinker.run(&source, std::future::pending()).await.unwrap();

    assert_eq!(
        store.balances().await,
        BTreeMap::from([("a".to_string(), 1), ("c".to_string(), 3)])
    );
    assert_eq!(stored_cursor(&store).await.token, "c2");
}

async fn undo_buffer_writes_confirmed_blocks_as_final<S: Harness>(store: S) {
    let config = SinkerBuilder::new()
        .undo_buffer_size(2)
        .batch_block_flush_interval(1)
        .build()
        .unwrap();
    let sinker = Sinker::new(store.clone(), config, MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    for data in [
        block(1, 0, vec![create("a", 1)]),
        block(2, 0, vec![create("b", 2)]),
        block(3, 0, vec![create("c", 3)]),
        block(4, 0, vec![update("a", 9)]),
    ] {
        sinker.handle_event(SinkEvent::Data(data)).await.unwrap();
    }

    // Blocks 1 and 2 were confirmed and written as final; 3 and 4 are held.
    let written = BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)]);
    assert_eq!(store.balances().await, written);
    assert_eq!(store.history_len().await, 0);
    assert_eq!(stored_cursor(&store).await.token, "c2");

    sinker.handle_event(SinkEvent::Undo(undo_to(3))).await.unwrap();
    let err = sinker.handle_event(SinkEvent::Undo(undo_to(1))).await.unwrap_err();
    assert!(matches!(err, SinkError::Undo { last_valid_block: 1, .. }), "got {err}");

    assert_eq!(store.balances().await, written);
    assert_eq!(stored_cursor(&store).await.token, "c2");
}

async fn live_blocks_flush_every_block<S: Harness>(store: S) {
    let config = SinkerBuilder::new()
        .batch_block_flush_interval(1_000)
        .live_block_flush_interval(1)
        .build()
        .unwrap();
    let sinker = Sinker::new(store.clone(), config, MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    sinker.handle_block_scoped_data(block(100, 90, vec![create("a", 1)])).await.unwrap();
    assert!(stored_cursor(&store).await.is_blank());
    assert!(store.balances().await.is_empty());

    let mut live = block(101, 90, vec![create("b", 2)]);
    live.is_live = true;
    sinker.handle_block_scoped_data(live).await.unwrap();
    assert_eq!(stored_cursor(&store).await.token, "c101");
    assert_eq!(
        store.balances().await,
        BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)])
    );

    let mut live = block(102, 90, vec![update("a", 5)]);
    live.is_live = true;
    sinker.handle_block_scoped_data(live).await.unwrap();
    assert_eq!(stored_cursor(&store).await.token, "c102");
    assert_eq!(sinker.pending_rows().await, 0);
    assert_eq!(store.balances().await["a"], 5);
}

async fn composite_key_undo_restores_rows<S: Harness>(store: S) {
    let sinker = Sinker::new(store.clone(), every_block(), MODULE, identity()).unwrap();
    sinker.prepare().await.unwrap();

    sinker
        .handle_block_scoped_data(block(
            1,
            0,
            vec![
                position("alice", "eth", Operation::Create, Some(10)),
                position("alice", "usdc", Operation::Create, Some(20)),
            ],
        ))
        .await
        .unwrap();
    let before = store.positions().await;

    sinker
        .handle_block_scoped_data(block(
            2,
            0,
            vec![
                position("alice", "eth", Operation::Update, Some(11)),
                position("alice", "usdc", Operation::Delete, None),
                position("bob", "eth", Operation::Create, Some(5)),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(
        store.positions().await,
        BTreeMap::from([
            (("alice".to_string(), "eth".to_string()), 11),
            (("bob".to_string(), "eth".to_string()), 5),
        ])
    );

    sinker.handle_block_undo_signal(undo_to(1)).await.unwrap();
    assert_eq!(store.positions().await, before);
    assert_eq!(stored_cursor(&store).await.token, "c1");
}

// ─── Memory store ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn memory_failed_flush_is_atomic() {
    failed_flush_is_atomic(memory()).await;
}

#[tokio::test]
async fn memory_undo_restores_earlier_state() {
    undo_restores_earlier_state(memory()).await;
}

#[tokio::test]
async fn memory_undo_past_finality_is_refused() {
    undo_past_finality_is_refused(memory()).await;
}

#[tokio::test]
async fn memory_fresh_store_starts_blank() {
    fresh_store_starts_blank(memory()).await;
}

#[tokio::test]
async fn memory_module_change_restarts() {
    module_change_restarts(memory()).await;
}

#[tokio::test]
async fn memory_run_flushes_at_end_of_stream() {
    run_flushes_at_end_of_stream(memory()).await;
}

#[tokio::test]
async fn memory_undo_buffer_writes_confirmed_blocks_as_final() {
    undo_buffer_writes_confirmed_blocks_as_final(memory()).await;
}

#[tokio::test]
async fn memory_live_blocks_flush_every_block() {
    live_blocks_flush_every_block(memory()).await;
}

#[tokio::test]
async fn memory_composite_key_undo_restores_rows() {
    composite_key_undo_restores_rows(memory()).await;
}

// ─── SQLite store ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn sqlite_failed_flush_is_atomic() {
    failed_flush_is_atomic(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_undo_restores_earlier_state() {
    undo_restores_earlier_state(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_undo_past_finality_is_refused() {
    undo_past_finality_is_refused(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_fresh_store_starts_blank() {
    fresh_store_starts_blank(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_module_change_restarts() {
    module_change_restarts(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_run_flushes_at_end_of_stream() {
    run_flushes_at_end_of_stream(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_undo_buffer_writes_confirmed_blocks_as_final() {
    undo_buffer_writes_confirmed_blocks_as_final(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_live_blocks_flush_every_block() {
    live_blocks_flush_every_block(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_composite_key_undo_restores_rows() {
    composite_key_undo_restores_rows(sqlite().await).await;
}
