//! SQLite store backend.
//!
//! User tables are introspected from `sqlite_master` when the store opens.
//! Two bookkeeping tables are created next to them: `cursors` and
//! `substreams_history`. History records keep the previous row image as a JSON
//! object built with `json_object`, and undo restores it with `json_extract`.
//!
//! # Usage
//! ```rust,no_run
//! use chainsink_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./sink.db").await?;
//!
//! // In-memory, with the destination schema created up front
//! let mut store = SqliteStore::in_memory().await?;
//! store
//!     .execute_ddl("CREATE TABLE accounts (id TEXT PRIMARY KEY, balance INTEGER NOT NULL)")
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row, Transaction};
use tracing::debug;

use chainsink_core::buffer::{OpKind, PendingOp};
use chainsink_core::convert::{ColumnType, Dialect, Value};
use chainsink_core::cursor::{Cursor, StoredCursor, StreamIdentity};
use chainsink_core::error::{Result, SinkError};
use chainsink_core::loader::{Store, StoreDescriptor};
use chainsink_core::schema::{ColumnInfo, TableInfo, TableRegistry};
use chainsink_core::types::BlockRef;

use crate::key_json;
use crate::sql::{self, SqlDialect, Statement, CURSORS_TABLE, HISTORY_TABLE};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> SinkError {
    move |e| SinkError::Storage(format!("{context}: {e}"))
}

// ─── Dialect ─────────────────────────────────────────────────────────────────

/// SQLite statement flavor: numbered `?N` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "Sqlite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Text(s) => query.bind(s.clone()),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Bool(b) => query.bind(*b),
        Value::Date(d) => query.bind(d.format("%Y-%m-%d").to_string()),
        array => query.bind(array.to_json().to_string()),
    }
}

fn string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// `'$."column"'` path for `json_extract`.
fn json_path(column: &str) -> String {
    string_literal(&format!("$.\"{column}\""))
}

// ─── SqliteStore ─────────────────────────────────────────────────────────────

/// SQLite-backed [`Store`]. Cheap to clone: clones share the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    descriptor: StoreDescriptor,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./sink.db"`) or a full SQLite URL
    /// (`"sqlite:./sink.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            if path.contains('?') {
                path.to_string()
            } else {
                format!("{path}?mode=rwc")
            }
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage("sqlite connect"))?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(storage("enable WAL"))?;

        let database = path
            .trim_start_matches("sqlite:")
            .split('?')
            .next()
            .unwrap_or(path)
            .to_string();
        Self::from_pool(pool, database).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool holds a single connection that never expires, so the data
    /// lives as long as the store and its clones.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage("sqlite connect"))?;
        Self::from_pool(pool, "memory".into()).await
    }

    async fn from_pool(pool: SqlitePool, database: String) -> Result<Self> {
        init_schema(&pool).await?;
        let registry = introspect(&pool).await?;
        debug!(database = %database, tables = registry.available_tables().len(), "sqlite store opened");
        Ok(Self {
            pool,
            descriptor: StoreDescriptor {
                dialect: Dialect::Sqlite,
                database,
                schema: "main".into(),
                registry,
            },
        })
    }

    /// Run schema statements, then reload the table registry.
    pub async fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.pool.execute(sql).await.map_err(storage("execute ddl"))?;
        self.refresh_schema().await
    }

    /// Reload the table registry from the database.
    pub async fn refresh_schema(&mut self) -> Result<()> {
        self.descriptor.registry = introspect(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self, name: &str) -> Result<&TableInfo> {
        self.descriptor.registry.table(name).ok_or_else(|| SinkError::Schema {
            table: name.to_string(),
            identifier: self.descriptor.identifier(),
            available: self.descriptor.registry.available_tables().join(", "),
        })
    }

    // ─── Transaction steps ───────────────────────────────────────────────────

    async fn apply_ops(&self, tx: &mut Transaction<'_, Sqlite>, ops: &[PendingOp]) -> Result<()> {
        for op in ops {
            let info = self.table(&op.table)?;
            if let Some(block) = op.reversible_block {
                record_history(tx, info, op, block).await?;
            }

            let stmt = match op.kind {
                OpKind::Insert => sql::insert(&SqliteDialect, info, op),
                OpKind::Update => sql::update(&SqliteDialect, info, op),
                OpKind::Upsert => sql::upsert(&SqliteDialect, info, op),
                OpKind::Delete => sql::delete(&SqliteDialect, info, op),
            };
            let affected = execute(tx, &stmt).await.map_err(|e| SinkError::Apply {
                operation: op.kind.verb(),
                table: op.table.clone(),
                reason: e.to_string(),
            })?;

            if op.kind == OpKind::Update && affected == 0 {
                return Err(SinkError::Apply {
                    operation: "update",
                    table: op.table.clone(),
                    reason: format!("no row found for primary key {}", op.raw_key_json()),
                });
            }
        }
        Ok(())
    }

    async fn unwind_above(&self, tx: &mut Transaction<'_, Sqlite>, last_valid_block: u64) -> Result<()> {
        let records = sqlx::query(&format!(
            "SELECT id, op, table_name, pk, prev_value FROM {HISTORY_TABLE} \
             WHERE block_num > ?1 ORDER BY id DESC"
        ))
        .bind(last_valid_block as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage("read history"))?;

        for record in &records {
            let op: String = record.get("op");
            let table: String = record.get("table_name");
            let pk: String = record.get("pk");
            let prev: Option<String> = record.get("prev_value");
            let info = self.table(&table)?;

            let target = SqliteDialect.table_ref(&info.name);

            let statement = match op.as_str() {
                "I" => format!("DELETE FROM {target} WHERE {}", history_key_condition(info, 1)),
                "U" => {
                    let sets = info
                        .columns
                        .iter()
                        .map(|c| {
                            format!(
                                "{} = json_extract(?1, {})",
                                SqliteDialect.quote_identifier(&c.name),
                                json_path(&c.name)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("UPDATE {target} SET {sets} WHERE {}", history_key_condition(info, 2))
                }
                "D" => {
                    let columns = info
                        .columns
                        .iter()
                        .map(|c| SqliteDialect.quote_identifier(&c.name))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let values = info
                        .columns
                        .iter()
                        .map(|c| format!("json_extract(?1, {})", json_path(&c.name)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("INSERT INTO {target} ({columns}) SELECT {values}")
                }
                other => {
                    return Err(SinkError::Storage(format!(
                        "unknown history operation {other:?} for table {table}"
                    )))
                }
            };

            let first = if op == "I" { pk.clone() } else { prev.unwrap_or_default() };
            let mut query = sqlx::query(&statement).bind(first);
            if op == "U" {
                query = query.bind(pk);
            }
            query.execute(&mut **tx).await.map_err(storage("undo history record"))?;
        }

        sqlx::query(&format!("DELETE FROM {HISTORY_TABLE} WHERE block_num > ?1"))
            .bind(last_valid_block as i64)
            .execute(&mut **tx)
            .await
            .map_err(storage("clear history"))?;

        debug!(last_valid_block, undone = records.len(), "history unwound");
        Ok(())
    }
}

/// Match the key columns of `info` against the JSON key bound at `?index`.
fn history_key_condition(info: &TableInfo, index: usize) -> String {
    info.primary_key
        .iter()
        .map(|c| {
            format!(
                "{} = json_extract({}, {})",
                SqliteDialect.quote_identifier(c),
                SqliteDialect.placeholder(index),
                json_path(c)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn execute(tx: &mut Transaction<'_, Sqlite>, stmt: &Statement<'_>) -> std::result::Result<u64, sqlx::Error> {
    let mut query = sqlx::query(&stmt.sql);
    for value in &stmt.binds {
        query = bind_value(query, value);
    }
    Ok(query.execute(&mut **tx).await?.rows_affected())
}

/// Store the previous image of the row `op` touches. Inserts, and upserts of a
/// missing row, only record the key.
async fn record_history(
    tx: &mut Transaction<'_, Sqlite>,
    info: &TableInfo,
    op: &PendingOp,
    block: u64,
) -> Result<()> {
    let pk = key_json(op.key.iter().map(|(c, v)| (c.as_str(), v)));

    if op.kind != OpKind::Insert {
        let image = info
            .columns
            .iter()
            .map(|c| format!("{}, {}", string_literal(&c.name), SqliteDialect.quote_identifier(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let history_op = if op.kind == OpKind::Delete { "D" } else { "U" };
        let cond = sql::key_condition(&SqliteDialect, info, op, 4);
        let statement = Statement {
            sql: format!(
                "INSERT INTO {HISTORY_TABLE} (op, table_name, pk, prev_value, block_num) \
                 SELECT ?1, ?2, ?3, json_object({image}), ?4 FROM {} WHERE {}",
                SqliteDialect.table_ref(&info.name),
                cond.sql
            ),
            binds: cond.binds,
        };

        let mut query = sqlx::query(&statement.sql)
            .bind(history_op)
            .bind(op.table.clone())
            .bind(pk.clone())
            .bind(block as i64);
        for value in &statement.binds {
            query = bind_value(query, value);
        }
        let captured = query
            .execute(&mut **tx)
            .await
            .map_err(storage("record history"))?
            .rows_affected();
        if captured > 0 || op.kind != OpKind::Upsert {
            return Ok(());
        }
    }

    sqlx::query(&format!(
        "INSERT INTO {HISTORY_TABLE} (op, table_name, pk, block_num) VALUES ('I', ?1, ?2, ?3)"
    ))
    .bind(op.table.clone())
    .bind(pk)
    .bind(block as i64)
    .execute(&mut **tx)
    .await
    .map_err(storage("record history"))?;
    Ok(())
}

async fn update_cursor(
    tx: &mut Transaction<'_, Sqlite>,
    identity: &StreamIdentity,
    cursor: &Cursor,
) -> Result<()> {
    let updated = sqlx::query(&format!(
        "UPDATE {CURSORS_TABLE} SET cursor = ?1, block_num = ?2, block_id = ?3 WHERE id = ?4"
    ))
    .bind(cursor.token.clone())
    .bind(cursor.block.number as i64)
    .bind(cursor.block.id.clone())
    .bind(identity.as_str().to_string())
    .execute(&mut **tx)
    .await
    .map_err(storage("update cursor"))?
    .rows_affected();

    if updated == 0 {
        return Err(SinkError::Storage(format!(
            "cursor row for module {identity} not found, 0 rows updated"
        )));
    }
    Ok(())
}

/// Create the bookkeeping tables.
async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {CURSORS_TABLE} (
            id        TEXT    NOT NULL PRIMARY KEY,
            cursor    TEXT,
            block_num INTEGER,
            block_id  TEXT
        );"
    ))
    .execute(pool)
    .await
    .map_err(storage("create cursors table"))?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            op         CHAR(1) NOT NULL,
            table_name TEXT    NOT NULL,
            pk         TEXT    NOT NULL,
            prev_value TEXT,
            block_num  INTEGER NOT NULL
        );"
    ))
    .execute(pool)
    .await
    .map_err(storage("create history table"))?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{HISTORY_TABLE}_block ON {HISTORY_TABLE} (block_num);"
    ))
    .execute(pool)
    .await
    .map_err(storage("create history index"))?;

    Ok(())
}

/// Build the registry from every user table.
async fn introspect(pool: &SqlitePool) -> Result<TableRegistry> {
    let tables = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(storage("list tables"))?;

    let mut registry = TableRegistry::new();
    for row in tables {
        let name: String = row.get("name");
        if name == CURSORS_TABLE || name == HISTORY_TABLE {
            continue;
        }

        let columns = sqlx::query(&format!("PRAGMA table_info({})", SqliteDialect.quote_identifier(&name)))
            .fetch_all(pool)
            .await
            .map_err(storage("read table info"))?;

        let mut info = TableInfo::new(name.clone());
        let mut key: Vec<(i64, String)> = Vec::new();
        for column in columns {
            let column_name: String = column.get("name");
            let declared: String = column.get("type");
            let not_null: i64 = column.get("notnull");
            let default: Option<String> = column.get("dflt_value");
            let pk: i64 = column.get("pk");

            let mut col = ColumnInfo::new(column_name.clone(), ColumnType::from_sql(&declared));
            if not_null != 0 {
                col = col.not_null();
            }
            if default.is_some() {
                col = col.with_default();
            }
            if pk > 0 {
                key.push((pk, column_name));
            }
            info = info.column(col);
        }
        key.sort();
        registry.register(info.primary_key(key.into_iter().map(|(_, c)| c)));
    }
    Ok(registry)
}

#[async_trait]
impl Store for SqliteStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    async fn load_cursors(&self) -> Result<Vec<StoredCursor>> {
        let rows = sqlx::query(&format!(
            "SELECT id, cursor, block_num, block_id FROM {CURSORS_TABLE}"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("load cursors"))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let token: Option<String> = r.get("cursor");
                let number: Option<i64> = r.get("block_num");
                let id: Option<String> = r.get("block_id");
                StoredCursor {
                    identity: StreamIdentity::new(r.get::<String, _>("id")),
                    cursor: Cursor::new(
                        token.unwrap_or_default(),
                        BlockRef::new(number.unwrap_or_default() as u64, id.unwrap_or_default()),
                    ),
                }
            })
            .collect())
    }

    async fn write_cursor(&self, identity: &StreamIdentity, cursor: &Cursor) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        sqlx::query(&format!("DELETE FROM {CURSORS_TABLE}"))
            .execute(&mut *tx)
            .await
            .map_err(storage("clear cursors"))?;

        sqlx::query(&format!(
            "INSERT INTO {CURSORS_TABLE} (id, cursor, block_num, block_id) VALUES (?1, ?2, ?3, ?4)"
        ))
        .bind(identity.as_str().to_string())
        .bind(cursor.token.clone())
        .bind(cursor.block.number as i64)
        .bind(cursor.block.id.clone())
        .execute(&mut *tx)
        .await
        .map_err(storage("insert cursor"))?;

        tx.commit().await.map_err(storage("commit cursor"))?;
        debug!(module_hash = %identity, cursor = %cursor, "cursor written");
        Ok(())
    }

    async fn commit(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        self.apply_ops(&mut tx, ops).await?;

        sqlx::query(&format!("DELETE FROM {HISTORY_TABLE} WHERE block_num <= ?1"))
            .bind(final_block as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage("prune history"))?;

        update_cursor(&mut tx, identity, cursor).await?;
        tx.commit().await.map_err(storage("commit"))?;
        Ok(())
    }

    async fn revert(
        &self,
        ops: &[PendingOp],
        identity: &StreamIdentity,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        self.apply_ops(&mut tx, ops).await?;
        self.unwind_above(&mut tx, last_valid_block).await?;
        update_cursor(&mut tx, identity, cursor).await?;

        tx.commit().await.map_err(storage("commit revert"))?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
