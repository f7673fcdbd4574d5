//! SQL generation shared by the SQL backends.
//!
//! Statements are rendered with placeholders and returned together with the
//! values to bind, in placeholder order. Each backend binds them with its own
//! driver types.

use chainsink_core::buffer::PendingOp;
use chainsink_core::convert::Value;
use chainsink_core::schema::{ColumnInfo, TableInfo};

/// Name of the table holding one cursor row per stream identity.
pub const CURSORS_TABLE: &str = "cursors";
/// Name of the table holding previous-row images of reversible mutations.
pub const HISTORY_TABLE: &str = "substreams_history";

/// Vendor-specific parts of statement generation.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Fully qualified, quoted table reference.
    fn table_ref(&self, table: &str) -> String {
        self.quote_identifier(table)
    }

    /// Expression binding parameter `index` for `column` of `table`.
    fn value_expr(&self, index: usize, _table: &str, _column: &ColumnInfo) -> String {
        self.placeholder(index)
    }
}

/// A rendered statement and the values it binds.
#[derive(Debug)]
pub struct Statement<'a> {
    pub sql: String,
    pub binds: Vec<&'a Value>,
}

struct Builder<'d, 'a> {
    dialect: &'d dyn SqlDialect,
    info: &'a TableInfo,
    binds: Vec<&'a Value>,
}

impl<'d, 'a> Builder<'d, 'a> {
    fn new(dialect: &'d dyn SqlDialect, info: &'a TableInfo) -> Self {
        Self {
            dialect,
            info,
            binds: Vec::new(),
        }
    }

    fn bind(&mut self, column: &str, value: &'a Value) -> String {
        self.binds.push(value);
        let index = self.binds.len();
        match self.info.get(column) {
            Some(col) => self.dialect.value_expr(index, &self.info.name, col),
            None => self.dialect.placeholder(index),
        }
    }

    fn key_condition(&mut self, op: &'a PendingOp) -> String {
        op.key
            .iter()
            .map(|(column, value)| {
                let expr = self.bind(column, value);
                format!("{} = {expr}", self.dialect.quote_identifier(column))
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn finish(self, sql: String) -> Statement<'a> {
        Statement {
            sql,
            binds: self.binds,
        }
    }
}

/// `INSERT INTO t (key..., values...) VALUES (...)`
pub fn insert<'a>(dialect: &dyn SqlDialect, info: &'a TableInfo, op: &'a PendingOp) -> Statement<'a> {
    let mut b = Builder::new(dialect, info);
    let (columns, exprs): (Vec<String>, Vec<String>) = op
        .all_columns()
        .map(|(column, value)| (dialect.quote_identifier(column), b.bind(column, value)))
        .unzip();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.table_ref(&info.name),
        columns.join(", "),
        exprs.join(", ")
    );
    b.finish(sql)
}

/// `UPDATE t SET ... WHERE key`. Without values, the key column is assigned to
/// itself so the statement still reports whether the row exists.
pub fn update<'a>(dialect: &dyn SqlDialect, info: &'a TableInfo, op: &'a PendingOp) -> Statement<'a> {
    let mut b = Builder::new(dialect, info);
    let assignments = if op.values.is_empty() {
        op.key
            .iter()
            .map(|(column, _)| {
                let q = dialect.quote_identifier(column);
                format!("{q} = {q}")
            })
            .collect::<Vec<_>>()
    } else {
        op.values
            .iter()
            .map(|(column, value)| {
                format!("{} = {}", dialect.quote_identifier(column), b.bind(column, value))
            })
            .collect::<Vec<_>>()
    };
    let condition = b.key_condition(op);
    let sql = format!(
        "UPDATE {} SET {} WHERE {condition}",
        dialect.table_ref(&info.name),
        assignments.join(", ")
    );
    b.finish(sql)
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE SET ...`
pub fn upsert<'a>(dialect: &dyn SqlDialect, info: &'a TableInfo, op: &'a PendingOp) -> Statement<'a> {
    let inserted = insert(dialect, info, op);
    let conflict = op
        .key
        .iter()
        .map(|(column, _)| dialect.quote_identifier(column))
        .collect::<Vec<_>>()
        .join(", ");
    let action = if op.values.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets = op
            .values
            .keys()
            .map(|column| {
                let q = dialect.quote_identifier(column);
                format!("{q} = excluded.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {sets}")
    };
    Statement {
        sql: format!("{} ON CONFLICT ({conflict}) {action}", inserted.sql),
        binds: inserted.binds,
    }
}

/// `DELETE FROM t WHERE key`
pub fn delete<'a>(dialect: &dyn SqlDialect, info: &'a TableInfo, op: &'a PendingOp) -> Statement<'a> {
    let mut b = Builder::new(dialect, info);
    let condition = b.key_condition(op);
    let sql = format!("DELETE FROM {} WHERE {condition}", dialect.table_ref(&info.name));
    b.finish(sql)
}

/// `WHERE key` fragment with placeholders starting after `offset` binds.
pub fn key_condition<'a>(
    dialect: &dyn SqlDialect,
    info: &'a TableInfo,
    op: &'a PendingOp,
    offset: usize,
) -> Statement<'a> {
    let sql = op
        .key
        .iter()
        .enumerate()
        .map(|(i, (column, _))| {
            let index = offset + i + 1;
            let expr = match info.get(column) {
                Some(col) => dialect.value_expr(index, &info.name, col),
                None => dialect.placeholder(index),
            };
            format!("{} = {expr}", dialect.quote_identifier(column))
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    Statement {
        sql,
        binds: op.key.iter().map(|(_, v)| v).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsink_core::buffer::OpKind;
    use chainsink_core::convert::ColumnType;
    use std::collections::BTreeMap;

    struct Numbered;

    impl SqlDialect for Numbered {
        fn name(&self) -> &'static str {
            "Numbered"
        }

        fn placeholder(&self, index: usize) -> String {
            format!("${index}")
        }
    }

    fn info() -> TableInfo {
        TableInfo::new("transfers")
            .primary_key(["log_index", "tx_hash"])
            .column(ColumnInfo::new("tx_hash", ColumnType::Text).not_null())
            .column(ColumnInfo::new("log_index", ColumnType::Integer).not_null())
            .column(ColumnInfo::new("amount", ColumnType::Float))
    }

    fn op(kind: OpKind, with_values: bool) -> PendingOp {
        PendingOp {
            kind,
            table: "transfers".into(),
            raw_key: BTreeMap::from([
                ("log_index".to_string(), "1".to_string()),
                ("tx_hash".to_string(), "0xa".to_string()),
            ]),
            key: vec![
                ("log_index".into(), Value::Int(1)),
                ("tx_hash".into(), Value::Text("0xa".into())),
            ],
            values: if with_values {
                BTreeMap::from([("amount".to_string(), Value::Float(2.5))])
            } else {
                BTreeMap::new()
            },
            reversible_block: None,
        }
    }

    #[test]
    fn insert_lists_key_then_values() {
        let info = info();
        let op = op(OpKind::Insert, true);
        let stmt = insert(&Numbered, &info, &op);
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "transfers" ("log_index", "tx_hash", "amount") VALUES ($1, $2, $3)"#
        );
        assert_eq!(stmt.binds, vec![&Value::Int(1), &Value::Text("0xa".into()), &Value::Float(2.5)]);
    }

    #[test]
    fn update_sets_values_then_filters_by_key() {
        let info = info();
        let op = op(OpKind::Update, true);
        let stmt = update(&Numbered, &info, &op);
        assert_eq!(
            stmt.sql,
            r#"UPDATE "transfers" SET "amount" = $1 WHERE "log_index" = $2 AND "tx_hash" = $3"#
        );
        assert_eq!(stmt.binds.len(), 3);
    }

    #[test]
    fn update_without_values_still_matches_row() {
        let info = info();
        let op = op(OpKind::Update, false);
        let stmt = update(&Numbered, &info, &op);
        assert!(stmt.sql.contains(r#"SET "log_index" = "log_index", "tx_hash" = "tx_hash""#));
        assert_eq!(stmt.binds.len(), 2);
    }

    #[test]
    fn upsert_conflict_clause() {
        let info = info();
        let op = op(OpKind::Upsert, true);
        let stmt = upsert(&Numbered, &info, &op);
        assert!(stmt
            .sql
            .ends_with(r#"ON CONFLICT ("log_index", "tx_hash") DO UPDATE SET "amount" = excluded."amount""#));
    }

    #[test]
    fn delete_and_offset_condition() {
        let info = info();
        let op = op(OpKind::Delete, false);
        assert_eq!(
            delete(&Numbered, &info, &op).sql,
            r#"DELETE FROM "transfers" WHERE "log_index" = $1 AND "tx_hash" = $2"#
        );
        assert_eq!(
            key_condition(&Numbered, &info, &op, 3).sql,
            r#""log_index" = $4 AND "tx_hash" = $5"#
        );
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(Numbered.quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }
}
