//! Change-set applier — turns one block's table changes into buffered loader
//! mutations.

use std::collections::BTreeMap;

use crate::error::{Result, SinkError};
use crate::loader::{Loader, Store};
use crate::types::{DatabaseChanges, Operation, PrimaryKey};

/// Apply every table change of a block, in order.
///
/// A change is reversible when `block_number > final_block_height`. If any
/// change fails, the loader buffer is rolled back to its state before the
/// block so a half-applied block can never be flushed.
pub fn apply_database_changes<S: Store>(
    loader: &mut Loader<S>,
    changes: &DatabaseChanges,
    block_number: u64,
    final_block_height: u64,
) -> Result<()> {
    let mark = loader.mark();
    let result = apply_all(loader, changes, block_number, final_block_height);
    if result.is_err() {
        loader.rollback_to(mark);
    }
    result
}

fn apply_all<S: Store>(
    loader: &mut Loader<S>,
    changes: &DatabaseChanges,
    block_number: u64,
    final_block_height: u64,
) -> Result<()> {
    let reversible_block = (block_number > final_block_height).then_some(block_number);

    for change in &changes.table_changes {
        if !loader.has_table(&change.table) {
            return Err(SinkError::Schema {
                table: change.table.clone(),
                identifier: loader.identifier(),
                available: loader.available_tables().join(", "),
            });
        }

        let primary_key = match &change.primary_key {
            Some(PrimaryKey::Pk(key)) => loader.primary_key(&change.table, key)?,
            Some(PrimaryKey::CompositePk(keys)) => {
                loader.check_composite_key(&change.table, keys)?;
                keys.clone()
            }
            None => {
                return Err(SinkError::KeyResolution {
                    table: change.table.clone(),
                    reason: "change carries no primary key".into(),
                })
            }
        };

        // Upstream emits at most one mutation per column; last one wins anyway.
        let fields: BTreeMap<String, String> = change
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.new_value.clone()))
            .collect();

        match change.operation {
            Operation::Create => loader.insert(&change.table, primary_key, fields, reversible_block)?,
            Operation::Update => loader.update(&change.table, primary_key, fields, reversible_block)?,
            Operation::Delete => loader.delete(&change.table, primary_key, reversible_block)?,
            Operation::Unset => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OpKind;
    use crate::config::UpdateMissingRow;
    use crate::convert::Value;
    use crate::testing::RecordingStore;
    use crate::types::TableChange;

    fn loader() -> Loader<RecordingStore> {
        Loader::new(RecordingStore::new(), 0, UpdateMissingRow::Fail)
    }

    fn changes(list: Vec<TableChange>) -> DatabaseChanges {
        DatabaseChanges {
            table_changes: list,
        }
    }

    #[test]
    fn reversibility_follows_final_height() {
        let mut loader = loader();
        let create = TableChange::new("accounts", PrimaryKey::Pk("alice".into()), Operation::Create)
            .field("balance", "10");

        apply_database_changes(&mut loader, &changes(vec![create.clone()]), 100, 100).unwrap();
        apply_database_changes(&mut loader, &changes(vec![create]), 101, 100).unwrap();

        let ops = loader.pending();
        assert_eq!(ops[0].reversible_block, None);
        assert_eq!(ops[1].reversible_block, Some(101));
    }

    #[test]
    fn dispatches_by_operation() {
        let mut loader = loader();
        let list = vec![
            TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Create)
                .field("balance", "1"),
            TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Update)
                .field("balance", "2"),
            TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Unset),
            TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Delete),
        ];
        apply_database_changes(&mut loader, &changes(list), 5, 0).unwrap();

        let kinds: Vec<OpKind> = loader.pending().iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OpKind::Insert, OpKind::Update, OpKind::Delete]);
    }

    #[test]
    fn last_field_write_wins() {
        let mut loader = loader();
        let change = TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Create)
            .field("balance", "1")
            .field("balance", "7");
        apply_database_changes(&mut loader, &changes(vec![change]), 5, 0).unwrap();
        assert_eq!(
            loader.pending()[0].values["balance"],
            Value::Text("7".into())
        );
    }

    #[test]
    fn unknown_table_is_schema_error() {
        let mut loader = loader();
        let change = TableChange::new("nope", PrimaryKey::Pk("a".into()), Operation::Create);
        let err = apply_database_changes(&mut loader, &changes(vec![change]), 5, 0).unwrap_err();
        assert!(err.is_schema());
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("accounts, transfers"));
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let mut loader = loader();
        let mut change = TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Create);
        change.primary_key = None;
        let err = apply_database_changes(&mut loader, &changes(vec![change]), 5, 0).unwrap_err();
        assert!(matches!(err, SinkError::KeyResolution { .. }));
    }

    #[test]
    fn failed_block_leaves_no_partial_rows() {
        let mut loader = loader();
        let ok = TableChange::new("accounts", PrimaryKey::Pk("a".into()), Operation::Create)
            .field("balance", "1");
        apply_database_changes(&mut loader, &changes(vec![ok.clone()]), 4, 0).unwrap();

        let bad = TableChange::new("accounts", PrimaryKey::Pk("b".into()), Operation::Create);
        let err = apply_database_changes(&mut loader, &changes(vec![ok, bad]), 5, 0).unwrap_err();
        assert!(err.to_string().contains("missing required column(s): balance"));
        assert_eq!(loader.pending_rows(), 1);
    }

    #[test]
    fn composite_key_passes_through() {
        let mut loader = loader();
        let keys = BTreeMap::from([
            ("tx_hash".to_string(), "0xabc".to_string()),
            ("log_index".to_string(), "3".to_string()),
        ]);
        let change = TableChange::new("transfers", PrimaryKey::CompositePk(keys), Operation::Create)
            .field("amount", "12.5");
        apply_database_changes(&mut loader, &changes(vec![change]), 5, 0).unwrap();

        let op = &loader.pending()[0];
        assert_eq!(
            op.key,
            vec![
                ("log_index".to_string(), Value::Int(3)),
                ("tx_hash".to_string(), Value::Text("0xabc".into())),
            ]
        );
        assert_eq!(op.values["amount"], Value::Float(12.5));
    }

    #[test]
    fn conversion_error_names_column() {
        let mut loader = loader();
        let keys = BTreeMap::from([
            ("tx_hash".to_string(), "0xabc".to_string()),
            ("log_index".to_string(), "three".to_string()),
        ]);
        let change = TableChange::new("transfers", PrimaryKey::CompositePk(keys), Operation::Create);
        let err = apply_database_changes(&mut loader, &changes(vec![change]), 5, 0).unwrap_err();
        assert!(err.is_conversion());
        assert!(err.to_string().contains("transfers.log_index"));
        assert!(err.to_string().contains("three"));
    }
}
