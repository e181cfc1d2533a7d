use redb::WriteTransaction;
use std::sync::Arc;

use crate::error::AppError;
use crate::filter::FilterExpression;
use crate::model::Row;
use crate::storage::{DocumentStore, Mutation, Storage, WriteSet};

#[derive(Clone)]
pub struct RedbDocumentStore {
    storage: Arc<Storage>,
}

impl RedbDocumentStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        RedbDocumentStore { storage }
    }

    fn stage(tx: &WriteTransaction, mutation: &Mutation) -> Result<(), AppError> {
        let partition = mutation.partition();
        let row = mutation.row();
        let current: Option<Row> = Storage::load_doc(tx, partition, &row.id)?;
        match (mutation, current) {
            (Mutation::Insert { .. }, Some(_)) => {
                return Err(AppError::RowExists(format!("row '{}' already exists in '{}'", row.id, partition)));
            }
            (Mutation::Replace { .. }, None) => {
                return Err(AppError::RowMissing(format!("row '{}' no longer exists in '{}'", row.id, partition)));
            }
            (Mutation::Replace { expected_revision, .. }, Some(stored)) if stored.revision != *expected_revision => {
                return Err(AppError::Conflict(format!(
                    "row '{}' in '{}' is at revision {}, write expected {}",
                    row.id, partition, stored.revision, expected_revision
                )));
            }
            _ => {}
        }
        Storage::put_doc(tx, partition, &row.id, row)
    }
}

impl DocumentStore for RedbDocumentStore {
    fn get(&self, partition: &str, id: &str) -> Result<Option<Row>, AppError> {
        let tx = self.storage.db.begin_read()?;
        Storage::read_doc(&tx, partition, id)
    }

    fn get_many(&self, partition: &str, ids: &[String]) -> Result<Vec<Row>, AppError> {
        let tx = self.storage.db.begin_read()?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = Storage::read_doc(&tx, partition, id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn scan(&self, partition: &str, filter: &FilterExpression) -> Result<Vec<Row>, AppError> {
        let tx = self.storage.db.begin_read()?;
        let rows: Vec<Row> = Storage::scan_docs(&tx, partition)?;
        Ok(rows.into_iter().filter(|row| filter.matches(row)).collect())
    }

    fn apply(&self, writes: WriteSet) -> Result<(), AppError> {
        if writes.is_empty() {
            return Ok(());
        }
        let tx = self.storage.db.begin_write()?;
        for mutation in writes.mutations() {
            if let Err(e) = Self::stage(&tx, mutation) {
                tx.abort()?;
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use serde_json::{json, Map, Value};

    fn store() -> RedbDocumentStore {
        RedbDocumentStore::new(Storage::temp("document_store").unwrap())
    }

    fn row(attrs: Value) -> Row {
        let map: Map<String, Value> = serde_json::from_value(attrs).unwrap();
        Row::new(map, None)
    }

    #[test]
    fn insert_get_and_scan() {
        let store = store();
        let chair = row(json!({"name": "Chair"}));
        let table = row(json!({"name": "Table"}));
        let mut writes = WriteSet::new();
        writes.insert("tbl_products", chair.clone());
        writes.insert("tbl_products", table.clone());
        store.apply(writes).unwrap();

        assert_eq!(store.get("tbl_products", &chair.id).unwrap(), Some(chair.clone()));
        let found = store.scan("tbl_products", &FilterExpression::field("name", FilterOp::contains("tab"))).unwrap();
        assert_eq!(found, vec![table.clone()]);
        let many = store.get_many("tbl_products", &[table.id.clone(), "missing".into(), chair.id.clone()]).unwrap();
        assert_eq!(many.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![table.id, chair.id]);
    }

    #[test]
    fn failed_write_set_leaves_nothing_behind() {
        let store = store();
        let existing = row(json!({"name": "old"}));
        let mut first = WriteSet::new();
        first.insert("tbl_products", existing.clone());
        store.apply(first).unwrap();

        let fresh = row(json!({"sku": "V1"}));
        let mut writes = WriteSet::new();
        writes.insert("tbl_variants", fresh.clone());
        writes.insert("tbl_products", existing.clone());
        let err = store.apply(writes).unwrap_err();
        assert!(matches!(err, AppError::RowExists(_)));
        assert!(store.get("tbl_variants", &fresh.id).unwrap().is_none());
    }

    #[test]
    fn stale_revision_is_rejected() {
        let store = store();
        let original = row(json!({"name": "Chair"}));
        let mut writes = WriteSet::new();
        writes.insert("tbl_products", original.clone());
        store.apply(writes).unwrap();

        let mut first = original.clone();
        first.merge(serde_json::from_value(json!({"name": "Stool"})).unwrap());
        let mut writes = WriteSet::new();
        writes.replace("tbl_products", first, original.revision);
        store.apply(writes).unwrap();

        let mut second = original.clone();
        second.merge(serde_json::from_value(json!({"name": "Bench"})).unwrap());
        let mut writes = WriteSet::new();
        writes.replace("tbl_products", second, original.revision);
        assert!(matches!(store.apply(writes), Err(AppError::Conflict(_))));
        assert_eq!(store.get("tbl_products", &original.id).unwrap().unwrap().attributes["name"], json!("Stool"));
    }

    #[test]
    fn replacing_a_vanished_row_is_not_a_stale_revision() {
        let store = store();
        let ghost = row(json!({"name": "Ghost"}));
        let mut writes = WriteSet::new();
        writes.replace("tbl_products", ghost.clone(), ghost.revision);
        assert!(matches!(store.apply(writes), Err(AppError::RowMissing(_))));
        assert!(store.get("tbl_products", &ghost.id).unwrap().is_none());
    }

    #[test]
    fn sequential_replaces_of_one_row_in_a_write_set() {
        let store = store();
        let mut variant = row(json!({"sku": "V1"}));
        let mut writes = WriteSet::new();
        writes.insert("tbl_variants", variant.clone());
        store.apply(writes).unwrap();

        let mut writes = WriteSet::new();
        let base = variant.revision;
        variant.merge(serde_json::from_value(json!({"sku": "V2"})).unwrap());
        writes.replace("tbl_variants", variant.clone(), base);
        variant.merge(serde_json::from_value(json!({"sku": "V3"})).unwrap());
        writes.replace("tbl_variants", variant.clone(), base + 1);
        store.apply(writes).unwrap();
        let stored = store.get("tbl_variants", &variant.id).unwrap().unwrap();
        assert_eq!(stored.attributes["sku"], json!("V3"));
        assert_eq!(stored.revision, 3);
    }
}
