pub mod document;
pub mod metadata;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

use crate::error::AppError;
use crate::filter::FilterExpression;
use crate::info;
use crate::model::Row;
use crate::settings::StorageSettings;

pub use document::RedbDocumentStore;
pub use metadata::{MetadataAdmin, MetadataStore, NewField, NewTable, RedbMetadataStore};

/// Every partition is a `&str -> &str` redb table holding JSON documents keyed by id.
pub(crate) fn partition_def(name: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(name)
}

#[derive(Clone)]
pub struct Storage {
    pub db: Arc<Database>,
}

impl Storage {
    pub fn open(settings: &StorageSettings) -> Result<Arc<Storage>, AppError> {
        Self::init(PathBuf::from(&settings.db_path), settings.db_cache_size_mb)
    }

    pub fn temp(name: &str) -> Result<Arc<Storage>, AppError> {
        let db_name = format!("{}_{}", name, rand::random::<u64>());
        let db_path = env::temp_dir().join(format!("{}/{}", "fieldbase", db_name));
        if db_path.exists() {
            fs::remove_dir_all(&db_path)?;
        }
        Self::init(db_path, 16)
    }

    fn init(db_dir: PathBuf, db_cache_size_mb: usize) -> Result<Arc<Storage>, AppError> {
        let db_path = db_dir.join("fieldbase.db");
        let db = if !db_path.exists() {
            fs::create_dir_all(&db_dir)?;
            Database::builder().set_cache_size(db_cache_size_mb * 1024 * 1024).create(&db_path)?
        } else {
            info!("Opening existing db at {:?}, it might take a while in case previous process was killed", db_path);
            Database::builder().set_cache_size(db_cache_size_mb * 1024 * 1024).open(&db_path)?
        };
        Ok(Arc::new(Storage { db: Arc::new(db) }))
    }

    /// Reads one document; a partition that was never written to reads as empty.
    pub(crate) fn read_doc<T: DeserializeOwned>(tx: &ReadTransaction, partition: &str, key: &str) -> Result<Option<T>, AppError> {
        let table = match tx.open_table(partition_def(partition)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc = match table.get(key)? {
            Some(guard) => Some(serde_json::from_str(guard.value())?),
            None => None,
        };
        Ok(doc)
    }

    pub(crate) fn scan_docs<T: DeserializeOwned>(tx: &ReadTransaction, partition: &str) -> Result<Vec<T>, AppError> {
        let table = match tx.open_table(partition_def(partition)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Self::collect_docs(&table)
    }

    fn collect_docs<T: DeserializeOwned>(table: &impl ReadableTable<&'static str, &'static str>) -> Result<Vec<T>, AppError> {
        let mut docs = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            docs.push(serde_json::from_str(value.value())?);
        }
        Ok(docs)
    }

    pub(crate) fn load_all<T: DeserializeOwned>(tx: &WriteTransaction, partition: &str) -> Result<Vec<T>, AppError> {
        let table = tx.open_table(partition_def(partition))?;
        Self::collect_docs(&table)
    }

    pub(crate) fn load_doc<T: DeserializeOwned>(tx: &WriteTransaction, partition: &str, key: &str) -> Result<Option<T>, AppError> {
        let table = tx.open_table(partition_def(partition))?;
        let doc = match table.get(key)? {
            Some(guard) => Some(serde_json::from_str(guard.value())?),
            None => None,
        };
        Ok(doc)
    }

    pub(crate) fn put_doc<T: Serialize>(tx: &WriteTransaction, partition: &str, key: &str, doc: &T) -> Result<(), AppError> {
        let json = serde_json::to_string(doc)?;
        let mut table = tx.open_table(partition_def(partition))?;
        table.insert(key, json.as_str())?;
        Ok(())
    }
}

/// One staged change to a partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Fails if the id is already present.
    Insert { partition: String, row: Row },
    /// Fails unless the stored revision equals `expected_revision`.
    Replace { partition: String, row: Row, expected_revision: u64 },
}

impl Mutation {
    pub fn partition(&self) -> &str {
        match self {
            Mutation::Insert { partition, .. } | Mutation::Replace { partition, .. } => partition,
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            Mutation::Insert { row, .. } | Mutation::Replace { row, .. } => row,
        }
    }
}

/// Mutations of one logical write, applied all-or-nothing in staging order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    mutations: Vec<Mutation>,
}

impl WriteSet {
    pub fn new() -> Self {
        WriteSet::default()
    }

    pub fn insert(&mut self, partition: impl Into<String>, row: Row) {
        self.mutations.push(Mutation::Insert { partition: partition.into(), row });
    }

    pub fn replace(&mut self, partition: impl Into<String>, row: Row, expected_revision: u64) {
        self.mutations.push(Mutation::Replace { partition: partition.into(), row, expected_revision });
    }

    /// Latest staged version of a row, so later steps of the same write see earlier ones.
    pub fn staged(&self, partition: &str, id: &str) -> Option<&Row> {
        self.mutations.iter().rev().map(|m| (m.partition(), m.row())).find(|(p, row)| *p == partition && row.id == id).map(|(_, row)| row)
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Partition-scoped document access.
pub trait DocumentStore: Send + Sync {
    fn get(&self, partition: &str, id: &str) -> Result<Option<Row>, AppError>;

    /// Rows for the given ids in the given order; missing ids are skipped.
    fn get_many(&self, partition: &str, ids: &[String]) -> Result<Vec<Row>, AppError>;

    fn scan(&self, partition: &str, filter: &FilterExpression) -> Result<Vec<Row>, AppError>;

    fn apply(&self, writes: WriteSet) -> Result<(), AppError>;
}
