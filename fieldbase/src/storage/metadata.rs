//! Table and field definitions, stored as JSON documents next to the row partitions.
//!
//! Lookups hide soft-deleted definitions. Every field change recompiles and persists the table's
//! schema snapshot inside the same write transaction.

use chrono::Utc;
use redb::WriteTransaction;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, EngineError, Violation};
use crate::info;
use crate::model::{
    new_id, slugify, FieldConfig, FieldDescriptor, FieldKind, LifecycleScripts, TableConfig, TableDefinition, TableKind,
    RESERVED_ATTRIBUTES,
};
use crate::schema;
use crate::storage::Storage;

const TABLE_PARTITION: &str = "sys_tables";
const FIELD_PARTITION: &str = "sys_fields";

/// Read side consumed by the engine.
pub trait MetadataStore: Send + Sync {
    fn table_by_slug(&self, slug: &str) -> Result<Option<TableDefinition>, AppError>;

    fn table_by_id(&self, id: &str) -> Result<Option<TableDefinition>, AppError>;

    /// Active fields for the given ids, in the order given.
    fn fields_by_ids(&self, ids: &[String]) -> Result<Vec<FieldDescriptor>, AppError>;
}

/// Write side used by table administrators.
pub trait MetadataAdmin: Send + Sync {
    fn create_table(&self, new_table: NewTable) -> Result<TableDefinition, EngineError>;

    fn create_field(&self, table_slug: &str, new_field: NewField) -> Result<FieldDescriptor, EngineError>;

    fn set_scripts(&self, table_slug: &str, scripts: LifecycleScripts) -> Result<TableDefinition, EngineError>;

    fn trash_table(&self, slug: &str) -> Result<TableDefinition, EngineError>;

    fn trash_field(&self, table_slug: &str, field_slug: &str) -> Result<TableDefinition, EngineError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTable {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub kind: TableKind,
    #[serde(default)]
    pub config: TableConfig,
    #[serde(default)]
    pub scripts: LifecycleScripts,
}

impl NewTable {
    pub fn named(name: impl Into<String>) -> Self {
        NewTable { name: name.into(), ..NewTable::default() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewField {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    pub kind: FieldKind,
    #[serde(default)]
    pub config: FieldConfig,
}

impl NewField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        NewField { name: name.into(), slug: None, kind, config: FieldConfig::default() }
    }

    pub fn with_config(mut self, config: FieldConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone)]
pub struct RedbMetadataStore {
    storage: Arc<Storage>,
}

impl RedbMetadataStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        RedbMetadataStore { storage }
    }

    fn active_table_in(tx: &WriteTransaction, slug: &str) -> Result<Option<TableDefinition>, AppError> {
        let tables: Vec<TableDefinition> = Storage::load_all(tx, TABLE_PARTITION)?;
        Ok(tables.into_iter().find(|t| !t.trashed && t.slug == slug))
    }

    fn fields_in(tx: &WriteTransaction, table: &TableDefinition) -> Result<Vec<FieldDescriptor>, AppError> {
        let mut fields = Vec::with_capacity(table.fields.len());
        for id in &table.fields {
            if let Some(field) = Storage::load_doc::<FieldDescriptor>(tx, FIELD_PARTITION, id)? {
                fields.push(field);
            }
        }
        Ok(fields)
    }

    fn recompile(tx: &WriteTransaction, table: &mut TableDefinition) -> Result<(), AppError> {
        let fields = Self::fields_in(tx, table)?;
        table.schema = Some(schema::compile(&fields));
        table.updated_at = Utc::now();
        Storage::put_doc(tx, TABLE_PARTITION, &table.id, table)
    }

    /// Runs `f` in one write transaction, committing only when it succeeds.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T, EngineError>) -> Result<T, EngineError> {
        let tx = self.storage.db.begin_write().map_err(AppError::from)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(AppError::from)?;
                Ok(value)
            }
            Err(e) => {
                tx.abort().map_err(AppError::from)?;
                Err(e)
            }
        }
    }
}

fn require_table(tx: &WriteTransaction, slug: &str) -> Result<TableDefinition, EngineError> {
    RedbMetadataStore::active_table_in(tx, slug)?.ok_or_else(|| EngineError::table_not_found(slug))
}

impl MetadataStore for RedbMetadataStore {
    fn table_by_slug(&self, slug: &str) -> Result<Option<TableDefinition>, AppError> {
        let tx = self.storage.db.begin_read()?;
        let tables: Vec<TableDefinition> = Storage::scan_docs(&tx, TABLE_PARTITION)?;
        Ok(tables.into_iter().find(|t| !t.trashed && t.slug == slug))
    }

    fn table_by_id(&self, id: &str) -> Result<Option<TableDefinition>, AppError> {
        let tx = self.storage.db.begin_read()?;
        let table: Option<TableDefinition> = Storage::read_doc(&tx, TABLE_PARTITION, id)?;
        Ok(table.filter(|t| !t.trashed))
    }

    fn fields_by_ids(&self, ids: &[String]) -> Result<Vec<FieldDescriptor>, AppError> {
        let tx = self.storage.db.begin_read()?;
        let mut fields = Vec::with_capacity(ids.len());
        for id in ids {
            match Storage::read_doc::<FieldDescriptor>(&tx, FIELD_PARTITION, id)? {
                Some(field) if !field.trashed => fields.push(field),
                _ => {}
            }
        }
        Ok(fields)
    }
}

impl MetadataAdmin for RedbMetadataStore {
    fn create_table(&self, new_table: NewTable) -> Result<TableDefinition, EngineError> {
        let slug = slugify(new_table.slug.as_deref().unwrap_or(&new_table.name), "table");
        self.write(|tx| {
            if Self::active_table_in(tx, &slug)?.is_some() {
                return Err(EngineError::duplicate_slug(&slug));
            }
            let now = Utc::now();
            let table = TableDefinition {
                id: new_id(),
                name: new_table.name,
                slug,
                kind: new_table.kind,
                fields: Vec::new(),
                config: new_table.config,
                scripts: new_table.scripts,
                schema: Some(schema::compile(&[])),
                trashed: false,
                trashed_at: None,
                created_at: now,
                updated_at: now,
            };
            Storage::put_doc(tx, TABLE_PARTITION, &table.id, &table)?;
            info!("Created table '{}' ({})", table.slug, table.id);
            Ok(table)
        })
    }

    fn create_field(&self, table_slug: &str, new_field: NewField) -> Result<FieldDescriptor, EngineError> {
        let slug = slugify(new_field.slug.as_deref().unwrap_or(&new_field.name), "field");
        if RESERVED_ATTRIBUTES.contains(&slug.as_str()) {
            return Err(EngineError::invalid_payload(vec![Violation { field: slug, reason: "slug is reserved".to_string() }]));
        }
        self.write(|tx| {
            let mut table = require_table(tx, table_slug)?;
            let existing = Self::fields_in(tx, &table)?;
            if existing.iter().any(|f| !f.trashed && f.slug == slug) {
                return Err(EngineError::duplicate_slug(&slug));
            }
            if new_field.kind == FieldKind::FieldGroup {
                let sub_table = new_field.config.sub_table.as_deref().unwrap_or_default();
                let found: Option<TableDefinition> = Storage::load_doc(tx, TABLE_PARTITION, sub_table)?;
                if !found.is_some_and(|t| !t.trashed) {
                    return Err(EngineError::sub_table_not_found(&slug));
                }
            }
            let now = Utc::now();
            let field = FieldDescriptor {
                id: new_id(),
                name: new_field.name,
                slug,
                kind: new_field.kind,
                config: new_field.config,
                trashed: false,
                trashed_at: None,
                created_at: now,
                updated_at: now,
            };
            Storage::put_doc(tx, FIELD_PARTITION, &field.id, &field)?;
            table.fields.push(field.id.clone());
            Self::recompile(tx, &mut table)?;
            info!("Added field '{}' ({:?}) to table '{}'", field.slug, field.kind, table.slug);
            Ok(field)
        })
    }

    fn set_scripts(&self, table_slug: &str, scripts: LifecycleScripts) -> Result<TableDefinition, EngineError> {
        self.write(|tx| {
            let mut table = require_table(tx, table_slug)?;
            table.scripts = scripts;
            table.updated_at = Utc::now();
            Storage::put_doc(tx, TABLE_PARTITION, &table.id, &table)?;
            Ok(table)
        })
    }

    fn trash_table(&self, slug: &str) -> Result<TableDefinition, EngineError> {
        self.write(|tx| {
            let mut table = require_table(tx, slug)?;
            let now = Utc::now();
            table.trashed = true;
            table.trashed_at = Some(now);
            table.updated_at = now;
            Storage::put_doc(tx, TABLE_PARTITION, &table.id, &table)?;
            Ok(table)
        })
    }

    fn trash_field(&self, table_slug: &str, field_slug: &str) -> Result<TableDefinition, EngineError> {
        self.write(|tx| {
            let mut table = require_table(tx, table_slug)?;
            let fields = Self::fields_in(tx, &table)?;
            let Some(mut field) = fields.into_iter().find(|f| !f.trashed && f.slug == field_slug) else {
                return Err(EngineError::NotFound { code: "FIELD_NOT_FOUND", message: format!("field '{}' not found in table '{}'", field_slug, table_slug) });
            };
            let now = Utc::now();
            field.trashed = true;
            field.trashed_at = Some(now);
            field.updated_at = now;
            Storage::put_doc(tx, FIELD_PARTITION, &field.id, &field)?;
            Self::recompile(tx, &mut table)?;
            Ok(table)
        })
    }
}
