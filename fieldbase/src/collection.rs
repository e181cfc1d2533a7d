//! Collection binder: joins a table's metadata to its partition.
//!
//! Binding reads metadata but never writes it. Reference targets are looked up by table id at bind
//! time, so a renamed target is picked up by the next bind without touching its dependents.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{AppError, EngineError};
use crate::filter::{FilterExpression, OrderExpression};
use crate::model::{Actor, FieldDescriptor, Row, TableDefinition};
use crate::registry;
use crate::schema::{self, AttributeShape, ReferenceTarget, SchemaAttribute, SchemaSnapshot};
use crate::storage::{DocumentStore, MetadataStore, WriteSet};
use crate::warn;

/// A resolved relationship or field-group target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub table_id: String,
    pub table_slug: String,
    pub partition: String,
    /// Attribute of the target shown in place of the id, if one could be determined.
    pub display_slug: Option<String>,
    /// Live attribute slugs of the target at bind time.
    pub slugs: Vec<String>,
}

#[derive(Clone)]
pub struct Binder {
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn DocumentStore>,
}

impl Binder {
    pub fn new(metadata: Arc<dyn MetadataStore>, store: Arc<dyn DocumentStore>) -> Self {
        Binder { metadata, store }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    fn resolve_link(&self, table_id: &str, display_field_id: Option<&str>) -> Result<Option<Link>, AppError> {
        let Some(target) = self.metadata.table_by_id(table_id)? else {
            return Ok(None);
        };
        let target_fields = self.metadata.fields_by_ids(&target.fields)?;
        let display_slug = display_field_id
            .and_then(|id| target_fields.iter().find(|f| f.id == id))
            .or_else(|| target_fields.iter().find(|f| registry::spec(f.kind).text_like))
            .map(|f| f.slug.clone());
        let slugs = schema::compile(&target_fields).slugs();
        Ok(Some(Link { table_id: target.id.clone(), table_slug: target.slug.clone(), partition: target.partition(), display_slug, slugs }))
    }

    /// Compiles the schema and resolves every link. Attributes whose target is gone are dropped.
    pub fn bind(&self, table: &TableDefinition, fields: &[FieldDescriptor]) -> Result<CollectionHandle, AppError> {
        let mut schema = schema::compile(fields);
        let mut links = BTreeMap::new();
        let mut unresolved = Vec::new();
        for attr in &schema.attributes {
            let link = match &attr.shape {
                AttributeShape::Reference { target: ReferenceTarget::Table { table_id, display_field_id, .. }, .. } => {
                    self.resolve_link(table_id, display_field_id.as_deref())?
                }
                AttributeShape::EmbeddedRefs { sub_table_id } => self.resolve_link(sub_table_id, None)?,
                _ => continue,
            };
            match link {
                Some(link) => {
                    links.insert(attr.slug.clone(), link);
                }
                None => {
                    warn!("table '{}': target of field '{}' cannot be resolved, field ignored", table.slug, attr.slug);
                    unresolved.push(attr.clone());
                }
            }
        }
        schema.retain(|a| !unresolved.iter().any(|u| u.slug == a.slug));
        Ok(CollectionHandle {
            table: table.clone(),
            fingerprint: schema.fingerprint.clone(),
            schema,
            links,
            unresolved,
            store: Arc::clone(&self.store),
        })
    }
}

/// Runtime binding of one table to its partition.
#[derive(Clone)]
pub struct CollectionHandle {
    table: TableDefinition,
    schema: SchemaSnapshot,
    links: BTreeMap<String, Link>,
    unresolved: Vec<SchemaAttribute>,
    fingerprint: String,
    store: Arc<dyn DocumentStore>,
}

impl CollectionHandle {
    pub fn table(&self) -> &TableDefinition {
        &self.table
    }

    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }

    pub fn partition(&self) -> String {
        self.table.partition()
    }

    pub fn link(&self, slug: &str) -> Option<&Link> {
        self.links.get(slug)
    }

    /// Declared fields left out of the schema because their target could not be resolved.
    pub fn unresolved(&self) -> &[SchemaAttribute] {
        &self.unresolved
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Trashed rows are excluded unless asked for or the filter constrains them itself.
    pub fn find_many(&self, filter: &FilterExpression, order: &OrderExpression, include_trashed: bool) -> Result<Vec<Row>, AppError> {
        let filter = if include_trashed || filter.constrains_trashed() {
            filter.clone()
        } else {
            filter.clone().and(FilterExpression::Trashed(false))
        };
        let mut rows = self.store.scan(&self.partition(), &filter)?;
        order.sort(&mut rows);
        Ok(rows)
    }

    pub fn find_one(&self, id: &str, include_trashed: bool) -> Result<Option<Row>, AppError> {
        let row = self.store.get(&self.partition(), id)?;
        Ok(row.filter(|r| include_trashed || !r.trashed))
    }

    pub fn stage_create(&self, writes: &mut WriteSet, attributes: Map<String, Value>, actor: &Actor) -> Row {
        let row = Row::new(attributes, actor.user_id.clone());
        writes.insert(self.partition(), row.clone());
        row
    }

    /// Written attributes replace same-named ones wholesale.
    pub fn stage_update(&self, writes: &mut WriteSet, mut row: Row, attributes: Map<String, Value>) -> Row {
        let expected = row.revision;
        row.merge(attributes);
        writes.replace(self.partition(), row.clone(), expected);
        row
    }

    pub fn stage_soft_delete(&self, writes: &mut WriteSet, mut row: Row) -> Row {
        let expected = row.revision;
        row.trash();
        writes.replace(self.partition(), row.clone(), expected);
        row
    }

    pub fn stage_restore(&self, writes: &mut WriteSet, mut row: Row) -> Row {
        let expected = row.revision;
        row.restore();
        writes.replace(self.partition(), row.clone(), expected);
        row
    }

    pub fn create(&self, attributes: Map<String, Value>, actor: &Actor) -> Result<Row, AppError> {
        let mut writes = WriteSet::new();
        let row = self.stage_create(&mut writes, attributes, actor);
        self.store.apply(writes)?;
        Ok(row)
    }

    pub fn update(&self, row: Row, attributes: Map<String, Value>) -> Result<Row, AppError> {
        let mut writes = WriteSet::new();
        let row = self.stage_update(&mut writes, row, attributes);
        self.store.apply(writes)?;
        Ok(row)
    }

    pub fn soft_delete(&self, row: Row) -> Result<Row, AppError> {
        let mut writes = WriteSet::new();
        let row = self.stage_soft_delete(&mut writes, row);
        self.store.apply(writes)?;
        Ok(row)
    }

    pub fn apply(&self, writes: WriteSet) -> Result<(), AppError> {
        self.store.apply(writes)
    }
}

/// Handles bound during one engine call, keyed by table id and field fingerprint.
/// Dropped with the call, so metadata edits are always seen by the next one.
pub struct BindingScope<'a> {
    binder: &'a Binder,
    handles: HashMap<(String, String), Arc<CollectionHandle>>,
}

impl<'a> BindingScope<'a> {
    pub fn new(binder: &'a Binder) -> Self {
        BindingScope { binder, handles: HashMap::new() }
    }

    pub fn bind(&mut self, table: &TableDefinition) -> Result<Arc<CollectionHandle>, AppError> {
        let fields = self.binder.metadata.fields_by_ids(&table.fields)?;
        let key = (table.id.clone(), schema::fingerprint(&fields));
        if let Some(handle) = self.handles.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(self.binder.bind(table, &fields)?);
        self.handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn by_slug(&mut self, slug: &str) -> Result<Arc<CollectionHandle>, EngineError> {
        let table = self.binder.metadata.table_by_slug(slug)?.ok_or_else(|| EngineError::table_not_found(slug))?;
        Ok(self.bind(&table)?)
    }

    pub fn by_id(&mut self, table_id: &str) -> Result<Option<Arc<CollectionHandle>>, AppError> {
        match self.binder.metadata.table_by_id(table_id)? {
            Some(table) => self.bind(&table).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use crate::model::{FieldConfig, FieldKind};
    use crate::storage::{MetadataAdmin, NewField, NewTable, RedbDocumentStore, RedbMetadataStore, Storage};
    use serde_json::json;

    struct Fixture {
        metadata: Arc<RedbMetadataStore>,
        binder: Binder,
    }

    fn fixture() -> Fixture {
        let storage = Storage::temp("collection").unwrap();
        let metadata = Arc::new(RedbMetadataStore::new(Arc::clone(&storage)));
        let store = Arc::new(RedbDocumentStore::new(storage));
        let binder = Binder::new(metadata.clone(), store);
        Fixture { metadata, binder }
    }

    fn attrs(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn binding_resolves_links_and_drops_dangling_targets() {
        let f = fixture();
        let makers = f.metadata.create_table(NewTable::named("Makers")).unwrap();
        f.metadata.create_field("makers", NewField::new("Title", FieldKind::ShortText)).unwrap();
        f.metadata.create_table(NewTable::named("Products")).unwrap();
        let to_makers = FieldConfig { target_table: Some(makers.id.clone()), ..FieldConfig::default() };
        f.metadata.create_field("products", NewField::new("Maker", FieldKind::Relationship).with_config(to_makers)).unwrap();
        let to_nowhere = FieldConfig { target_table: Some("gone".into()), ..FieldConfig::default() };
        f.metadata.create_field("products", NewField::new("Ghost", FieldKind::Relationship).with_config(to_nowhere)).unwrap();

        let mut scope = BindingScope::new(&f.binder);
        let handle = scope.by_slug("products").unwrap();
        assert_eq!(handle.schema().slugs(), vec!["maker"]);
        assert_eq!(handle.unresolved().iter().map(|a| a.slug.as_str()).collect::<Vec<_>>(), vec!["ghost"]);
        let link = handle.link("maker").unwrap();
        assert_eq!(link.partition, "tbl_makers");
        assert_eq!(link.display_slug.as_deref(), Some("title"));
    }

    #[test]
    fn scope_reuses_handles_until_fields_change() {
        let f = fixture();
        f.metadata.create_table(NewTable::named("Products")).unwrap();
        f.metadata.create_field("products", NewField::new("Name", FieldKind::ShortText)).unwrap();
        let mut scope = BindingScope::new(&f.binder);
        let first = scope.by_slug("products").unwrap();
        let again = scope.by_slug("products").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(scope.len(), 1);

        f.metadata.create_field("products", NewField::new("Price", FieldKind::Number)).unwrap();
        let rebound = scope.by_slug("products").unwrap();
        assert_ne!(first.fingerprint(), rebound.fingerprint());
        assert_eq!(rebound.schema().slugs(), vec!["name", "price"]);
    }

    #[test]
    fn unknown_table_is_not_found() {
        let f = fixture();
        let mut scope = BindingScope::new(&f.binder);
        assert_eq!(scope.by_slug("nope").err().map(|e| e.cause()), Some("TABLE_NOT_FOUND"));
    }

    #[test]
    fn reads_hide_trashed_rows_by_default() {
        let f = fixture();
        f.metadata.create_table(NewTable::named("Products")).unwrap();
        f.metadata.create_field("products", NewField::new("Name", FieldKind::ShortText)).unwrap();
        let handle = BindingScope::new(&f.binder).by_slug("products").unwrap();
        let chair = handle.create(attrs(json!({"name": "Chair"})), &Actor::user("u1")).unwrap();
        let stool = handle.create(attrs(json!({"name": "Stool"})), &Actor::anonymous()).unwrap();
        handle.soft_delete(stool.clone()).unwrap();

        let visible = handle.find_many(&FilterExpression::All, &OrderExpression::default(), false).unwrap();
        assert_eq!(visible.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![chair.id.clone()]);
        assert!(handle.find_one(&stool.id, false).unwrap().is_none());
        assert!(handle.find_one(&stool.id, true).unwrap().unwrap().trashed);

        let trashed = handle.find_many(&FilterExpression::Trashed(true), &OrderExpression::default(), false).unwrap();
        assert_eq!(trashed.len(), 1);
        assert_eq!(handle.find_many(&FilterExpression::All, &OrderExpression::default(), true).unwrap().len(), 2);

        let updated = handle.update(chair, attrs(json!({"name": "Armchair"}))).unwrap();
        let by_name = handle.find_many(&FilterExpression::field("name", FilterOp::contains("arm")), &OrderExpression::default(), false).unwrap();
        assert_eq!(by_name, vec![updated]);
    }
}
