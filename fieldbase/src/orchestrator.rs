//! The engine: row reads and the write pipeline.
//!
//! A write resolves the table and the existing row, runs the before-save script, rewrites every
//! field-group payload into sub-row ids, shapes the result and stages the parent. Sub-rows and
//! parent are applied in one storage transaction, then the row is re-read hydrated and the
//! after-save script runs on it. Bindings are rebuilt per call through a `BindingScope`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::collaborators::{AttachmentResolver, LogNotifier, Notification, Notifier, StoredAttachments, StoredUsers, UserDirectory};
use crate::collection::{Binder, BindingScope, CollectionHandle};
use crate::error::{EngineError, Violation};
use crate::model::{Actor, FieldDescriptor, LifecycleScripts, Row, TableDefinition, RESERVED_ATTRIBUTES};
use crate::populate::{Hydrator, PopulateDescriptor};
use crate::query::{build_order, build_query, Page, PageRequest, RowQuery};
use crate::schema::{AttributeShape, SchemaSnapshot, ShapeMode};
use crate::script::{ExecutionMoment, ScriptContext, ScriptSandbox, UserAction};
use crate::settings::{BeforeSaveFailure, EngineSettings};
use crate::storage::{DocumentStore, MetadataAdmin, MetadataStore, NewField, NewTable, RedbDocumentStore, RedbMetadataStore, Storage, WriteSet};
use crate::warn;

/// External collaborators used while hydrating rows and delivering script side effects.
#[derive(Clone)]
pub struct Collaborators {
    pub attachments: Arc<dyn AttachmentResolver>,
    pub users: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Attachments and users read from their shared partitions; notifications go to the log.
    pub fn stored(store: Arc<dyn DocumentStore>) -> Self {
        Collaborators {
            attachments: Arc::new(StoredAttachments::new(Arc::clone(&store))),
            users: Arc::new(StoredUsers::new(store)),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    List,
    Detail,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescription {
    pub table: TableDefinition,
    pub fields: Vec<FieldDescriptor>,
    /// Schema as bound right now, with unresolvable fields left out.
    pub schema: SchemaSnapshot,
    /// Declared fields whose target table cannot be resolved.
    pub unresolved: Vec<String>,
}

pub struct Engine {
    admin: Arc<dyn MetadataAdmin>,
    binder: Binder,
    hydrator: Hydrator,
    sandbox: ScriptSandbox,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

fn into_object(payload: Value) -> Result<Map<String, Value>, EngineError> {
    match payload {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::invalid_payload(vec![Violation { field: "$".to_string(), reason: "expected a JSON object".to_string() }])),
    }
}

/// Re-roots sub-row violations under the group item they came from.
fn nest_violations(err: EngineError, prefix: &str) -> EngineError {
    match err {
        EngineError::Validation { violations, .. } => EngineError::invalid_payload(
            violations.into_iter().map(|v| Violation { field: format!("{}.{}", prefix, v.field), reason: v.reason }).collect(),
        ),
        other => other,
    }
}

fn project(schema: &SchemaSnapshot, mut row: Row, view: View) -> Row {
    row.attributes.retain(|key, _| schema.attribute(key).is_some_and(|a| view == View::Detail || a.listable));
    row
}

impl Engine {
    pub fn new<M>(metadata: Arc<M>, store: Arc<dyn DocumentStore>, collaborators: Collaborators, settings: EngineSettings) -> Self
    where
        M: MetadataStore + MetadataAdmin + 'static,
    {
        let admin: Arc<dyn MetadataAdmin> = metadata.clone();
        let lookups: Arc<dyn MetadataStore> = metadata;
        Engine {
            admin,
            binder: Binder::new(lookups, Arc::clone(&store)),
            hydrator: Hydrator::new(store, collaborators.attachments, collaborators.users),
            sandbox: ScriptSandbox::new(settings.scripts.clone()),
            notifier: collaborators.notifier,
            settings,
        }
    }

    /// Engine over redb-backed stores with the storage-backed collaborators.
    pub fn open(storage: Arc<Storage>, settings: EngineSettings) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(RedbDocumentStore::new(Arc::clone(&storage)));
        let metadata = Arc::new(RedbMetadataStore::new(storage));
        Engine::new(metadata, Arc::clone(&store), Collaborators::stored(store), settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn list_rows(&self, table_slug: &str, query: &RowQuery, actor: &Actor) -> Result<Page<Row>, EngineError> {
        self.list_rows_inner(table_slug, query, actor).map_err(|e| e.at_stage("LIST_ROWS_TABLE_ERROR"))
    }

    pub fn get_row(&self, table_slug: &str, id: &str, include_trashed: bool, actor: &Actor) -> Result<Row, EngineError> {
        self.get_row_inner(table_slug, id, include_trashed, actor).map_err(|e| e.at_stage("GET_ROW_TABLE_ERROR"))
    }

    pub fn create_row(&self, table_slug: &str, payload: Value, actor: &Actor) -> Result<Row, EngineError> {
        self.create_row_inner(table_slug, payload, actor).map_err(|e| e.at_stage("CREATE_ROW_TABLE_ERROR"))
    }

    /// Partial update. With `expected_revision` the write only succeeds against that revision.
    pub fn update_row(&self, table_slug: &str, id: &str, payload: Value, expected_revision: Option<u64>, actor: &Actor) -> Result<Row, EngineError> {
        self.update_row_inner(table_slug, id, payload, expected_revision, actor).map_err(|e| e.at_stage("UPDATE_ROW_TABLE_ERROR"))
    }

    pub fn trash_row(&self, table_slug: &str, id: &str, actor: &Actor) -> Result<Row, EngineError> {
        self.trash_row_inner(table_slug, id, actor).map_err(|e| e.at_stage("TRASH_ROW_TABLE_ERROR"))
    }

    /// Clears the trash markers. Restoring an active row returns it unchanged.
    pub fn restore_row(&self, table_slug: &str, id: &str, actor: &Actor) -> Result<Row, EngineError> {
        self.restore_row_inner(table_slug, id, actor).map_err(|e| e.at_stage("RESTORE_ROW_TABLE_ERROR"))
    }

    pub fn describe_table(&self, table_slug: &str) -> Result<TableDescription, EngineError> {
        let describe = || -> Result<TableDescription, EngineError> {
            let mut scope = BindingScope::new(&self.binder);
            let handle = scope.by_slug(table_slug)?;
            let fields = self.binder.metadata().fields_by_ids(&handle.table().fields)?;
            Ok(TableDescription {
                table: handle.table().clone(),
                fields,
                schema: handle.schema().clone(),
                unresolved: handle.unresolved().iter().map(|a| a.slug.clone()).collect(),
            })
        };
        describe().map_err(|e| e.at_stage("DESCRIBE_TABLE_ERROR"))
    }

    pub fn create_table(&self, new_table: NewTable) -> Result<TableDefinition, EngineError> {
        self.admin.create_table(new_table).map_err(|e| e.at_stage("TABLE_ADMIN_ERROR"))
    }

    pub fn create_field(&self, table_slug: &str, new_field: NewField) -> Result<FieldDescriptor, EngineError> {
        self.admin.create_field(table_slug, new_field).map_err(|e| e.at_stage("TABLE_ADMIN_ERROR"))
    }

    pub fn set_scripts(&self, table_slug: &str, scripts: LifecycleScripts) -> Result<TableDefinition, EngineError> {
        self.admin.set_scripts(table_slug, scripts).map_err(|e| e.at_stage("TABLE_ADMIN_ERROR"))
    }

    pub fn trash_table(&self, table_slug: &str) -> Result<TableDefinition, EngineError> {
        self.admin.trash_table(table_slug).map_err(|e| e.at_stage("TABLE_ADMIN_ERROR"))
    }

    pub fn trash_field(&self, table_slug: &str, field_slug: &str) -> Result<TableDefinition, EngineError> {
        self.admin.trash_field(table_slug, field_slug).map_err(|e| e.at_stage("TABLE_ADMIN_ERROR"))
    }

    fn list_rows_inner(&self, table_slug: &str, query: &RowQuery, actor: &Actor) -> Result<Page<Row>, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let filter = build_query(query, handle.schema());
        let order = build_order(query, handle.schema());
        let rows = handle.find_many(&filter, &order, query.include_trashed)?;
        let page = Page::slice(rows, PageRequest::from_query(query, &self.settings.query));
        let projected: Vec<Row> = page.data.into_iter().map(|row| project(handle.schema(), row, View::List)).collect();
        let hydrated = self.hydrator.hydrate_all(&PopulateDescriptor::resolve(&handle), projected)?;
        let data = hydrated.into_iter().map(|row| self.on_load(&handle, row, actor)).collect();
        Ok(Page { data, meta: page.meta })
    }

    fn get_row_inner(&self, table_slug: &str, id: &str, include_trashed: bool, actor: &Actor) -> Result<Row, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let row = handle.find_one(id, include_trashed)?.ok_or_else(|| EngineError::row_not_found(table_slug, id))?;
        let row = self.hydrate(&handle, row)?;
        Ok(self.on_load(&handle, row, actor))
    }

    fn create_row_inner(&self, table_slug: &str, payload: Value, actor: &Actor) -> Result<Row, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let payload = into_object(payload)?;

        let payload = self.before_save(&handle, &Map::new(), payload, UserAction::Create, actor)?;
        let mut writes = WriteSet::new();
        let payload = self.resolve_field_groups(&mut scope, &handle, payload, &mut writes, actor)?;
        let attributes = handle.schema().shape(&payload, ShapeMode::Create)?;
        let row = handle.stage_create(&mut writes, attributes, actor);
        handle.apply(writes)?;

        self.respond(&handle, &row.id, UserAction::Create, actor)
    }

    fn update_row_inner(&self, table_slug: &str, id: &str, payload: Value, expected_revision: Option<u64>, actor: &Actor) -> Result<Row, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let existing = self.existing_row(&handle, id)?;
        if let Some(expected) = expected_revision.filter(|expected| *expected != existing.revision) {
            return Err(EngineError::Conflict {
                code: "STALE_REVISION",
                message: format!("row '{}' is at revision {}, update expected {}", id, existing.revision, expected),
            });
        }
        let payload = into_object(payload)?;

        let payload = self.before_save(&handle, &existing.attributes, payload, UserAction::Update, actor)?;
        let mut writes = WriteSet::new();
        let payload = self.resolve_field_groups(&mut scope, &handle, payload, &mut writes, actor)?;
        let attributes = handle.schema().shape(&payload, ShapeMode::Update)?;
        let row = handle.stage_update(&mut writes, existing, attributes);
        handle.apply(writes)?;

        self.respond(&handle, &row.id, UserAction::Update, actor)
    }

    fn trash_row_inner(&self, table_slug: &str, id: &str, _actor: &Actor) -> Result<Row, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let existing = self.existing_row(&handle, id)?;
        let mut writes = WriteSet::new();
        let row = handle.stage_soft_delete(&mut writes, existing);
        handle.apply(writes)?;
        self.hydrate(&handle, row)
    }

    fn restore_row_inner(&self, table_slug: &str, id: &str, _actor: &Actor) -> Result<Row, EngineError> {
        let mut scope = BindingScope::new(&self.binder);
        let handle = scope.by_slug(table_slug)?;
        let existing = handle.find_one(id, true)?.ok_or_else(|| EngineError::row_not_found(table_slug, id))?;
        let row = if existing.trashed {
            let mut writes = WriteSet::new();
            let row = handle.stage_restore(&mut writes, existing);
            handle.apply(writes)?;
            row
        } else {
            existing
        };
        self.hydrate(&handle, row)
    }

    /// An active row, or `ROW_NOT_FOUND` / `ROW_TRASHED`.
    fn existing_row(&self, handle: &CollectionHandle, id: &str) -> Result<Row, EngineError> {
        let slug = &handle.table().slug;
        let row = handle.find_one(id, true)?.ok_or_else(|| EngineError::row_not_found(slug, id))?;
        if row.trashed {
            return Err(EngineError::row_trashed(slug, id));
        }
        Ok(row)
    }

    fn hydrate(&self, handle: &CollectionHandle, row: Row) -> Result<Row, EngineError> {
        let row = project(handle.schema(), row, View::Detail);
        Ok(self.hydrator.hydrate(&PopulateDescriptor::resolve(handle), row)?)
    }

    /// Rewrites each field-group value into sub-row ids, in processing order. Items with a live id
    /// update that sub-row, everything else becomes a new sub-row. Items are handled one at a
    /// time so a sub-row named twice in one payload is merged twice rather than created twice.
    fn resolve_field_groups(
        &self,
        scope: &mut BindingScope,
        handle: &CollectionHandle,
        mut payload: Map<String, Value>,
        writes: &mut WriteSet,
        actor: &Actor,
    ) -> Result<Map<String, Value>, EngineError> {
        if let Some(orphan) = handle
            .unresolved()
            .iter()
            .find(|a| matches!(a.shape, AttributeShape::EmbeddedRefs { .. }) && payload.contains_key(&a.slug))
        {
            return Err(EngineError::sub_table_not_found(&orphan.slug));
        }

        for attr in &handle.schema().attributes {
            if !matches!(attr.shape, AttributeShape::EmbeddedRefs { .. }) {
                continue;
            }
            let items = match payload.get(&attr.slug) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items.clone(),
                Some(single) => vec![single.clone()],
            };
            let link = handle.link(&attr.slug).ok_or_else(|| EngineError::sub_table_not_found(&attr.slug))?;
            let sub = scope.by_id(&link.table_id)?.ok_or_else(|| EngineError::sub_table_not_found(&attr.slug))?;
            let partition = sub.partition();

            let mut ids = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                let item_path = format!("{}[{}]", attr.slug, idx);
                let (client_id, attributes) = match item {
                    Value::String(id) => (Some(id), None),
                    Value::Object(mut obj) => {
                        let id = obj.remove("id").and_then(|v| v.as_str().map(str::to_string));
                        obj.retain(|k, _| !RESERVED_ATTRIBUTES.contains(&k.as_str()));
                        (id, Some(obj))
                    }
                    _ => {
                        return Err(EngineError::invalid_payload(vec![Violation {
                            field: item_path,
                            reason: "expected an object or a sub-row id".to_string(),
                        }]))
                    }
                };
                let current = match client_id.as_deref() {
                    Some(id) => match writes.staged(&partition, id) {
                        Some(staged) => Some(staged.clone()),
                        None => sub.find_one(id, false)?,
                    }
                    .filter(|row| !row.trashed),
                    None => None,
                };
                match (current, attributes) {
                    (Some(existing), None) => ids.push(Value::String(existing.id)),
                    (Some(existing), Some(attributes)) => {
                        let shaped = sub.schema().shape(&attributes, ShapeMode::Update).map_err(|e| nest_violations(e, &item_path))?;
                        let row = sub.stage_update(writes, existing, shaped);
                        ids.push(Value::String(row.id));
                    }
                    (None, Some(attributes)) => {
                        let shaped = sub.schema().shape(&attributes, ShapeMode::Create).map_err(|e| nest_violations(e, &item_path))?;
                        let row = sub.stage_create(writes, shaped, actor);
                        ids.push(Value::String(row.id));
                    }
                    (None, None) => {
                        warn!("field group '{}': sub-row '{}' does not exist, item dropped", attr.slug, client_id.unwrap_or_default());
                    }
                }
            }
            payload.insert(attr.slug.clone(), Value::Array(ids));
        }
        Ok(payload)
    }

    fn script_context(handle: &CollectionHandle, action: UserAction, moment: ExecutionMoment, actor: &Actor) -> ScriptContext {
        ScriptContext { user_action: action, execution_moment: moment, table_id: handle.table().id.clone(), user_id: actor.user_id.clone() }
    }

    /// Runs the before-save script over the current attributes overlaid with the payload and
    /// folds whatever the script changed back into the payload.
    fn before_save(
        &self,
        handle: &CollectionHandle,
        current: &Map<String, Value>,
        payload: Map<String, Value>,
        action: UserAction,
        actor: &Actor,
    ) -> Result<Map<String, Value>, EngineError> {
        let Some(script) = handle.table().scripts.before_save.as_deref() else {
            return Ok(payload);
        };
        let mut view = current.clone();
        view.extend(payload.clone());
        let ctx = Self::script_context(handle, action, ExecutionMoment::BeforeSave, actor);
        let outcome = self.sandbox.run(script, &view, &handle.table().slug, &handle.schema().slugs(), &ctx);
        match (outcome.data, outcome.error) {
            (Some(edited), _) if outcome.success => {
                let mut payload = payload;
                for (key, value) in edited {
                    if view.get(&key) != Some(&value) {
                        payload.insert(key, value);
                    }
                }
                self.dispatch(outcome.notifications);
                Ok(payload)
            }
            (_, error) => {
                let error = error.unwrap_or_else(|| "script failed".to_string());
                match self.settings.scripts.before_save_failure {
                    BeforeSaveFailure::Continue => {
                        warn!("before_save on '{}' failed, saving unmodified payload: {}", handle.table().slug, error);
                        Ok(payload)
                    }
                    BeforeSaveFailure::Reject => Err(EngineError::Script(error)),
                }
            }
        }
    }

    /// Re-reads the persisted row hydrated, then runs the after-save script on it. Script edits
    /// are not written back.
    fn respond(&self, handle: &CollectionHandle, id: &str, action: UserAction, actor: &Actor) -> Result<Row, EngineError> {
        let persisted = handle.find_one(id, true)?.ok_or_else(|| EngineError::row_not_found(&handle.table().slug, id))?;
        if let Some(script) = handle.table().scripts.after_save.as_deref() {
            let ctx = Self::script_context(handle, action, ExecutionMoment::AfterSave, actor);
            let outcome = self.sandbox.run(script, &persisted.attributes, &handle.table().slug, &handle.schema().slugs(), &ctx);
            if outcome.success {
                self.dispatch(outcome.notifications);
            }
        }
        self.hydrate(handle, persisted)
    }

    /// On-load edits shape the response only.
    fn on_load(&self, handle: &CollectionHandle, mut row: Row, actor: &Actor) -> Row {
        let Some(script) = handle.table().scripts.on_load.as_deref() else {
            return row;
        };
        let ctx = Self::script_context(handle, UserAction::Read, ExecutionMoment::OnLoad, actor);
        let outcome = self.sandbox.run(script, &row.attributes, &handle.table().slug, &handle.schema().slugs(), &ctx);
        if let (true, Some(data)) = (outcome.success, outcome.data) {
            row.attributes = data;
            self.dispatch(outcome.notifications);
        }
        row
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if let Err(e) = self.notifier.notify(&notification) {
                crate::error!("notification to {} failed: {}", notification.to, e);
            }
        }
    }
}
