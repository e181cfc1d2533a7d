//! Population resolver: which stored ids to expand on read, and the hydrator that expands them.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::collaborators::{AttachmentResolver, UserDirectory};
use crate::collection::CollectionHandle;
use crate::error::AppError;
use crate::filter::{compare_values, normalize_text, SortDirection};
use crate::model::Row;
use crate::registry::{self, PopulationStrategy};
use crate::schema::{AttributeShape, ReferenceTarget};
use crate::storage::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulateEntry {
    Relationship { slug: String, partition: String, display_slug: Option<String>, sort: Option<SortDirection> },
    Attachment { slug: String },
    User { slug: String },
    /// Sub-rows are embedded with the sub-table's live attributes only; their own references are
    /// not expanded.
    FieldGroup { slug: String, partition: String, sub_slugs: Vec<String> },
}

impl PopulateEntry {
    pub fn slug(&self) -> &str {
        match self {
            PopulateEntry::Relationship { slug, .. }
            | PopulateEntry::Attachment { slug }
            | PopulateEntry::User { slug }
            | PopulateEntry::FieldGroup { slug, .. } => slug,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateDescriptor {
    pub entries: Vec<PopulateEntry>,
}

impl PopulateDescriptor {
    pub fn resolve(handle: &CollectionHandle) -> Self {
        let mut entries = Vec::new();
        for attr in &handle.schema().attributes {
            let slug = attr.slug.clone();
            let entry = match registry::spec(attr.kind).population {
                PopulationStrategy::None => continue,
                PopulationStrategy::Attachment => PopulateEntry::Attachment { slug },
                PopulationStrategy::User => PopulateEntry::User { slug },
                PopulationStrategy::Relationship => {
                    let Some(link) = handle.link(&attr.slug) else { continue };
                    let sort = match &attr.shape {
                        AttributeShape::Reference { target: ReferenceTarget::Table { sort, .. }, .. } => *sort,
                        _ => None,
                    };
                    PopulateEntry::Relationship { slug, partition: link.partition.clone(), display_slug: link.display_slug.clone(), sort }
                }
                PopulationStrategy::FieldGroup => {
                    let Some(link) = handle.link(&attr.slug) else { continue };
                    PopulateEntry::FieldGroup { slug, partition: link.partition.clone(), sub_slugs: link.slugs.clone() }
                }
            };
            entries.push(entry);
        }
        PopulateDescriptor { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn stored_ids(value: &Value) -> Vec<&str> {
    match value {
        Value::String(id) => vec![id.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn display_order(a: &Value, b: &Value, display: &str, direction: SortDirection) -> Ordering {
    let (a, b) = (a.get(display).unwrap_or(&Value::Null), b.get(display).unwrap_or(&Value::Null));
    let ord = match (a, b) {
        (Value::String(x), Value::String(y)) => normalize_text(x).cmp(&normalize_text(y)),
        _ => compare_values(a, b).unwrap_or(Ordering::Equal),
    };
    direction.apply(ord)
}

/// Applies a descriptor. Ids with no live target are dropped from arrays and become `null` when
/// they were a single reference.
#[derive(Clone)]
pub struct Hydrator {
    store: Arc<dyn DocumentStore>,
    attachments: Arc<dyn AttachmentResolver>,
    users: Arc<dyn UserDirectory>,
}

impl Hydrator {
    pub fn new(store: Arc<dyn DocumentStore>, attachments: Arc<dyn AttachmentResolver>, users: Arc<dyn UserDirectory>) -> Self {
        Hydrator { store, attachments, users }
    }

    pub fn hydrate(&self, descriptor: &PopulateDescriptor, row: Row) -> Result<Row, AppError> {
        self.hydrate_all(descriptor, vec![row])?.into_iter().next().ok_or_else(|| AppError::custom("hydration dropped a row"))
    }

    /// Resolves each entry with one batched lookup across all rows.
    pub fn hydrate_all(&self, descriptor: &PopulateDescriptor, mut rows: Vec<Row>) -> Result<Vec<Row>, AppError> {
        for entry in &descriptor.entries {
            let slug = entry.slug();
            let mut seen = HashSet::new();
            let ids: Vec<String> = rows
                .iter()
                .filter_map(|r| r.attributes.get(slug))
                .flat_map(stored_ids)
                .filter(|id| seen.insert(id.to_string()))
                .map(str::to_string)
                .collect();
            if ids.is_empty() {
                continue;
            }
            let resolved = self.resolve(entry, &ids)?;
            for row in rows.iter_mut() {
                if let Some(value) = row.attributes.get_mut(slug) {
                    *value = Self::rewrite(entry, value, &resolved);
                }
            }
        }
        Ok(rows)
    }

    fn resolve(&self, entry: &PopulateEntry, ids: &[String]) -> Result<HashMap<String, Value>, AppError> {
        match entry {
            PopulateEntry::Attachment { .. } => self.attachments.resolve(ids),
            PopulateEntry::User { .. } => self.users.resolve(ids),
            PopulateEntry::Relationship { partition, display_slug, .. } => {
                let targets = self.store.get_many(partition, ids)?;
                Ok(targets
                    .into_iter()
                    .filter(|t| !t.trashed)
                    .map(|t| {
                        let mut object = Map::new();
                        object.insert("id".to_string(), Value::String(t.id.clone()));
                        if let Some(display) = display_slug {
                            object.insert(display.clone(), t.attributes.get(display).cloned().unwrap_or(Value::Null));
                        }
                        (t.id, Value::Object(object))
                    })
                    .collect())
            }
            PopulateEntry::FieldGroup { partition, sub_slugs, .. } => {
                let sub_rows = self.store.get_many(partition, ids)?;
                sub_rows
                    .into_iter()
                    .filter(|r| !r.trashed)
                    .map(|mut r| -> Result<(String, Value), AppError> {
                        r.attributes.retain(|key, _| sub_slugs.contains(key));
                        Ok((r.id.clone(), r.to_value()?))
                    })
                    .collect()
            }
        }
    }

    fn rewrite(entry: &PopulateEntry, value: &Value, resolved: &HashMap<String, Value>) -> Value {
        match value {
            Value::String(id) => resolved.get(id).cloned().unwrap_or(Value::Null),
            Value::Array(items) => {
                let mut hydrated: Vec<Value> = items.iter().filter_map(Value::as_str).filter_map(|id| resolved.get(id).cloned()).collect();
                if let PopulateEntry::Relationship { display_slug: Some(display), sort: Some(direction), .. } = entry {
                    hydrated.sort_by(|a, b| display_order(a, b, display, *direction));
                }
                Value::Array(hydrated)
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{StoredAttachments, StoredUsers};
    use crate::storage::{RedbDocumentStore, Storage, WriteSet};
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn hydrator() -> (Arc<dyn DocumentStore>, Hydrator, StoredUsers) {
        let store: Arc<dyn DocumentStore> = Arc::new(RedbDocumentStore::new(Storage::temp("populate").unwrap()));
        let users = StoredUsers::new(Arc::clone(&store));
        let hydrator = Hydrator::new(Arc::clone(&store), Arc::new(StoredAttachments::new(Arc::clone(&store))), Arc::new(users.clone()));
        (store, hydrator, users)
    }

    fn seed(store: &Arc<dyn DocumentStore>, partition: &str, rows: &[Row]) {
        let mut writes = WriteSet::new();
        for row in rows {
            writes.insert(partition, row.clone());
        }
        store.apply(writes).unwrap();
    }

    #[test]
    fn relationships_project_display_and_sort() {
        let (store, hydrator, _) = hydrator();
        let oak = Row::new(attrs(json!({"title": "Oak", "secret": 1})), None);
        let ash = Row::new(attrs(json!({"title": "Ash"})), None);
        let mut gone = Row::new(attrs(json!({"title": "Gone"})), None);
        gone.trash();
        seed(&store, "tbl_woods", &[oak.clone(), ash.clone(), gone.clone()]);

        let descriptor = PopulateDescriptor {
            entries: vec![PopulateEntry::Relationship {
                slug: "woods".into(),
                partition: "tbl_woods".into(),
                display_slug: Some("title".into()),
                sort: Some(SortDirection::Asc),
            }],
        };
        let row = Row::new(attrs(json!({"woods": [oak.id, gone.id, "missing", ash.id]})), None);
        let hydrated = hydrator.hydrate(&descriptor, row).unwrap();
        assert_eq!(hydrated.attributes["woods"], json!([{"id": ash.id, "title": "Ash"}, {"id": oak.id, "title": "Oak"}]));
    }

    #[test]
    fn dangling_single_reference_becomes_null() {
        let (_, hydrator, users) = hydrator();
        let ana = users.add(attrs(json!({"name": "Ana"}))).unwrap();
        let descriptor = PopulateDescriptor { entries: vec![PopulateEntry::User { slug: "owner".into() }, PopulateEntry::User { slug: "reviewer".into() }] };
        let row = Row::new(attrs(json!({"owner": ana.id, "reviewer": "nobody"})), None);
        let hydrated = hydrator.hydrate(&descriptor, row).unwrap();
        assert_eq!(hydrated.attributes["owner"], json!({"id": ana.id, "name": "Ana"}));
        assert_eq!(hydrated.attributes["reviewer"], Value::Null);
    }

    #[test]
    fn field_groups_embed_sub_rows_in_stored_order() {
        let (store, hydrator, _) = hydrator();
        let v1 = Row::new(attrs(json!({"sku": "V1", "stock": 4})), None);
        let v2 = Row::new(attrs(json!({"sku": "V2"})), None);
        seed(&store, "tbl_variants", &[v1.clone(), v2.clone()]);
        let descriptor = PopulateDescriptor {
            entries: vec![PopulateEntry::FieldGroup { slug: "variants".into(), partition: "tbl_variants".into(), sub_slugs: vec!["sku".into()] }],
        };
        let rows = vec![
            Row::new(attrs(json!({"variants": [v2.id, v1.id]})), None),
            Row::new(attrs(json!({"variants": [v1.id]})), None),
            Row::new(attrs(json!({})), None),
        ];
        let hydrated = hydrator.hydrate_all(&descriptor, rows).unwrap();
        let skus: Vec<Value> = hydrated[0].attributes["variants"].as_array().unwrap().iter().map(|v| v["sku"].clone()).collect();
        assert_eq!(skus, vec![json!("V2"), json!("V1")]);
        assert_eq!(hydrated[1].attributes["variants"][0]["id"], json!(v1.id));
        assert!(hydrated[1].attributes["variants"][0].get("stock").is_none());
        assert!(hydrated[2].attributes.get("variants").is_none());
    }
}
