//! Schema compiler: ordered field descriptors in, attribute shapes out.
//!
//! The snapshot drives write-time shaping and is persisted next to the table definition for
//! introspection. Reference targets are kept as table ids and resolved to partitions only when a
//! collection is bound, so renaming a target never requires recompiling its dependents.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{EngineError, Violation};
use crate::filter::SortDirection;
use crate::model::{FieldDescriptor, FieldKind, RESERVED_ATTRIBUTES};
use crate::registry::{self, StorageClass};
use crate::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Text,
    Number,
    Boolean,
    Date,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceTarget {
    Table { table_id: String, display_field_id: Option<String>, sort: Option<SortDirection> },
    Attachments,
    Users,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum AttributeShape {
    Scalar { scalar: ScalarKind },
    /// Soft contract: values outside `options` are stored but logged.
    Enum { options: Vec<String>, multiple: bool },
    Reference { target: ReferenceTarget, multiple: bool },
    EmbeddedRefs { sub_table_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaAttribute {
    pub field_id: String,
    pub slug: String,
    pub kind: FieldKind,
    pub shape: AttributeShape,
    pub required: bool,
    pub listable: bool,
    pub filterable: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeMode {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub attributes: Vec<SchemaAttribute>,
    /// Hex sha256 of the field descriptors the snapshot was compiled from.
    pub fingerprint: String,
}

/// Hex sha256 over the serialized descriptors; equal field state gives an equal fingerprint.
pub fn fingerprint(fields: &[FieldDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        match serde_json::to_vec(field) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(field.id.as_bytes()),
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn shape_for(field: &FieldDescriptor) -> Option<AttributeShape> {
    let config = &field.config;
    let shape = match registry::spec(field.kind).storage {
        StorageClass::Text => AttributeShape::Scalar { scalar: ScalarKind::Text },
        StorageClass::Number => AttributeShape::Scalar { scalar: ScalarKind::Number },
        StorageClass::Boolean => AttributeShape::Scalar { scalar: ScalarKind::Boolean },
        StorageClass::Date => AttributeShape::Scalar { scalar: ScalarKind::Date },
        StorageClass::Object => AttributeShape::Scalar { scalar: ScalarKind::Object },
        StorageClass::Enum => AttributeShape::Enum { options: config.options.clone(), multiple: config.multiple },
        StorageClass::Tree => AttributeShape::Enum { options: config.category_values(), multiple: config.multiple },
        StorageClass::TableReference => AttributeShape::Reference {
            target: ReferenceTarget::Table {
                table_id: config.target_table.clone()?,
                display_field_id: config.target_field.clone(),
                sort: config.sort,
            },
            multiple: config.multiple,
        },
        StorageClass::AttachmentReference => AttributeShape::Reference { target: ReferenceTarget::Attachments, multiple: config.multiple },
        StorageClass::UserReference => AttributeShape::Reference { target: ReferenceTarget::Users, multiple: config.multiple },
        StorageClass::Group => AttributeShape::EmbeddedRefs { sub_table_id: config.sub_table.clone()? },
    };
    Some(shape)
}

/// Compiles the active fields. Fields that cannot be shaped are left out rather than failing
/// the whole table, so callers must tolerate a partial schema.
pub fn compile(fields: &[FieldDescriptor]) -> SchemaSnapshot {
    let mut seen = HashSet::new();
    let mut attributes = Vec::with_capacity(fields.len());
    for field in fields.iter().filter(|f| !f.trashed) {
        if RESERVED_ATTRIBUTES.contains(&field.slug.as_str()) {
            warn!("field '{}' uses reserved slug '{}', skipped", field.id, field.slug);
            continue;
        }
        if !seen.insert(field.slug.clone()) {
            warn!("field '{}' repeats slug '{}', skipped", field.id, field.slug);
            continue;
        }
        let Some(shape) = shape_for(field) else {
            warn!("field '{}' ({:?}) has no target configured, skipped", field.slug, field.kind);
            continue;
        };
        attributes.push(SchemaAttribute {
            field_id: field.id.clone(),
            slug: field.slug.clone(),
            kind: field.kind,
            shape,
            required: field.config.required,
            listable: field.config.listable,
            filterable: field.config.filterable,
            default_value: field.config.default_value.clone(),
        });
    }
    SchemaSnapshot { attributes, fingerprint: fingerprint(fields) }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn coerce_scalar(scalar: ScalarKind, value: &Value) -> Result<Value, String> {
    match (scalar, value) {
        (ScalarKind::Text, Value::String(_)) => Ok(value.clone()),
        (ScalarKind::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ScalarKind::Text, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (ScalarKind::Number, Value::Number(_)) => Ok(value.clone()),
        (ScalarKind::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::from(i))
            } else {
                s.parse::<f64>().ok().and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)).ok_or_else(|| "expected a number".to_string())
            }
        }
        (ScalarKind::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (ScalarKind::Boolean, Value::String(s)) => s.trim().parse::<bool>().map(Value::Bool).map_err(|_| "expected a boolean".to_string()),
        (ScalarKind::Date, Value::String(s)) => {
            let valid = DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();
            if valid { Ok(value.clone()) } else { Err("expected an RFC 3339 date or YYYY-MM-DD".to_string()) }
        }
        (ScalarKind::Object, Value::Object(_)) => Ok(value.clone()),
        (ScalarKind::Text, _) => Err("expected text".to_string()),
        (ScalarKind::Number, _) => Err("expected a number".to_string()),
        (ScalarKind::Boolean, _) => Err("expected a boolean".to_string()),
        (ScalarKind::Date, _) => Err("expected a date string".to_string()),
        (ScalarKind::Object, _) => Err("expected an object".to_string()),
    }
}

/// Accepts a bare id or a previously hydrated `{ "id": .. }` object.
fn reference_id(value: &Value) -> Option<Value> {
    match value {
        Value::String(id) if !id.is_empty() => Some(value.clone()),
        Value::Object(obj) => obj.get("id").filter(|id| id.is_string()).cloned(),
        _ => None,
    }
}

fn coerce_list(value: &Value, multiple: bool, item: impl Fn(&Value) -> Option<Value>, what: &str) -> Result<Value, String> {
    match (value, multiple) {
        (Value::Array(items), true) => items
            .iter()
            .map(|v| item(v).ok_or_else(|| format!("expected a list of {}", what)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (single, true) => item(single).map(|v| Value::Array(vec![v])).ok_or_else(|| format!("expected a list of {}", what)),
        (single, false) => item(single).ok_or_else(|| format!("expected a single {}", what)),
    }
}

impl SchemaSnapshot {
    pub fn attribute(&self, slug: &str) -> Option<&SchemaAttribute> {
        self.attributes.iter().find(|a| a.slug == slug)
    }

    pub fn slugs(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.slug.clone()).collect()
    }

    pub fn retain(&mut self, keep: impl Fn(&SchemaAttribute) -> bool) {
        self.attributes.retain(|a| keep(a));
    }

    fn coerce(&self, attr: &SchemaAttribute, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match &attr.shape {
            AttributeShape::Scalar { scalar } => coerce_scalar(*scalar, value),
            AttributeShape::Enum { options, multiple } => {
                let coerced = coerce_list(value, *multiple, |v| v.as_str().map(|s| Value::String(s.to_string())), "option")?;
                let outside: Vec<&str> = match &coerced {
                    Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
                    other => other.as_str().into_iter().collect(),
                };
                for option in outside.into_iter().filter(|o| !options.is_empty() && !options.iter().any(|known| known == o)) {
                    warn!("value '{}' is not an option of '{}'", option, attr.slug);
                }
                Ok(coerced)
            }
            AttributeShape::Reference { multiple, .. } => coerce_list(value, *multiple, reference_id, "identifier"),
            AttributeShape::EmbeddedRefs { .. } => coerce_list(value, true, reference_id, "identifier"),
        }
    }

    /// Drops undeclared keys, coerces values to their shape and checks required fields.
    pub fn shape(&self, payload: &Map<String, Value>, mode: ShapeMode) -> Result<Map<String, Value>, EngineError> {
        let mut shaped = Map::new();
        let mut violations = Vec::new();
        for (key, value) in payload {
            let Some(attr) = self.attribute(key) else { continue };
            match self.coerce(attr, value) {
                Ok(v) => {
                    shaped.insert(key.clone(), v);
                }
                Err(reason) => violations.push(Violation { field: key.clone(), reason }),
            }
        }
        for attr in &self.attributes {
            if mode == ShapeMode::Create && !shaped.contains_key(&attr.slug) {
                if let Some(default) = &attr.default_value {
                    shaped.insert(attr.slug.clone(), default.clone());
                }
            }
            let must_check = mode == ShapeMode::Create || shaped.contains_key(&attr.slug);
            if attr.required && must_check && is_blank(shaped.get(&attr.slug)) {
                violations.push(Violation { field: attr.slug.clone(), reason: "is required".to_string() });
            }
        }
        if violations.is_empty() {
            Ok(shaped)
        } else {
            Err(EngineError::invalid_payload(violations))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::FieldConfig;
    use chrono::Utc;
    use serde_json::json;

    pub(crate) fn field(id: &str, slug: &str, kind: FieldKind, config: FieldConfig) -> FieldDescriptor {
        let now = Utc::now();
        FieldDescriptor {
            id: id.into(),
            name: slug.into(),
            slug: slug.into(),
            kind,
            config,
            trashed: false,
            trashed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn compiles_shapes_from_the_registry() {
        let fields = vec![
            field("f1", "name", FieldKind::ShortText, FieldConfig::default()),
            field("f2", "tags", FieldKind::Dropdown, FieldConfig { options: vec!["a".into()], multiple: true, ..FieldConfig::default() }),
            field("f3", "owner", FieldKind::User, FieldConfig::default()),
            field("f4", "variants", FieldKind::FieldGroup, FieldConfig { sub_table: Some("t2".into()), ..FieldConfig::default() }),
        ];
        let schema = compile(&fields);
        assert_eq!(schema.slugs(), vec!["name", "tags", "owner", "variants"]);
        assert_eq!(schema.attribute("tags").unwrap().shape, AttributeShape::Enum { options: vec!["a".into()], multiple: true });
        assert_eq!(
            schema.attribute("owner").unwrap().shape,
            AttributeShape::Reference { target: ReferenceTarget::Users, multiple: false }
        );
        assert_eq!(schema.attribute("variants").unwrap().shape, AttributeShape::EmbeddedRefs { sub_table_id: "t2".into() });
    }

    #[test]
    fn unresolvable_and_reserved_fields_are_left_out() {
        let mut gone = field("f3", "old", FieldKind::ShortText, FieldConfig::default());
        gone.trashed = true;
        let fields = vec![
            field("f1", "link", FieldKind::Relationship, FieldConfig::default()),
            field("f2", "id", FieldKind::ShortText, FieldConfig::default()),
            gone,
            field("f4", "name", FieldKind::ShortText, FieldConfig::default()),
            field("f5", "name", FieldKind::LongText, FieldConfig::default()),
        ];
        let schema = compile(&fields);
        assert_eq!(schema.slugs(), vec!["name"]);
        assert_eq!(schema.attribute("name").unwrap().field_id, "f4");
    }

    #[test]
    fn fingerprint_tracks_field_state() {
        let a = vec![field("f1", "name", FieldKind::ShortText, FieldConfig::default())];
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b[0].config.required = true;
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn shape_drops_undeclared_keys_and_coerces() {
        let schema = compile(&[
            field("f1", "name", FieldKind::ShortText, FieldConfig::default()),
            field("f2", "price", FieldKind::Number, FieldConfig::default()),
            field("f3", "related", FieldKind::Relationship, FieldConfig { target_table: Some("t".into()), multiple: true, ..FieldConfig::default() }),
        ]);
        let shaped = schema
            .shape(&payload(json!({"name": 7, "price": "12", "related": {"id": "r1"}, "revision": 99, "secret": true})), ShapeMode::Update)
            .unwrap();
        assert_eq!(Value::Object(shaped), json!({"name": "7", "price": 12, "related": ["r1"]}));
    }

    #[test]
    fn create_applies_defaults_and_requires_fields() {
        let schema = compile(&[
            field("f1", "name", FieldKind::ShortText, FieldConfig { required: true, ..FieldConfig::default() }),
            field("f2", "status", FieldKind::Dropdown, FieldConfig { default_value: Some(json!("draft")), ..FieldConfig::default() }),
        ]);
        let err = schema.shape(&payload(json!({"name": "  "})), ShapeMode::Create).unwrap_err();
        match err {
            EngineError::Validation { code, violations, .. } => {
                assert_eq!(code, "INVALID_PAYLOAD");
                assert_eq!(violations[0].field, "name");
            }
            other => panic!("unexpected {:?}", other),
        }
        let ok = schema.shape(&payload(json!({"name": "Chair"})), ShapeMode::Create).unwrap();
        assert_eq!(ok["status"], json!("draft"));
    }

    #[test]
    fn update_only_checks_required_fields_it_touches() {
        let schema = compile(&[field("f1", "name", FieldKind::ShortText, FieldConfig { required: true, ..FieldConfig::default() })]);
        assert!(schema.shape(&payload(json!({})), ShapeMode::Update).is_ok());
        assert!(schema.shape(&payload(json!({"name": null})), ShapeMode::Update).is_err());
    }

    #[test]
    fn type_mismatches_are_aggregated() {
        let schema = compile(&[
            field("f1", "when", FieldKind::Date, FieldConfig::default()),
            field("f2", "done", FieldKind::Checkbox, FieldConfig::default()),
        ]);
        let err = schema.shape(&payload(json!({"when": "yesterday", "done": "nope"})), ShapeMode::Update).unwrap_err();
        match err {
            EngineError::Validation { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(schema.shape(&payload(json!({"when": "2024-02-29", "done": "true"})), ShapeMode::Update).is_ok());
    }

    #[test]
    fn enum_values_outside_options_are_kept() {
        let schema = compile(&[field("f1", "color", FieldKind::Dropdown, FieldConfig { options: vec!["red".into()], ..FieldConfig::default() })]);
        let shaped = schema.shape(&payload(json!({"color": "blue"})), ShapeMode::Update).unwrap();
        assert_eq!(shaped["color"], json!("blue"));
    }
}
