//! Metadata and row types the engine consumes.
//!
//! Tables and fields are owned by the metadata store; rows are open attribute maps interpreted
//! through whichever field descriptors are active when they are read or written.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use ulid::{Generator, Ulid};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::filter::SortDirection;
use crate::schema::SchemaSnapshot;

pub const PARTITION_PREFIX: &str = "tbl_";
pub const ATTACHMENT_PARTITION: &str = "sys_attachments";
pub const USER_PARTITION: &str = "sys_users";

/// Attribute names owned by the row itself. A field may never shadow them.
pub const RESERVED_ATTRIBUTES: [&str; 7] = ["id", "createdAt", "updatedAt", "trashed", "trashedAt", "createdBy", "revision"];

static ID_GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));
static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Derives a stable, partition-safe identifier from a display name.
pub fn slugify(name: &str, fallback: &str) -> String {
    let folded: String = name.nfkd().filter(|c| !is_combining_mark(*c)).collect::<String>().to_lowercase();
    let slug = NON_SLUG.replace_all(&folded, "_");
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug.to_string()
    }
}

pub fn partition_name(table_slug: &str) -> String {
    format!("{}{}", PARTITION_PREFIX, table_slug)
}

/// Monotonic ULID: ids sort in creation order even within one millisecond.
pub fn new_id() -> String {
    let mut generator = ID_GENERATOR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    generator.generate().unwrap_or_else(|_| Ulid::new()).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[default]
    Table,
    Form,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Private,
    Members,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationLevel {
    #[default]
    Administrators,
    Members,
    Everyone,
}

/// Per-view field ordering, by field slug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layouts {
    #[serde(default)]
    pub list: Vec<String>,
    #[serde(default)]
    pub detail: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub administrators: Vec<String>,
    #[serde(default)]
    pub access: AccessLevel,
    #[serde(default)]
    pub collaboration: CollaborationLevel,
    #[serde(default)]
    pub layouts: Layouts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleScripts {
    #[serde(default)]
    pub before_save: Option<String>,
    #[serde(default)]
    pub after_save: Option<String>,
    #[serde(default)]
    pub on_load: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub kind: TableKind,
    /// Field ids in declared order.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub config: TableConfig,
    #[serde(default)]
    pub scripts: LifecycleScripts,
    /// Last compiled schema, kept for introspection. Writes always recompile from live fields.
    #[serde(default)]
    pub schema: Option<SchemaSnapshot>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub trashed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableDefinition {
    pub fn partition(&self) -> String {
        partition_name(&self.slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    ShortText,
    LongText,
    Number,
    Checkbox,
    Date,
    Dropdown,
    Category,
    Relationship,
    Attachment,
    User,
    Reaction,
    Evaluation,
    FieldGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

impl CategoryNode {
    fn collect_values(&self, out: &mut Vec<String>) {
        out.push(self.value.clone());
        for child in &self.children {
            child.collect_values(out);
        }
    }
}

fn default_true() -> bool {
    true
}

/// Type-specific settings. Only the keys relevant to the field's kind are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub categories: Vec<CategoryNode>,
    /// Relationship target table id.
    #[serde(default)]
    pub target_table: Option<String>,
    /// Relationship display field id within the target table.
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub sort: Option<SortDirection>,
    /// Field-group sub-table id.
    #[serde(default)]
    pub sub_table: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub listable: bool,
    #[serde(default)]
    pub filterable: bool,
}

impl Default for FieldConfig {
    fn default() -> Self {
        FieldConfig {
            options: Vec::new(),
            categories: Vec::new(),
            target_table: None,
            target_field: None,
            sort: None,
            sub_table: None,
            default_value: None,
            multiple: false,
            required: false,
            listable: true,
            filterable: false,
        }
    }
}

impl FieldConfig {
    /// Flattened category tree values, depth first.
    pub fn category_values(&self) -> Vec<String> {
        let mut out = Vec::new();
        for node in &self.categories {
            node.collect_values(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub config: FieldConfig,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub trashed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stored record: system attributes plus an open map keyed by field slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub revision: u64,
}

impl Row {
    pub fn new(attributes: Map<String, Value>, created_by: Option<String>) -> Self {
        let now = Utc::now();
        Row {
            id: new_id(),
            attributes,
            created_at: now,
            updated_at: now,
            trashed: false,
            trashed_at: None,
            created_by,
            revision: 1,
        }
    }

    /// Replaces same-named attributes wholesale. Nested objects are not merged.
    pub fn merge(&mut self, attributes: Map<String, Value>) {
        for (key, value) in attributes {
            self.attributes.insert(key, value);
        }
        self.touch();
    }

    pub fn trash(&mut self) {
        let now = Utc::now();
        self.trashed = true;
        self.trashed_at = Some(now);
        self.updated_at = now;
        self.revision += 1;
    }

    pub fn restore(&mut self) {
        self.trashed = false;
        self.trashed_at = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Who is calling the engine. Authentication happens upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<String>,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor { user_id: Some(id.into()) }
    }

    pub fn anonymous() -> Self {
        Actor { user_id: None }
    }
}
