//! One strategy row per field kind.
//!
//! Schema shape, filter behaviour and hydration are all looked up here, so adding a kind means
//! adding a row rather than touching every consumer.

use serde::{Deserialize, Serialize};

use crate::model::FieldKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Text,
    Number,
    Boolean,
    Date,
    /// Value drawn from the configured option list.
    Enum,
    /// Value drawn from the configured category tree.
    Tree,
    TableReference,
    AttachmentReference,
    UserReference,
    Object,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStrategy {
    None,
    /// Case-insensitive, diacritic-folded substring.
    Text,
    /// Loose equality; arrays match any-of.
    Exact,
    /// Stored id (or ids) contains any requested id.
    Reference,
    /// Equality, or inclusive `{from, to}` bounds.
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationStrategy {
    None,
    Relationship,
    Attachment,
    User,
    FieldGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: FieldKind,
    pub storage: StorageClass,
    pub filter: FilterStrategy,
    pub population: PopulationStrategy,
    /// Participates in free-text search.
    pub text_like: bool,
    pub sortable: bool,
}

const fn row(
    kind: FieldKind,
    storage: StorageClass,
    filter: FilterStrategy,
    population: PopulationStrategy,
    text_like: bool,
    sortable: bool,
) -> KindSpec {
    KindSpec { kind, storage, filter, population, text_like, sortable }
}

// Indexed by `FieldKind as usize`; order must follow the enum declaration.
const REGISTRY: [KindSpec; 13] = [
    row(FieldKind::ShortText,    StorageClass::Text,                FilterStrategy::Text,      PopulationStrategy::None,         true,  true),
    row(FieldKind::LongText,     StorageClass::Text,                FilterStrategy::Text,      PopulationStrategy::None,         true,  false),
    row(FieldKind::Number,       StorageClass::Number,              FilterStrategy::Range,     PopulationStrategy::None,         false, true),
    row(FieldKind::Checkbox,     StorageClass::Boolean,             FilterStrategy::Exact,     PopulationStrategy::None,         false, true),
    row(FieldKind::Date,         StorageClass::Date,                FilterStrategy::Range,     PopulationStrategy::None,         false, true),
    row(FieldKind::Dropdown,     StorageClass::Enum,                FilterStrategy::Exact,     PopulationStrategy::None,         false, true),
    row(FieldKind::Category,     StorageClass::Tree,                FilterStrategy::Exact,     PopulationStrategy::None,         false, true),
    row(FieldKind::Relationship, StorageClass::TableReference,      FilterStrategy::Reference, PopulationStrategy::Relationship, false, false),
    row(FieldKind::Attachment,   StorageClass::AttachmentReference, FilterStrategy::None,      PopulationStrategy::Attachment,   false, false),
    row(FieldKind::User,         StorageClass::UserReference,       FilterStrategy::Reference, PopulationStrategy::User,         false, false),
    row(FieldKind::Reaction,     StorageClass::Object,              FilterStrategy::None,      PopulationStrategy::None,         false, false),
    row(FieldKind::Evaluation,   StorageClass::Number,              FilterStrategy::Range,     PopulationStrategy::None,         false, true),
    row(FieldKind::FieldGroup,   StorageClass::Group,               FilterStrategy::None,      PopulationStrategy::FieldGroup,   false, false),
];

pub fn spec(kind: FieldKind) -> &'static KindSpec {
    &REGISTRY[kind as usize]
}

pub fn all() -> &'static [KindSpec] {
    &REGISTRY
}
