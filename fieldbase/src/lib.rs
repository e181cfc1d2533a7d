pub mod logger;
pub mod error;
pub mod settings;
pub mod task;
pub mod model;
pub mod registry;
pub mod filter;
pub mod schema;
pub mod query;
pub mod storage;
pub mod collection;
pub mod populate;
pub mod collaborators;
pub mod script;
pub mod orchestrator;
pub mod rest;

pub use error::{AppError, EngineError, ErrorBody, Violation};
pub use filter::{FilterExpression, FilterOp, OrderExpression, SortDirection};
pub use model::{Actor, FieldConfig, FieldDescriptor, FieldKind, LifecycleScripts, Row, TableDefinition};
pub use orchestrator::{Collaborators, Engine, TableDescription};
pub use query::{build_order, build_query, Page, PageMeta, RowQuery};
pub use schema::SchemaSnapshot;
pub use settings::{AppConfig, BeforeSaveFailure, EngineSettings};
pub use storage::{DocumentStore, NewField, NewTable, Storage, WriteSet};
