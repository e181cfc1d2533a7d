use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::info;
use crate::model::{Row, ATTACHMENT_PARTITION, USER_PARTITION};
use crate::storage::{DocumentStore, WriteSet};

/// User attributes safe to embed in hydrated rows.
const PUBLIC_USER_ATTRIBUTES: [&str; 3] = ["name", "email", "avatar"];

/// Turns attachment ids into display-ready objects. Unknown ids are absent from the result.
pub trait AttachmentResolver: Send + Sync {
    fn resolve(&self, ids: &[String]) -> Result<HashMap<String, Value>, AppError>;
}

/// Turns user ids into display-ready objects. Unknown ids are absent from the result.
pub trait UserDirectory: Send + Sync {
    fn resolve(&self, ids: &[String]) -> Result<HashMap<String, Value>, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), AppError>;
}

fn display_object(row: &Row, keep: impl Fn(&str) -> bool) -> Value {
    let mut object = Map::new();
    object.insert("id".to_string(), Value::String(row.id.clone()));
    for (key, value) in row.attributes.iter().filter(|(k, _)| keep(k)) {
        object.insert(key.clone(), value.clone());
    }
    Value::Object(object)
}

fn add_row(store: &Arc<dyn DocumentStore>, partition: &str, attributes: Map<String, Value>) -> Result<Row, AppError> {
    let row = Row::new(attributes, None);
    let mut writes = WriteSet::new();
    writes.insert(partition, row.clone());
    store.apply(writes)?;
    Ok(row)
}

/// Attachment metadata kept in the shared attachment partition.
#[derive(Clone)]
pub struct StoredAttachments {
    store: Arc<dyn DocumentStore>,
}

impl StoredAttachments {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        StoredAttachments { store }
    }

    pub fn add(&self, attributes: Map<String, Value>) -> Result<Row, AppError> {
        add_row(&self.store, ATTACHMENT_PARTITION, attributes)
    }
}

impl AttachmentResolver for StoredAttachments {
    fn resolve(&self, ids: &[String]) -> Result<HashMap<String, Value>, AppError> {
        let rows = self.store.get_many(ATTACHMENT_PARTITION, ids)?;
        Ok(rows.iter().filter(|r| !r.trashed).map(|r| (r.id.clone(), display_object(r, |_| true))).collect())
    }
}

#[derive(Clone)]
pub struct StoredUsers {
    store: Arc<dyn DocumentStore>,
}

impl StoredUsers {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        StoredUsers { store }
    }

    pub fn add(&self, attributes: Map<String, Value>) -> Result<Row, AppError> {
        add_row(&self.store, USER_PARTITION, attributes)
    }
}

impl UserDirectory for StoredUsers {
    fn resolve(&self, ids: &[String]) -> Result<HashMap<String, Value>, AppError> {
        let rows = self.store.get_many(USER_PARTITION, ids)?;
        Ok(rows
            .iter()
            .filter(|r| !r.trashed)
            .map(|r| (r.id.clone(), display_object(r, |k| PUBLIC_USER_ATTRIBUTES.contains(&k))))
            .collect())
    }
}

/// Writes notifications to the log; stands in until a mail transport is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), AppError> {
        info!("notification to {}: {}", notification.to, notification.subject);
        Ok(())
    }
}
