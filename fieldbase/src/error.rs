use axum::extract::rejection::JsonRejection;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join: {0}")]
    JoinError(#[from] JoinError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Row exists: {0}")]
    RowExists(String),

    #[error("Row missing: {0}")]
    RowMissing(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn custom(msg: impl Into<String>) -> Self {
        AppError::Custom(msg.into())
    }
}

/// A single payload attribute that failed shaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

/// Errors surfaced by the engine, grouped by how callers are expected to react.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    NotFound { code: &'static str, message: String },

    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("{message}")]
    Validation { code: &'static str, message: String, violations: Vec<Violation> },

    #[error("lifecycle script rejected the write: {0}")]
    Script(String),

    #[error("internal error ({code})")]
    Internal { code: &'static str, #[source] source: AppError },

    #[error(transparent)]
    Store(#[from] AppError),

    #[error("Json rejection: {0}")]
    Rejected(#[from] JsonRejection),
}

impl EngineError {
    pub fn table_not_found(slug: &str) -> Self {
        EngineError::NotFound { code: "TABLE_NOT_FOUND", message: format!("table '{}' not found", slug) }
    }

    pub fn row_not_found(table: &str, id: &str) -> Self {
        EngineError::NotFound { code: "ROW_NOT_FOUND", message: format!("row '{}' not found in table '{}'", id, table) }
    }

    pub fn sub_table_not_found(field: &str) -> Self {
        EngineError::NotFound { code: "SUB_TABLE_NOT_FOUND", message: format!("field group '{}' has no resolvable sub-table", field) }
    }

    pub fn row_trashed(table: &str, id: &str) -> Self {
        EngineError::Conflict { code: "ROW_TRASHED", message: format!("row '{}' in table '{}' is trashed", id, table) }
    }

    pub fn duplicate_slug(slug: &str) -> Self {
        EngineError::Conflict { code: "DUPLICATE_SLUG", message: format!("slug '{}' is already taken", slug) }
    }

    pub fn invalid_payload(violations: Vec<Violation>) -> Self {
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        EngineError::Validation {
            code: "INVALID_PAYLOAD",
            message: format!("invalid values for: {}", fields.join(", ")),
            violations,
        }
    }

    /// Stable cause code reported to API callers.
    pub fn cause(&self) -> &'static str {
        match self {
            EngineError::NotFound { code, .. } => *code,
            EngineError::Conflict { code, .. } => *code,
            EngineError::Validation { code, .. } => *code,
            EngineError::Script(_) => "SCRIPT_REJECTED",
            EngineError::Internal { code, .. } => *code,
            EngineError::Store(AppError::Conflict(_)) => "STALE_REVISION",
            EngineError::Store(AppError::RowExists(_)) => "DUPLICATE_ROW",
            EngineError::Store(AppError::RowMissing(_)) => "ROW_NOT_FOUND",
            EngineError::Store(_) => "INTERNAL_ERROR",
            EngineError::Rejected(_) => "INVALID_JSON",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound { .. }   => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. }   => StatusCode::CONFLICT,
            EngineError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Script(_)         => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Rejected(r)       => r.status(),
            EngineError::Store(AppError::Conflict(_) | AppError::RowExists(_)) => StatusCode::CONFLICT,
            EngineError::Store(AppError::RowMissing(_)) => StatusCode::NOT_FOUND,
            _                              => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Downgrades storage failures to an opaque internal error tagged with the operation stage.
    /// Stale revisions, duplicate inserts and vanished rows keep their own typed causes.
    pub fn at_stage(self, code: &'static str) -> Self {
        match self {
            EngineError::Store(AppError::Conflict(message)) => EngineError::Conflict { code: "STALE_REVISION", message },
            EngineError::Store(AppError::RowExists(message)) => EngineError::Conflict { code: "DUPLICATE_ROW", message },
            EngineError::Store(AppError::RowMissing(message)) => EngineError::NotFound { code: "ROW_NOT_FOUND", message },
            EngineError::Store(source) => {
                crate::error!("{} failed: {}", code, source);
                EngineError::Internal { code, source }
            }
            other => other,
        }
    }
}

impl From<JoinError> for EngineError {
    fn from(e: JoinError) -> Self {
        EngineError::Store(AppError::JoinError(e))
    }
}

/// Structured error object returned to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
    pub cause: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        let message = match err {
            EngineError::Internal { .. } | EngineError::Store(_) => "internal error".to_string(),
            EngineError::Rejected(rej) => rej.body_text(),
            other => other.to_string(),
        };
        let violations = match err {
            EngineError::Validation { violations, .. } => violations.clone(),
            _ => Vec::new(),
        };
        ErrorBody { message, code: err.status_code().as_u16(), cause: err.cause().to_string(), violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_downgraded_with_stage_code() {
        let err = EngineError::Store(AppError::custom("disk on fire")).at_stage("UPDATE_ROW_TABLE_ERROR");
        assert_eq!(err.cause(), "UPDATE_ROW_TABLE_ERROR");
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "internal error");
    }

    #[test]
    fn lookup_failures_pass_through_the_boundary() {
        let err = EngineError::table_not_found("products").at_stage("LIST_ROWS_TABLE_ERROR");
        assert_eq!(err.cause(), "TABLE_NOT_FOUND");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn stale_revision_becomes_conflict() {
        let err = EngineError::Store(AppError::Conflict("revision 3 != 2".into())).at_stage("UPDATE_ROW_TABLE_ERROR");
        assert_eq!(err.cause(), "STALE_REVISION");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn write_set_conflicts_keep_distinct_causes() {
        let duplicate = EngineError::Store(AppError::RowExists("row 'r1' already exists in 'tbl_products'".into()));
        assert_eq!(duplicate.cause(), "DUPLICATE_ROW");
        let duplicate = duplicate.at_stage("CREATE_ROW_TABLE_ERROR");
        assert_eq!(duplicate.cause(), "DUPLICATE_ROW");
        assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);

        let vanished = EngineError::Store(AppError::RowMissing("row 'r1' no longer exists in 'tbl_products'".into())).at_stage("UPDATE_ROW_TABLE_ERROR");
        assert_eq!(vanished.cause(), "ROW_NOT_FOUND");
        assert_eq!(vanished.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorBody::from(&vanished).message, "row 'r1' no longer exists in 'tbl_products'");
    }
}
