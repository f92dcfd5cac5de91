use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Lookup / ownership errors ────────────────────────────────────────────
    #[error("Message '{id}' not found")]
    MessageNotFound { id: String },

    #[error("Thread '{id}' not found")]
    ThreadNotFound { id: String },

    #[error("Access to {entity_type} '{id}' is forbidden")]
    Forbidden { entity_type: String, id: String },

    #[error("Missing caller identity")]
    Unauthorized,

    // ── Stream errors ────────────────────────────────────────────────────────
    #[error("A stream is already active for message '{message_id}'")]
    AlreadyActive { message_id: String },

    // ── Lineage errors ───────────────────────────────────────────────────────
    #[error("Lineage of message '{leaf_id}' loops back through '{repeated_id}'")]
    LineageCycle { leaf_id: String, repeated_id: String },

    #[error("Lineage of message '{leaf_id}' is deeper than {max_depth} messages")]
    LineageTooDeep { leaf_id: String, max_depth: usize },

    #[error("Message '{message_id}' points at missing parent '{parent_id}'")]
    DanglingParent { message_id: String, parent_id: String },

    #[error("Attachment '{path}' could not be read")]
    MissingAttachment { path: String },

    #[error("Unsupported attachment type: {file_name}")]
    UnsupportedAttachment { file_name: String },

    // ── Upstream errors ──────────────────────────────────────────────────────
    #[error("Upstream provider error: {message}")]
    Upstream { message: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn forbidden(entity_type: &str, id: impl Into<String>) -> Self {
        AppError::Forbidden { entity_type: entity_type.to_string(), id: id.into() }
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        AppError::MessageNotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::MessageNotFound { .. } | AppError::ThreadNotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, AppError::Forbidden { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. } | AppError::FieldTooLong { .. } | AppError::InvalidInput { .. }
        )
    }

    /// Failures that stop a transcript from being built. None of them ever
    /// reaches the upstream provider.
    pub fn is_lineage(&self) -> bool {
        matches!(
            self,
            AppError::LineageCycle { .. }
                | AppError::LineageTooDeep { .. }
                | AppError::DanglingParent { .. }
                | AppError::MissingAttachment { .. }
                | AppError::UnsupportedAttachment { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::AlreadyActive { .. })
    }
}
