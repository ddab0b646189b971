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

    // ── Chat agent errors ────────────────────────────────────────────────────
    #[error("Ollama service unavailable at {host}")]
    OllamaUnavailable { host: String },

    #[error("Model '{model_name}' not found in Ollama")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    // ── Geocoding errors ─────────────────────────────────────────────────────
    #[error("Geocoding request failed: {0}")]
    GeocodingTransport(#[from] reqwest::Error),

    #[error("Geocoding service rejected the request: {info}")]
    GeocodingRejected { info: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Session errors ───────────────────────────────────────────────────────
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("A reply is still being generated for session '{id}'")]
    TurnInProgress { id: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::SessionNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::OllamaUnavailable { .. } | AppError::ModelNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::TurnInProgress { .. })
    }
}
