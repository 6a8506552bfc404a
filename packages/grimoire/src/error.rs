use thiserror::Error;

/// Typed failure surface of the engine.
///
/// Per-mutation kinds (`MissingPrior`, `CycleDetected`, `PersistenceTimeout`)
/// abort the mutation atomically: neither hash nor circuit state changes.
/// Per-view kinds (`TypeMismatch`, `Incoherent`) isolate to the view they
/// name. `Schema` only surfaces from init.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("type mismatch: {context}")]
    TypeMismatch { context: String },

    #[error("missing prior value for {record_id}")]
    MissingPrior { record_id: String },

    #[error("dependency cycle detected while cascading from {record_id}")]
    CycleDetected { record_id: String },

    #[error("persistence flush exceeded its deadline")]
    PersistenceTimeout,

    #[error("view {view_id} is incoherent and needs rehydration")]
    Incoherent { view_id: String },

    #[error("unknown view {view_id}")]
    UnknownView { view_id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn schema(message: impl Into<String>) -> Self {
        EngineError::Schema {
            message: message.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        EngineError::Storage(err.to_string())
    }

    /// Stable kind tag for callers that route on error class.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Schema { .. } => "schema",
            EngineError::Parse { .. } => "parse",
            EngineError::TypeMismatch { .. } => "type_mismatch",
            EngineError::MissingPrior { .. } => "missing_prior",
            EngineError::CycleDetected { .. } => "cycle_detected",
            EngineError::PersistenceTimeout => "persistence_timeout",
            EngineError::Incoherent { .. } => "incoherent",
            EngineError::UnknownView { .. } => "unknown_view",
            EngineError::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
