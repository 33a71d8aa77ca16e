use thiserror::Error;

use crate::model::{EntityId, EntityKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("no {what} matching {detail}")]
    NoMatch { what: String, detail: String },

    #[error("requested {requested} bytes but only {available} bytes are available")]
    Capacity { requested: u64, available: u64 },

    #[error("invalid operation: {0}")]
    InvalidTransition(String),

    #[error("encryption settings rejected: {0}")]
    EncryptionValidation(String),

    #[error("model invariant violated: {0}")]
    Invariant(String),

    #[error("cannot render storage plan: {0}")]
    Render(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}
