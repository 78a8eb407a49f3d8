use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the attempt, answer and sequencing services.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("attempt not allowed: {0}")]
    IneligibleAttempt(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{context}: {source}")]
    Transient {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Wraps a store failure with the operation it interrupted.
    ///
    /// Unique-constraint violations are reported as `Conflict`; everything else is transient.
    pub fn store(context: &'static str, source: StoreError) -> Self {
        match source {
            StoreError::UniqueViolation(constraint) => {
                Self::Conflict(format!("{context}: unique constraint {constraint} violated"))
            }
            source => Self::Transient { context, source },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::NotFound { .. } => "not_found",
            DomainError::InvalidState(_) => "invalid_state",
            DomainError::IneligibleAttempt(_) => "ineligible_attempt",
            DomainError::Conflict(_) => "conflict",
            DomainError::Validation(_) => "validation",
            DomainError::Transient { .. } => "transient_io",
            DomainError::Cancelled => "cancelled",
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
