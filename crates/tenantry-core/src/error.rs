//! Error types for the Tenantry governance layer.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantryError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Entity already exists: {entity} with id {id}")]
    Conflict { entity: String, id: String },

    #[error("Security violation: tenant {tenant_id} may not {action} {entity} {id}")]
    SecurityViolation {
        tenant_id: String,
        action: String,
        entity: String,
        id: String,
    },

    #[error("Backend unavailable: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TenantryError>,
    },

    #[error(
        "Quota exceeded for {resource}: {current} of {limit} used ({percentage:.1}%)"
    )]
    QuotaExceeded {
        resource: String,
        current: f64,
        limit: f64,
        percentage: f64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TenantryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Only connectivity and deadline failures qualify. Ownership, validation
    /// and quota errors are deterministic and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// True for a transient error, or for exhausted retries whose last
    /// failure was transient. Used to decide whether a write may be deferred.
    pub fn is_connectivity_failure(&self) -> bool {
        match self {
            Self::RetriesExhausted { last, .. } => last.is_connectivity_failure(),
            other => other.is_transient(),
        }
    }
}

pub type TenantryResult<T> = Result<T, TenantryError>;
