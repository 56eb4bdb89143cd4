//! Governance-layer error types.

use tenantry_core::error::TenantryError;
use thiserror::Error;

/// Failures local to the governance crate, mostly around the on-disk
/// deferred-write queue.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("deferred queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deferred queue encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: String, value: String },
}

impl From<GovernanceError> for TenantryError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::Config { .. } => TenantryError::invalid(err.to_string()),
            GovernanceError::Io(_) | GovernanceError::Codec(_) => {
                TenantryError::Internal(err.to_string())
            }
        }
    }
}
