//! Database-specific error types and conversions.

use tenantry_core::error::TenantryError;

/// Database-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Malformed record: {0}")]
    Decode(String),

    #[error("Not connected to {0}")]
    Disconnected(String),
}

/// Message fragments SurrealDB uses for failures a retry can fix.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "uninitialised",
    "not connected",
    "timed out",
    "timeout",
    "unavailable",
    "broken pipe",
    "reset by peer",
    "websocket",
];

/// Map a SurrealDB error message onto the governance error taxonomy.
pub(crate) fn classify_message(message: &str) -> TenantryError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("already exists") {
        return TenantryError::Conflict {
            entity: "record".into(),
            id: message.to_string(),
        };
    }
    if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return TenantryError::Transient(message.to_string());
    }
    TenantryError::Database(message.to_string())
}

impl From<DbError> for TenantryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => TenantryError::NotFound { entity, id },
            DbError::Surreal(e) => classify_message(&e.to_string()),
            DbError::Disconnected(endpoint) => {
                TenantryError::Transient(format!("not connected to {endpoint}"))
            }
            other => TenantryError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_surreal_messages() {
        assert!(classify_message("Connection uninitialised").is_transient());
        assert!(classify_message("There was an error processing a remote WS request: IO error: Connection reset by peer").is_transient());
        assert!(matches!(
            classify_message("Database record `document:abc` already exists"),
            TenantryError::Conflict { .. }
        ));
        assert!(matches!(
            classify_message("Found 'x' for field `plan`, but expected a string"),
            TenantryError::Database(_)
        ));
    }

    #[test]
    fn disconnected_is_transient() {
        let err: TenantryError = DbError::Disconnected("ws://db:8000".into()).into();
        assert!(err.is_transient());
    }
}
