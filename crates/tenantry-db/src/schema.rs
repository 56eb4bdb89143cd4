//! Schema definitions and migration runner for SurrealDB.
//!
//! Tables are SCHEMAFULL. Tenant ids and document ids are stored as record
//! keys (strings). `document.tenant_id` and `document.created_at` are
//! `READONLY`, so the database itself refuses to re-home a document.

use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::info;

use crate::error::DbError;

// -----------------------------------------------------------------------
// Migration tracking
// -----------------------------------------------------------------------

const MIGRATION_TABLE_DDL: &str = "\
DEFINE TABLE IF NOT EXISTS _migration SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS version ON TABLE _migration TYPE int;
DEFINE FIELD IF NOT EXISTS name ON TABLE _migration TYPE string;
DEFINE FIELD IF NOT EXISTS applied_at ON TABLE _migration TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS idx_migration_version ON TABLE _migration \
    COLUMNS version UNIQUE;
";

#[derive(Debug, SurrealValue)]
struct MigrationRecord {
    version: u32,
    #[allow(dead_code)]
    name: String,
}

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "tenants_and_documents",
    sql: SCHEMA_V1,
}];

// -----------------------------------------------------------------------
// Schema v1
// -----------------------------------------------------------------------

const SCHEMA_V1: &str = "\
-- =======================================================================
-- Tenants (global scope, one per owning principal)
-- =======================================================================
DEFINE TABLE tenant SCHEMAFULL;
DEFINE FIELD principal_id ON TABLE tenant TYPE string READONLY;
DEFINE FIELD plan ON TABLE tenant TYPE string \
    ASSERT $value IN ['Free', 'Starter', 'Professional', 'Enterprise'];
DEFINE FIELD status ON TABLE tenant TYPE string \
    ASSERT $value IN ['Active', 'Suspended'];
DEFINE FIELD settings ON TABLE tenant TYPE object FLEXIBLE DEFAULT {};
DEFINE FIELD created_at ON TABLE tenant TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE tenant TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_tenant_principal ON TABLE tenant \
    COLUMNS principal_id UNIQUE;

-- =======================================================================
-- Scoped documents (every collection shares one table)
-- =======================================================================
DEFINE TABLE document SCHEMAFULL;
DEFINE FIELD collection ON TABLE document TYPE string READONLY;
DEFINE FIELD tenant_id ON TABLE document TYPE string READONLY \
    ASSERT string::len($value) > 0;
DEFINE FIELD data ON TABLE document TYPE object FLEXIBLE DEFAULT {};
DEFINE FIELD created_at ON TABLE document TYPE datetime READONLY;
DEFINE FIELD updated_at ON TABLE document TYPE datetime;
DEFINE INDEX idx_document_tenant_collection ON TABLE document \
    COLUMNS tenant_id, collection;
";

/// Apply every migration newer than the recorded schema version.
///
/// The `_migration` tracking table is created on first run. DEFINE
/// statements are idempotent, so a crash between applying and recording a
/// migration is safe to re-run.
pub async fn run_migrations<C: Connection>(db: &Surreal<C>) -> Result<(), DbError> {
    db.query(MIGRATION_TABLE_DDL)
        .await?
        .check()
        .map_err(|e| DbError::Migration(e.to_string()))?;

    let current = current_version(db).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        info!(version = current, "Schema is up to date");
        return Ok(());
    }

    for migration in pending {
        apply(db, migration).await?;
    }
    Ok(())
}

async fn current_version<C: Connection>(db: &Surreal<C>) -> Result<u32, DbError> {
    let mut result = db
        .query("SELECT * FROM _migration ORDER BY version DESC LIMIT 1")
        .await?;
    let records: Vec<MigrationRecord> = result.take(0)?;
    Ok(records.first().map(|m| m.version).unwrap_or(0))
}

async fn apply<C: Connection>(db: &Surreal<C>, migration: &Migration) -> Result<(), DbError> {
    info!(
        version = migration.version,
        name = migration.name,
        "Applying migration"
    );
    let failed = |stage: &str, e: surrealdb::Error| {
        DbError::Migration(format!(
            "{stage} v{} '{}': {e}",
            migration.version, migration.name
        ))
    };

    db.query(migration.sql)
        .await?
        .check()
        .map_err(|e| failed("apply", e))?;

    db.query("CREATE _migration SET version = $version, name = $name")
        .bind(("version", migration.version))
        .bind(("name", migration.name))
        .await?
        .check()
        .map_err(|e| failed("record", e))?;

    info!(version = migration.version, "Migration applied");
    Ok(())
}

/// Returns the raw schema DDL for version 1.
///
/// Exposed for testing with in-memory SurrealDB instances that
/// bypass the migration runner.
pub fn schema_v1() -> &'static str {
    SCHEMA_V1
}
