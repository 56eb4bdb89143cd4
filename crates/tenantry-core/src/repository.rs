//! Backend trait definitions.
//!
//! These are the narrow seams between the governance layer and the hosted
//! document store. All operations are async. Nothing here can express a
//! cross-tenant query: [`DocumentQuery`] always carries exactly one tenant.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::TenantryResult;
use crate::models::document::{Document, DocumentQuery, NewDocument};
use crate::models::tenant::{PlanTier, Tenant, TenantId, TenantSettings, UpdateTenant};

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Raw CRUD + query access to the document store.
///
/// Implementations do not check ownership; that is the job of the
/// tenant-scoped façade built on top. They must, however, never change a
/// document's `tenant_id` after insert.
pub trait DocumentStore: Send + Sync {
    fn insert(&self, doc: NewDocument) -> impl Future<Output = TenantryResult<Document>> + Send;

    /// Write all documents or none of them.
    fn insert_batch(
        &self,
        docs: Vec<NewDocument>,
    ) -> impl Future<Output = TenantryResult<Vec<Document>>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = TenantryResult<Option<Document>>> + Send;

    fn find(
        &self,
        query: &DocumentQuery,
    ) -> impl Future<Output = TenantryResult<Vec<Document>>> + Send;

    /// Replace the `data` body and `updated_at` of an existing document.
    fn update_data(
        &self,
        id: &str,
        data: Map<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> impl Future<Output = TenantryResult<Document>> + Send;

    /// Returns `false` if nothing was removed.
    fn remove(&self, id: &str) -> impl Future<Output = TenantryResult<bool>> + Send;
}

// ---------------------------------------------------------------------------
// Transport control (health monitor)
// ---------------------------------------------------------------------------

/// Reachability probe and connection control for the backend.
pub trait BackendTransport: Send + Sync {
    /// A minimal read that succeeds only if the backend is reachable.
    fn probe(&self) -> impl Future<Output = TenantryResult<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = TenantryResult<()>> + Send;

    fn reconnect(&self) -> impl Future<Output = TenantryResult<()>> + Send;
}

// ---------------------------------------------------------------------------
// Tenant registry (global scope)
// ---------------------------------------------------------------------------

pub trait TenantRepository: Send + Sync {
    /// Return the principal's tenant, creating it on first access.
    fn get_or_create_for_principal(
        &self,
        principal_id: &str,
        plan: PlanTier,
    ) -> impl Future<Output = TenantryResult<Tenant>> + Send;

    fn get_by_id(&self, id: &TenantId) -> impl Future<Output = TenantryResult<Tenant>> + Send;

    fn update(
        &self,
        id: &TenantId,
        input: UpdateTenant,
    ) -> impl Future<Output = TenantryResult<Tenant>> + Send;

    /// Replace the tenant's governance settings after range validation.
    fn update_settings(
        &self,
        id: &TenantId,
        settings: TenantSettings,
    ) -> impl Future<Output = TenantryResult<Tenant>> + Send;
}
