//! Tenant-scoped CRUD façade over a [`DocumentStore`].
//!
//! Every operation takes the caller's [`TenantId`]. Reads are restricted to
//! that tenant by construction ([`DocumentQuery`] always carries it), and
//! mutations of an existing document first load it and compare owners. The
//! ownership read and the write are not atomic; tenant ids never change
//! after creation, so the race cannot re-home a document.
//!
//! Writes go through the [`RetryExecutor`]. Creates carry a client-side id,
//! so a create that is retried after an ambiguous failure and then hits
//! `Conflict` is resolved by checking who owns the existing record.
//!
//! Usage records are append-only: feature code may read `usage_records`
//! but only the usage meter writes there.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde_json::{Map, Value};
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::document::{
    Document, DocumentQuery, Filter, NewDocument, OrderBy, RESERVED_FIELDS, validate_collection,
};
use tenantry_core::models::tenant::TenantId;
use tenantry_core::models::usage::USAGE_COLLECTION;
use tenantry_core::repository::DocumentStore;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::ReadCache;
use crate::config::StoreConfig;
use crate::outbox::{DeferredWrite, DegradedWriteQueue};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::status::PendingWrites;

/// Result of a write that may be parked while the backend is unreachable.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    Applied(T),
    /// Queued for [`TenantScopedStore::reconcile_deferred`].
    Deferred { id: String },
}

impl<T> WriteOutcome<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, WriteOutcome::Deferred { .. })
    }
}

/// Summary of one [`TenantScopedStore::reconcile_deferred`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub applied: usize,
    /// Writes that failed for a non-transient reason and were discarded.
    pub dropped: usize,
    /// Writes still queued because the backend failed again.
    pub remaining: usize,
}

/// Collections no feature code may write to.
const SYSTEM_COLLECTIONS: &[&str] = &[USAGE_COLLECTION];

/// The only path from feature code to tenant data.
pub struct TenantScopedStore<S: DocumentStore> {
    store: S,
    retry: RetryExecutor,
    policy: RetryPolicy,
    cache: ReadCache,
    pending: PendingWrites,
    queue: Option<DegradedWriteQueue>,
    replaying: Mutex<()>,
}

impl<S: DocumentStore> TenantScopedStore<S> {
    pub fn new(store: S, retry: RetryExecutor, config: &StoreConfig) -> Self {
        Self {
            store,
            retry,
            policy: config.retry.clone(),
            cache: ReadCache::new(config.read_cache_ttl, config.read_cache_capacity),
            pending: PendingWrites::new(),
            queue: None,
            replaying: Mutex::new(()),
        }
    }

    /// Enable the `*_or_defer` writes.
    pub fn with_deferred_queue(mut self, queue: DegradedWriteQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Handle for the health monitor's flush step.
    pub fn pending_writes(&self) -> PendingWrites {
        self.pending.clone()
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn deferred_queue(&self) -> Option<&DegradedWriteQueue> {
        self.queue.as_ref()
    }

    /// Number of writes waiting for [`Self::reconcile_deferred`].
    pub async fn deferred_len(&self) -> usize {
        match &self.queue {
            Some(queue) => queue.len().await,
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Documents of one collection owned by `tenant_id`, newest first unless
    /// `order` says otherwise.
    pub async fn query(
        &self,
        collection: &str,
        tenant_id: &TenantId,
        filters: Vec<Filter>,
        order: Vec<OrderBy>,
    ) -> TenantryResult<Vec<Document>> {
        let mut query = DocumentQuery::new(collection, tenant_id);
        query.filters = filters;
        query.order = order;
        self.find(&query).await
    }

    /// Run a prepared query. The query already names its tenant.
    pub async fn find(&self, query: &DocumentQuery) -> TenantryResult<Vec<Document>> {
        query.validate()?;
        self.retry
            .execute(&self.policy, || self.store.find(query))
            .await
    }

    /// One document, served from the read cache when fresh.
    pub async fn get(
        &self,
        collection: &str,
        id: &str,
        tenant_id: &TenantId,
    ) -> TenantryResult<Document> {
        validate_collection(collection)?;
        if let Some(doc) = self.cache.get(tenant_id, id) {
            if doc.collection != collection {
                return Err(TenantryError::not_found("document", id));
            }
            return Ok(doc);
        }
        let epoch = self.cache.epoch();
        let doc = self.load_owned(Some(collection), id, tenant_id, "read").await?;
        self.cache.put_if_current(doc.clone(), epoch);
        Ok(doc)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create a document owned by `tenant_id` and return its id.
    pub async fn create(
        &self,
        collection: &str,
        data: Value,
        tenant_id: &TenantId,
    ) -> TenantryResult<String> {
        writable(collection)?;
        self.append(collection, data, tenant_id).await
    }

    /// Create without the reserved-collection check. Used by the usage
    /// meter to append records.
    pub(crate) async fn append(
        &self,
        collection: &str,
        data: Value,
        tenant_id: &TenantId,
    ) -> TenantryResult<String> {
        let doc = stamp(collection, data, tenant_id)?;
        let created = self.insert_idempotent(doc).await?;
        debug!(
            tenant_id = %tenant_id,
            collection,
            document_id = %created.id,
            "Document created"
        );
        Ok(created.id)
    }

    /// Merge `patch` into the document's top-level fields.
    ///
    /// Deferred writes to the same document are replayed first; if some are
    /// still queued afterwards the update fails with `Transient`.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        tenant_id: &TenantId,
    ) -> TenantryResult<Document> {
        writable(collection)?;
        let patch = checked_body(patch, tenant_id)?;
        self.settle_deferred(id, tenant_id).await?;
        self.apply_update(collection, id, patch, tenant_id).await
    }

    /// Delete a document, after any deferred writes to it.
    pub async fn delete(&self, id: &str, tenant_id: &TenantId) -> TenantryResult<()> {
        self.settle_deferred(id, tenant_id).await?;
        self.remove_owned(id, tenant_id).await
    }

    async fn remove_owned(&self, id: &str, tenant_id: &TenantId) -> TenantryResult<()> {
        let existing = self.load_owned(None, id, tenant_id, "delete").await?;
        writable(&existing.collection)?;

        let _pending = self.pending.track();
        // A retry after an applied-but-unacknowledged delete finds nothing;
        // either way the document is gone.
        let removed = self
            .retry
            .execute(&self.policy, || self.store.remove(id))
            .await?;
        self.cache.invalidate(tenant_id, id);
        debug!(tenant_id = %tenant_id, document_id = id, removed, "Document deleted");
        Ok(())
    }

    /// Create every document or none of them. Ids are returned in input order.
    pub async fn bulk_create(
        &self,
        collection: &str,
        documents: Vec<Value>,
        tenant_id: &TenantId,
    ) -> TenantryResult<Vec<String>> {
        writable(collection)?;
        let docs = documents
            .into_iter()
            .map(|data| stamp(collection, data, tenant_id))
            .collect::<TenantryResult<Vec<_>>>()?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();

        let _pending = self.pending.track();
        let attempts = AtomicU32::new(0);
        let docs = &docs;
        self.retry
            .execute(&self.policy, || {
                let batch = docs.clone();
                let retried = attempts.fetch_add(1, Ordering::AcqRel) > 0;
                async move {
                    match self.store.insert_batch(batch).await {
                        Ok(written) => Ok(written),
                        // An earlier attempt may have committed before its
                        // acknowledgement was lost.
                        Err(e) if retried && !e.is_transient() => {
                            if self.all_written(docs).await? {
                                Ok(Vec::new())
                            } else {
                                Err(e)
                            }
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;

        info!(tenant_id = %tenant_id, collection, count = ids.len(), "Bulk create committed");
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Degraded mode
    // -----------------------------------------------------------------------

    /// Create, or queue the create if the backend is unreachable.
    ///
    /// The id is assigned before the first attempt, so a deferred create
    /// keeps the same id when it is replayed.
    pub async fn create_or_defer(
        &self,
        collection: &str,
        data: Value,
        tenant_id: &TenantId,
    ) -> TenantryResult<WriteOutcome<String>> {
        writable(collection)?;
        let doc = stamp(collection, data, tenant_id)?;
        match self.insert_idempotent(doc.clone()).await {
            Ok(created) => Ok(WriteOutcome::Applied(created.id)),
            Err(e) => {
                let id = doc.id.clone();
                self.defer(DeferredWrite::Create { document: doc }, e).await?;
                Ok(WriteOutcome::Deferred { id })
            }
        }
    }

    /// Update, or queue the update if the backend is unreachable. The
    /// ownership check of a queued update runs when it is replayed.
    ///
    /// While earlier writes to the document are queued the update joins
    /// them without touching the backend.
    pub async fn update_or_defer(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        tenant_id: &TenantId,
    ) -> TenantryResult<WriteOutcome<Document>> {
        writable(collection)?;
        let patch = checked_body(patch, tenant_id)?;
        let write = |patch: Map<String, Value>| DeferredWrite::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            tenant_id: tenant_id.clone(),
            patch,
            deferred_at: Utc::now(),
        };
        if let Some(queue) = self.queue_holding(id, tenant_id).await {
            self.queue_behind(queue, write(patch)).await?;
            return Ok(WriteOutcome::Deferred { id: id.to_string() });
        }
        match self
            .apply_update(collection, id, patch.clone(), tenant_id)
            .await
        {
            Ok(doc) => Ok(WriteOutcome::Applied(doc)),
            Err(e) => {
                self.defer(write(patch), e).await?;
                Ok(WriteOutcome::Deferred { id: id.to_string() })
            }
        }
    }

    /// Delete, or queue the delete if the backend is unreachable.
    pub async fn delete_or_defer(
        &self,
        id: &str,
        tenant_id: &TenantId,
    ) -> TenantryResult<WriteOutcome<()>> {
        let write = || DeferredWrite::Delete {
            id: id.to_string(),
            tenant_id: tenant_id.clone(),
            deferred_at: Utc::now(),
        };
        if let Some(queue) = self.queue_holding(id, tenant_id).await {
            self.queue_behind(queue, write()).await?;
            return Ok(WriteOutcome::Deferred { id: id.to_string() });
        }
        match self.remove_owned(id, tenant_id).await {
            Ok(()) => Ok(WriteOutcome::Applied(())),
            Err(e) => {
                self.defer(write(), e).await?;
                Ok(WriteOutcome::Deferred { id: id.to_string() })
            }
        }
    }

    /// Replay deferred writes in the order they were queued.
    ///
    /// Each write goes through the same checks as a live call and leaves the
    /// queue only once it has been applied, so a crash mid-pass replays it
    /// again on the next run. The pass stops at the first connectivity
    /// failure with that write still at the head. Writes rejected for any
    /// other reason are dropped and counted.
    pub async fn reconcile_deferred(&self) -> TenantryResult<ReconcileReport> {
        let Some(queue) = &self.queue else {
            return Ok(ReconcileReport::default());
        };
        let _replaying = self.replaying.lock().await;
        if queue.is_empty().await {
            return Ok(ReconcileReport::default());
        }
        let count = queue.len().await;
        info!(count, "Replaying deferred writes");

        let mut report = ReconcileReport::default();
        while let Some(write) = queue.front().await {
            match self.replay(&write).await {
                Ok(()) => report.applied += 1,
                Err(e) if e.is_connectivity_failure() => {
                    report.remaining = queue.len().await;
                    warn!(
                        remaining = report.remaining,
                        error = %e,
                        "Backend unavailable during replay, deferring the rest"
                    );
                    break;
                }
                Err(e) => {
                    report.dropped += 1;
                    error!(
                        op = write.kind(),
                        tenant_id = %write.tenant_id(),
                        document_id = write.document_id(),
                        error = %e,
                        "Dropping deferred write"
                    );
                }
            }
            queue.pop_front().await?;
        }

        info!(
            applied = report.applied,
            dropped = report.dropped,
            remaining = report.remaining,
            "Deferred write replay finished"
        );
        Ok(report)
    }

    async fn replay(&self, write: &DeferredWrite) -> TenantryResult<()> {
        match write {
            DeferredWrite::Create { document } => {
                self.insert_idempotent(document.clone()).await?;
            }
            DeferredWrite::Update {
                collection,
                id,
                tenant_id,
                patch,
                ..
            } => {
                self.apply_update(collection, id, patch.clone(), tenant_id)
                    .await?;
            }
            DeferredWrite::Delete { id, tenant_id, .. } => {
                match self.remove_owned(id, tenant_id).await {
                    Ok(()) | Err(TenantryError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn defer(&self, write: DeferredWrite, cause: TenantryError) -> TenantryResult<()> {
        let Some(queue) = &self.queue else {
            return Err(cause);
        };
        if !cause.is_connectivity_failure() {
            return Err(cause);
        }
        warn!(
            op = write.kind(),
            tenant_id = %write.tenant_id(),
            document_id = write.document_id(),
            error = %cause,
            "Backend unavailable, write deferred"
        );
        queue.push(write).await
    }

    /// The queue, if it holds writes to this document.
    async fn queue_holding(
        &self,
        id: &str,
        tenant_id: &TenantId,
    ) -> Option<&DegradedWriteQueue> {
        match &self.queue {
            Some(queue) if queue.holds(tenant_id, id).await => Some(queue),
            _ => None,
        }
    }

    async fn queue_behind(
        &self,
        queue: &DegradedWriteQueue,
        write: DeferredWrite,
    ) -> TenantryResult<()> {
        debug!(
            op = write.kind(),
            tenant_id = %write.tenant_id(),
            document_id = write.document_id(),
            "Earlier writes to this document are queued, deferring"
        );
        queue.push(write).await
    }

    /// Replay queued writes to a document before a live write touches it.
    async fn settle_deferred(&self, id: &str, tenant_id: &TenantId) -> TenantryResult<()> {
        let Some(queue) = self.queue_holding(id, tenant_id).await else {
            return Ok(());
        };
        self.reconcile_deferred().await?;
        if queue.holds(tenant_id, id).await {
            return Err(TenantryError::Transient(format!(
                "document {id} has deferred writes waiting for the backend"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Load a document and require that `tenant_id` owns it.
    ///
    /// A missing document, or one in a different collection, is `NotFound`.
    /// A document owned by someone else is a `SecurityViolation`.
    async fn load_owned(
        &self,
        collection: Option<&str>,
        id: &str,
        tenant_id: &TenantId,
        action: &str,
    ) -> TenantryResult<Document> {
        let found = self
            .retry
            .execute(&self.policy, || self.store.get(id))
            .await?;
        let doc = match found {
            Some(doc) if collection.is_none_or(|c| c == doc.collection) => doc,
            _ => return Err(TenantryError::not_found("document", id)),
        };

        if &doc.tenant_id != tenant_id {
            error!(
                tenant_id = %tenant_id,
                owner_tenant_id = %doc.tenant_id,
                collection = %doc.collection,
                document_id = id,
                action,
                "Cross-tenant access denied"
            );
            return Err(TenantryError::SecurityViolation {
                tenant_id: tenant_id.to_string(),
                action: action.to_string(),
                entity: doc.collection,
                id: id.to_string(),
            });
        }
        Ok(doc)
    }

    async fn apply_update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
        tenant_id: &TenantId,
    ) -> TenantryResult<Document> {
        let existing = self
            .load_owned(Some(collection), id, tenant_id, "update")
            .await?;

        let mut data = existing.data;
        data.extend(patch);
        let updated_at = Utc::now().max(existing.updated_at);

        let _pending = self.pending.track();
        let updated = self
            .retry
            .execute(&self.policy, || {
                self.store.update_data(id, data.clone(), updated_at)
            })
            .await?;
        self.cache.invalidate(tenant_id, id);
        debug!(tenant_id = %tenant_id, collection, document_id = id, "Document updated");
        Ok(updated)
    }

    async fn insert_idempotent(&self, doc: NewDocument) -> TenantryResult<Document> {
        let _pending = self.pending.track();
        let doc = &doc;
        let created = self
            .retry
            .execute(&self.policy, || {
                let attempt = doc.clone();
                async move {
                    match self.store.insert(attempt).await {
                        Err(TenantryError::Conflict { .. }) => self.confirm_written(doc).await,
                        other => other,
                    }
                }
            })
            .await?;
        self.cache.invalidate(&created.tenant_id, &created.id);
        Ok(created)
    }

    /// The id already exists: success if it is this very document.
    async fn confirm_written(&self, doc: &NewDocument) -> TenantryResult<Document> {
        match self.store.get(&doc.id).await? {
            Some(existing)
                if existing.tenant_id == doc.tenant_id
                    && existing.collection == doc.collection =>
            {
                debug!(document_id = %doc.id, "Create already applied by an earlier attempt");
                Ok(existing)
            }
            _ => Err(TenantryError::Conflict {
                entity: "document".into(),
                id: doc.id.clone(),
            }),
        }
    }

    async fn all_written(&self, docs: &[NewDocument]) -> TenantryResult<bool> {
        for doc in docs {
            match self.store.get(&doc.id).await? {
                Some(existing) if existing.tenant_id == doc.tenant_id => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// A collection feature code may write to.
fn writable(collection: &str) -> TenantryResult<()> {
    validate_collection(collection)?;
    if SYSTEM_COLLECTIONS.contains(&collection) {
        return Err(TenantryError::invalid(format!(
            "{collection} is append-only and written by the usage meter"
        )));
    }
    Ok(())
}

/// Validate `data` and stamp it into a new document for `tenant_id`.
fn stamp(collection: &str, data: Value, tenant_id: &TenantId) -> TenantryResult<NewDocument> {
    validate_collection(collection)?;
    let data = checked_body(data, tenant_id)?;
    let now = Utc::now();
    Ok(NewDocument {
        id: Uuid::new_v4().to_string(),
        collection: collection.to_string(),
        tenant_id: tenant_id.clone(),
        data,
        created_at: now,
        updated_at: now,
    })
}

/// A caller-supplied body or patch: an object with no storage-owned keys.
///
/// A `tenant_id` equal to the caller's own is redundant and dropped; any
/// other value is an attempt to write someone else's data.
fn checked_body(value: Value, tenant_id: &TenantId) -> TenantryResult<Map<String, Value>> {
    let Value::Object(mut body) = value else {
        return Err(TenantryError::invalid("document data must be a JSON object"));
    };
    if let Some(claimed) = body.remove("tenant_id") {
        if claimed.as_str() != Some(tenant_id.as_str()) {
            return Err(TenantryError::invalid(
                "tenant_id is set by the store and cannot be changed",
            ));
        }
    }
    if let Some(key) = RESERVED_FIELDS.iter().find(|key| body.contains_key(**key)) {
        return Err(TenantryError::invalid(format!("{key} is a reserved field")));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("tenant-a").unwrap()
    }

    #[test]
    fn body_must_be_an_object() {
        assert!(checked_body(json!([1, 2]), &tenant()).is_err());
        assert!(checked_body(json!("x"), &tenant()).is_err());
        assert!(checked_body(json!({}), &tenant()).is_ok());
    }

    #[test]
    fn reserved_keys_are_rejected() {
        for key in ["id", "created_at", "updated_at"] {
            let mut body = Map::new();
            body.insert(key.into(), json!("x"));
            assert!(checked_body(Value::Object(body), &tenant()).is_err(), "{key}");
        }
    }

    #[test]
    fn own_tenant_id_is_dropped_foreign_rejected() {
        let body = checked_body(json!({"tenant_id": "tenant-a", "n": 1}), &tenant()).unwrap();
        assert!(!body.contains_key("tenant_id"));
        assert_eq!(body["n"], 1);

        assert!(checked_body(json!({"tenant_id": "tenant-b"}), &tenant()).is_err());
    }

    #[test]
    fn stamp_sets_owner_and_timestamps() {
        let doc = stamp("deals", json!({"stage": "open"}), &tenant()).unwrap();
        assert_eq!(doc.tenant_id, tenant());
        assert_eq!(doc.created_at, doc.updated_at);
        assert!(Uuid::parse_str(&doc.id).is_ok());
        assert!(stamp("Bad Name", json!({}), &tenant()).is_err());
    }

    #[test]
    fn usage_collection_is_not_writable() {
        assert!(matches!(
            writable(USAGE_COLLECTION),
            Err(TenantryError::InvalidArgument { .. })
        ));
        assert!(writable("deals").is_ok());
        assert!(writable("Bad Name").is_err());
    }
}
