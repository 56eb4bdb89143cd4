//! Usage metering and quota admission.
//!
//! Usage records are ordinary scoped documents in the `usage_records`
//! collection. Totals per `(tenant, kind, window)` are summed from the store
//! and cached for `refresh_interval`; `record` adds to cached totals so a
//! single process sees its own consumption immediately. Other processes'
//! consumption becomes visible within one refresh interval.
//!
//! Windows are calendar-aligned in UTC: the current hour and the current
//! month. A cache key includes the window start, so a rollover starts from a
//! fresh total instead of a stale one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::document::{Document, DocumentQuery, Filter};
use tenantry_core::models::tenant::TenantId;
use tenantry_core::models::usage::{
    QuotaDecision, QuotaWindow, ResourceKind, USAGE_COLLECTION, UsageRecord,
};
use tenantry_core::repository::{DocumentStore, TenantRepository};
use tracing::{debug, error, warn};

use crate::cache::TtlCache;
use crate::config::UsageConfig;
use crate::store::TenantScopedStore;

type TotalKey = (TenantId, ResourceKind, QuotaWindow, DateTime<Utc>);
type MonthKey = (TenantId, DateTime<Utc>);

/// Records metered consumption and answers admission-control queries.
pub struct UsageMeter<S: DocumentStore, R: TenantRepository> {
    store: Arc<TenantScopedStore<S>>,
    tenants: R,
    totals: TtlCache<TotalKey, u64>,
    monthly: TtlCache<MonthKey, BTreeMap<ResourceKind, u64>>,
}

impl<S: DocumentStore, R: TenantRepository> UsageMeter<S, R> {
    pub fn new(store: Arc<TenantScopedStore<S>>, tenants: R, config: &UsageConfig) -> Self {
        Self {
            store,
            tenants,
            totals: TtlCache::new(config.refresh_interval, config.cache_capacity),
            monthly: TtlCache::new(config.refresh_interval, config.cache_capacity),
        }
    }

    pub fn tenants(&self) -> &R {
        &self.tenants
    }

    /// Append a usage record. Zero quantities are rejected.
    pub async fn record(
        &self,
        tenant_id: &TenantId,
        kind: &ResourceKind,
        quantity: u64,
    ) -> TenantryResult<UsageRecord> {
        if quantity == 0 {
            return Err(TenantryError::invalid("usage quantity must be positive"));
        }
        let now = Utc::now();
        let body = UsageRecord::body(kind, quantity, now);
        let id = self
            .store
            .append(USAGE_COLLECTION, Value::Object(body), tenant_id)
            .await?;

        for window in [QuotaWindow::Hourly, QuotaWindow::Monthly] {
            let key = (tenant_id.clone(), kind.clone(), window, window.start(now));
            self.totals
                .update(&key, |total| *total = total.saturating_add(quantity));
        }
        let month = (tenant_id.clone(), QuotaWindow::Monthly.start(now));
        self.monthly.update(&month, |totals| {
            let total = totals.entry(kind.clone()).or_insert(0);
            *total = total.saturating_add(quantity);
        });

        debug!(tenant_id = %tenant_id, kind = %kind, quantity, "Usage recorded");
        Ok(UsageRecord {
            id,
            tenant_id: tenant_id.clone(),
            resource_kind: kind.clone(),
            quantity,
            recorded_at: now,
        })
    }

    /// Would consuming `projected` more units stay within every configured
    /// window? The most restrictive window decides.
    pub async fn check_quota(
        &self,
        tenant_id: &TenantId,
        kind: &ResourceKind,
        projected: u64,
    ) -> TenantryResult<QuotaDecision> {
        let settings = self.tenants.get_by_id(tenant_id).await?.settings;
        let limits = settings.limit_for(kind.as_str());
        let now = Utc::now();

        let mut decision: Option<QuotaDecision> = None;
        for (window, limit) in [
            (QuotaWindow::Hourly, limits.hourly),
            (QuotaWindow::Monthly, limits.monthly),
        ] {
            let Some(limit) = limit else {
                continue;
            };
            let current = self.total(tenant_id, kind, window, now).await?;
            let candidate = evaluate(
                kind,
                window,
                current,
                projected,
                limit,
                settings.admission_threshold,
            );
            decision = Some(match decision {
                Some(previous) => most_restrictive(previous, candidate),
                None => candidate,
            });
        }

        match decision {
            Some(decision) => Ok(decision),
            None => {
                let current = self
                    .total(tenant_id, kind, QuotaWindow::Monthly, now)
                    .await?;
                Ok(QuotaDecision::unlimited(kind.clone(), current, projected))
            }
        }
    }

    /// [`check_quota`](Self::check_quota), failing with `QuotaExceeded`
    /// when the consumption would not be allowed.
    pub async fn admit(
        &self,
        tenant_id: &TenantId,
        kind: &ResourceKind,
        projected: u64,
    ) -> TenantryResult<QuotaDecision> {
        let decision = self.check_quota(tenant_id, kind, projected).await?;
        if !decision.allowed {
            warn!(
                tenant_id = %tenant_id,
                kind = %kind,
                message = %decision.message(),
                "Quota exceeded"
            );
            let window = decision.window.map(|w| w.as_str()).unwrap_or("total");
            return Err(TenantryError::QuotaExceeded {
                resource: format!("{kind} ({window})"),
                current: decision.current_usage as f64,
                limit: decision.limit.unwrap_or_default() as f64,
                percentage: decision.percentage,
            });
        }
        if decision.near_limit {
            warn!(
                tenant_id = %tenant_id,
                kind = %kind,
                message = %decision.message(),
                "Usage near quota limit"
            );
        }
        Ok(decision)
    }

    /// Admit `quantity`, run `op`, then record `quantity` whatever `op`
    /// returned. `op` is never retried here.
    ///
    /// A failure to record is logged, not returned: the external call has
    /// already happened and reporting it as failed would invite a retry.
    pub async fn metered<T, F, Fut>(
        &self,
        tenant_id: &TenantId,
        kind: &ResourceKind,
        quantity: u64,
        op: F,
    ) -> TenantryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TenantryResult<T>>,
    {
        self.admit(tenant_id, kind, quantity).await?;
        let outcome = op().await;
        if let Err(e) = self.record(tenant_id, kind, quantity).await {
            error!(
                tenant_id = %tenant_id,
                kind = %kind,
                quantity,
                error = %e,
                "Failed to record metered usage"
            );
        }
        outcome
    }

    /// Per-kind totals for the current calendar month.
    pub async fn monthly_totals(
        &self,
        tenant_id: &TenantId,
    ) -> TenantryResult<BTreeMap<ResourceKind, u64>> {
        let start = QuotaWindow::Monthly.start(Utc::now());
        let key = (tenant_id.clone(), start);
        if let Some(totals) = self.monthly.get(&key) {
            return Ok(totals);
        }

        let query = DocumentQuery::new(USAGE_COLLECTION, tenant_id)
            .filter(Filter::gte("recorded_at_ms", start.timestamp_millis()));
        let mut totals = BTreeMap::new();
        for doc in self.store.find(&query).await? {
            let Some(record) = readable(&doc) else {
                continue;
            };
            let total = totals.entry(record.resource_kind).or_insert(0u64);
            *total = total.saturating_add(record.quantity);
        }

        self.monthly.insert(key, totals.clone());
        Ok(totals)
    }

    /// Forget cached totals for `tenant_id`; the next read hits the store.
    pub fn refresh(&self, tenant_id: &TenantId) {
        self.totals.remove_where(|(tenant, ..)| tenant == tenant_id);
        self.monthly.remove_where(|(tenant, _)| tenant == tenant_id);
        debug!(tenant_id = %tenant_id, "Usage totals refreshed");
    }

    async fn total(
        &self,
        tenant_id: &TenantId,
        kind: &ResourceKind,
        window: QuotaWindow,
        now: DateTime<Utc>,
    ) -> TenantryResult<u64> {
        let start = window.start(now);
        let key = (tenant_id.clone(), kind.clone(), window, start);
        if let Some(total) = self.totals.get(&key) {
            return Ok(total);
        }

        let query = DocumentQuery::new(USAGE_COLLECTION, tenant_id)
            .filter(Filter::eq("resource_kind", kind.as_str()))
            .filter(Filter::gte("recorded_at_ms", start.timestamp_millis()));
        let mut total = 0u64;
        for doc in self.store.find(&query).await? {
            if let Some(record) = readable(&doc) {
                total = total.saturating_add(record.quantity);
            }
        }

        self.totals.insert(key, total);
        Ok(total)
    }
}

/// A stored usage record, or `None` after logging one that no longer
/// decodes. A single bad row must not block admission for the tenant.
fn readable(doc: &Document) -> Option<UsageRecord> {
    match UsageRecord::from_document(doc) {
        Ok(record) => Some(record),
        Err(e) => {
            error!(
                tenant_id = %doc.tenant_id,
                document_id = %doc.id,
                error = %e,
                "Skipping malformed usage record"
            );
            None
        }
    }
}

/// Decision for one window. The hard limit decides admission; the
/// admission threshold only flags decisions that get close to it.
fn evaluate(
    kind: &ResourceKind,
    window: QuotaWindow,
    current: u64,
    projected: u64,
    limit: u64,
    admission_threshold: f64,
) -> QuotaDecision {
    let projected_usage = current.saturating_add(projected);
    let percentage = if limit > 0 {
        projected_usage as f64 / limit as f64 * 100.0
    } else if projected_usage > 0 {
        100.0
    } else {
        0.0
    };
    QuotaDecision {
        allowed: projected_usage <= limit,
        resource_kind: kind.clone(),
        window: Some(window),
        current_usage: current,
        projected_usage,
        limit: Some(limit),
        percentage,
        near_limit: projected_usage as f64 >= admission_threshold * limit as f64,
    }
}

fn most_restrictive(a: QuotaDecision, b: QuotaDecision) -> QuotaDecision {
    match (a.allowed, b.allowed) {
        (false, true) => a,
        (true, false) => b,
        _ if b.percentage > a.percentage => b,
        _ => a,
    }
}
