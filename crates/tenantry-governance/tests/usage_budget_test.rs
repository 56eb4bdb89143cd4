//! Integration tests for usage metering and budget governance using
//! in-memory SurrealDB.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::{Map, json};
use tenantry_core::error::TenantryError;
use tenantry_core::models::budget::BudgetLevel;
use tenantry_core::models::document::NewDocument;
use tenantry_core::models::tenant::{PlanTier, ResourceLimit, TenantId, TenantSettings};
use tenantry_core::models::usage::{QuotaWindow, ResourceKind, USAGE_COLLECTION};
use tenantry_core::repository::{DocumentStore, TenantRepository};
use tenantry_db::DbManager;
use tenantry_db::repository::{SurrealDocumentStore, SurrealTenantRepository};
use tenantry_governance::{
    BudgetGovernor, RetryExecutor, TenantScopedStore, UsageConfig, UsageMeter,
};
use uuid::Uuid;

use common::{memory_db, store_config};

type Meter = UsageMeter<SurrealDocumentStore, SurrealTenantRepository>;
type Store = Arc<TenantScopedStore<SurrealDocumentStore>>;

fn meter(db: &DbManager) -> Meter {
    meter_and_store(db).0
}

/// A meter and the store feature code would share with it.
fn meter_and_store(db: &DbManager) -> (Meter, Store) {
    let store = Arc::new(TenantScopedStore::new(
        SurrealDocumentStore::new(db.clone()),
        RetryExecutor::detached(),
        &store_config(),
    ));
    let meter = UsageMeter::new(
        Arc::clone(&store),
        SurrealTenantRepository::new(db.clone()),
        &UsageConfig::default(),
    );
    (meter, store)
}

/// A tenant whose settings have been replaced by `settings`.
async fn tenant_with(db: &DbManager, principal: &str, settings: TenantSettings) -> TenantId {
    let tenants = SurrealTenantRepository::new(db.clone());
    let tenant = tenants
        .get_or_create_for_principal(principal, PlanTier::Starter)
        .await
        .unwrap();
    tenants.update_settings(&tenant.id, settings).await.unwrap();
    tenant.id
}

fn token_limit(hourly: Option<u64>, monthly: Option<u64>) -> TenantSettings {
    let mut settings = TenantSettings::default();
    settings.resource_limits.insert(
        ResourceKind::AI_TOKENS.into(),
        ResourceLimit { hourly, monthly },
    );
    settings
}

// -----------------------------------------------------------------------
// Metering
// -----------------------------------------------------------------------

#[tokio::test]
async fn quota_near_and_over_the_limit() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(200), None)).await;
    let tokens = ResourceKind::ai_tokens();

    meter.record(&tenant, &tokens, 190).await.unwrap();

    let near = meter.check_quota(&tenant, &tokens, 5).await.unwrap();
    assert!(near.allowed);
    assert!(near.near_limit);
    assert_eq!(near.current_usage, 190);
    assert_eq!(near.projected_usage, 195);
    assert_eq!(near.window, Some(QuotaWindow::Hourly));

    let over = meter.check_quota(&tenant, &tokens, 15).await.unwrap();
    assert!(!over.allowed);

    match meter.admit(&tenant, &tokens, 15).await.unwrap_err() {
        TenantryError::QuotaExceeded {
            resource,
            current,
            limit,
            ..
        } => {
            assert_eq!(resource, "ai-tokens (hourly)");
            assert_eq!(current, 190.0);
            assert_eq!(limit, 200.0);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn tighter_window_decides() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(1000), Some(100))).await;
    let tokens = ResourceKind::ai_tokens();

    meter.record(&tenant, &tokens, 90).await.unwrap();
    let decision = meter.check_quota(&tenant, &tokens, 20).await.unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.window, Some(QuotaWindow::Monthly));
}

#[tokio::test]
async fn unlimited_kinds_are_always_admitted() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(10), None)).await;
    let runs = ResourceKind::workflow_run();

    meter.record(&tenant, &runs, 50).await.unwrap();
    let decision = meter.admit(&tenant, &runs, 1_000).await.unwrap();

    assert!(decision.allowed);
    assert_eq!(decision.window, None);
    assert_eq!(decision.current_usage, 50);
}

#[tokio::test]
async fn zero_quantity_is_rejected() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", TenantSettings::default()).await;

    let err = meter
        .record(&tenant, &ResourceKind::api_call(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, TenantryError::InvalidArgument { .. }));
}

#[tokio::test]
async fn usage_is_isolated_per_tenant() {
    let db = memory_db().await;
    let meter = meter(&db);
    let a = tenant_with(&db, "user-a", token_limit(Some(100), None)).await;
    let b = tenant_with(&db, "user-b", token_limit(Some(100), None)).await;
    let tokens = ResourceKind::ai_tokens();

    meter.record(&a, &tokens, 95).await.unwrap();

    assert!(!meter.check_quota(&a, &tokens, 10).await.unwrap().allowed);
    let other = meter.check_quota(&b, &tokens, 10).await.unwrap();
    assert!(other.allowed);
    assert_eq!(other.current_usage, 0);
}

#[tokio::test]
async fn other_processes_become_visible_after_refresh() {
    let db = memory_db().await;
    let here = meter(&db);
    let elsewhere = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(200), None)).await;
    let tokens = ResourceKind::ai_tokens();

    assert_eq!(
        here.check_quota(&tenant, &tokens, 1).await.unwrap().current_usage,
        0
    );
    elsewhere.record(&tenant, &tokens, 120).await.unwrap();

    // Cached until the refresh interval passes or someone refreshes.
    assert_eq!(
        here.check_quota(&tenant, &tokens, 1).await.unwrap().current_usage,
        0
    );
    here.refresh(&tenant);
    assert_eq!(
        here.check_quota(&tenant, &tokens, 1).await.unwrap().current_usage,
        120
    );
}

#[tokio::test]
async fn metered_records_even_when_the_call_fails() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", TenantSettings::default()).await;
    let tokens = ResourceKind::ai_tokens();

    let value = meter
        .metered(&tenant, &tokens, 40, || async { Ok("completion") })
        .await
        .unwrap();
    assert_eq!(value, "completion");

    let err = meter
        .metered(&tenant, &tokens, 60, || async {
            Err::<(), _>(TenantryError::Internal("provider returned 500".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TenantryError::Internal(_)));

    let totals = meter.monthly_totals(&tenant).await.unwrap();
    assert_eq!(totals.get(&tokens), Some(&100));
}

#[tokio::test]
async fn metered_call_is_skipped_when_denied() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(None, Some(50))).await;
    let tokens = ResourceKind::ai_tokens();
    let called = AtomicBool::new(false);

    let err = meter
        .metered(&tenant, &tokens, 51, || async {
            called.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TenantryError::QuotaExceeded { .. }));
    assert!(!called.load(Ordering::SeqCst));
    assert!(meter.monthly_totals(&tenant).await.unwrap().is_empty());
}

#[tokio::test]
async fn monthly_totals_group_by_kind() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", TenantSettings::default()).await;

    meter.record(&tenant, &ResourceKind::ai_tokens(), 300).await.unwrap();
    meter.record(&tenant, &ResourceKind::ai_tokens(), 200).await.unwrap();
    meter.record(&tenant, &ResourceKind::workflow_run(), 2).await.unwrap();

    let totals = meter.monthly_totals(&tenant).await.unwrap();
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[&ResourceKind::ai_tokens()], 500);
    assert_eq!(totals[&ResourceKind::workflow_run()], 2);
}

#[tokio::test]
async fn unknown_tenant_is_not_found() {
    let db = memory_db().await;
    let meter = meter(&db);
    let ghost = TenantId::parse("tenant-ghost").unwrap();

    let err = meter
        .check_quota(&ghost, &ResourceKind::ai_tokens(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, TenantryError::NotFound { .. }));
}

// -----------------------------------------------------------------------
// Budget
// -----------------------------------------------------------------------

#[tokio::test]
async fn usage_records_cannot_be_rewritten_through_the_store() {
    let db = memory_db().await;
    let (meter, store) = meter_and_store(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(200), None)).await;
    let tokens = ResourceKind::ai_tokens();

    let record = meter.record(&tenant, &tokens, 190).await.unwrap();
    assert!(!meter.check_quota(&tenant, &tokens, 15).await.unwrap().allowed);

    let rewrite = store
        .update(USAGE_COLLECTION, &record.id, json!({"quantity": 0}), &tenant)
        .await;
    assert!(matches!(rewrite, Err(TenantryError::InvalidArgument { .. })));
    assert!(matches!(
        store
            .update_or_defer(USAGE_COLLECTION, &record.id, json!({"quantity": 0}), &tenant)
            .await,
        Err(TenantryError::InvalidArgument { .. })
    ));
    assert!(matches!(
        store.delete(&record.id, &tenant).await,
        Err(TenantryError::InvalidArgument { .. })
    ));
    assert!(matches!(
        store.delete_or_defer(&record.id, &tenant).await,
        Err(TenantryError::InvalidArgument { .. })
    ));
    let forged = json!({"resource_kind": "ai-tokens", "quantity": 1, "recorded_at_ms": 0});
    assert!(matches!(
        store.create(USAGE_COLLECTION, forged.clone(), &tenant).await,
        Err(TenantryError::InvalidArgument { .. })
    ));
    assert!(matches!(
        store.bulk_create(USAGE_COLLECTION, vec![forged], &tenant).await,
        Err(TenantryError::InvalidArgument { .. })
    ));

    // Records stay readable, and the quota still sees the original usage.
    let stored = store.get(USAGE_COLLECTION, &record.id, &tenant).await.unwrap();
    assert_eq!(stored.data["quantity"], 190);
    meter.refresh(&tenant);
    let decision = meter.check_quota(&tenant, &tokens, 15).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.current_usage, 190);
}

#[tokio::test]
async fn malformed_usage_row_is_skipped_by_aggregates() {
    let db = memory_db().await;
    let meter = meter(&db);
    let tenant = tenant_with(&db, "user-1", token_limit(Some(200), Some(1000))).await;
    let tokens = ResourceKind::ai_tokens();

    meter.record(&tenant, &tokens, 40).await.unwrap();

    // Written behind the store's back, as a buggy migration or another
    // service might.
    let now = Utc::now();
    let mut junk = Map::new();
    junk.insert("resource_kind".into(), json!("ai-tokens"));
    junk.insert("quantity".into(), json!("lots"));
    junk.insert("recorded_at_ms".into(), json!(now.timestamp_millis()));
    SurrealDocumentStore::new(db.clone())
        .insert(NewDocument {
            id: Uuid::new_v4().to_string(),
            collection: USAGE_COLLECTION.into(),
            tenant_id: tenant.clone(),
            data: junk,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    meter.refresh(&tenant);

    let decision = meter.check_quota(&tenant, &tokens, 1).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.current_usage, 40);

    let totals = meter.monthly_totals(&tenant).await.unwrap();
    assert_eq!(totals.get(&tokens), Some(&40));
}

fn budgeted(budget: f64, emergency_stop: bool) -> TenantSettings {
    let mut settings = TenantSettings {
        monthly_budget: Some(budget),
        emergency_stop,
        ..TenantSettings::default()
    };
    settings.unit_costs.insert(ResourceKind::AI_TOKENS.into(), 0.1);
    settings
}

#[tokio::test]
async fn budget_levels_follow_spend() {
    let db = memory_db().await;
    let meter = Arc::new(meter(&db));
    let governor = BudgetGovernor::new(Arc::clone(&meter));
    let tenant = tenant_with(&db, "user-1", budgeted(100.0, true)).await;
    let tokens = ResourceKind::ai_tokens();

    let status = governor.evaluate(&tenant).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Normal);
    assert_eq!(status.spend, 0.0);

    meter.record(&tenant, &tokens, 500).await.unwrap();
    let status = governor.evaluate(&tenant).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Normal);
    assert!((status.spend - 50.0).abs() < 1e-9);

    meter.record(&tenant, &tokens, 300).await.unwrap();
    let status = governor.evaluate(&tenant).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Warning);
    assert!((status.percentage - 80.0).abs() < 1e-9);
    assert!(!status.block_non_essential);

    meter.record(&tenant, &tokens, 150).await.unwrap();
    let status = governor.evaluate(&tenant).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Emergency);
    assert!(status.block_non_essential);
}

#[tokio::test]
async fn emergency_blocks_only_non_essential_work() {
    let db = memory_db().await;
    let meter = Arc::new(meter(&db));
    let governor = BudgetGovernor::new(Arc::clone(&meter));
    let tenant = tenant_with(&db, "user-1", budgeted(10.0, true)).await;
    // 95 units at the default cost of 1.0.
    meter
        .record(&tenant, &ResourceKind::workflow_run(), 95)
        .await
        .unwrap();

    match governor.guard(&tenant, false).await.unwrap_err() {
        TenantryError::QuotaExceeded { resource, limit, .. } => {
            assert_eq!(resource, "monthly-budget");
            assert_eq!(limit, 10.0);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
    let essential = governor.guard(&tenant, true).await.unwrap();
    assert_eq!(essential.level, BudgetLevel::Emergency);
}

#[tokio::test]
async fn emergency_without_stop_only_signals() {
    let db = memory_db().await;
    let meter = Arc::new(meter(&db));
    let governor = BudgetGovernor::new(Arc::clone(&meter));
    let tenant = tenant_with(&db, "user-1", budgeted(10.0, false)).await;
    meter
        .record(&tenant, &ResourceKind::ai_tokens(), 100)
        .await
        .unwrap();

    let status = governor.guard(&tenant, false).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Emergency);
    assert!(!status.block_non_essential);
}

#[tokio::test]
async fn no_budget_never_blocks() {
    let db = memory_db().await;
    let meter = Arc::new(meter(&db));
    let governor = BudgetGovernor::new(Arc::clone(&meter));
    let tenant = tenant_with(&db, "user-1", TenantSettings::default()).await;
    meter
        .record(&tenant, &ResourceKind::ai_tokens(), 1_000_000)
        .await
        .unwrap();

    let status = governor.guard(&tenant, false).await.unwrap();
    assert_eq!(status.level, BudgetLevel::Normal);
    assert_eq!(status.budget, None);
}
