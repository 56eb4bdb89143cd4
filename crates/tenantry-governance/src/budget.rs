//! Monthly budget evaluation.

use std::sync::Arc;

use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::budget::{BudgetLevel, BudgetStatus};
use tenantry_core::models::tenant::{TenantId, TenantSettings};
use tenantry_core::models::usage::ResourceKind;
use tenantry_core::repository::{DocumentStore, TenantRepository};
use tracing::{error, warn};

use crate::usage::UsageMeter;

/// Turns a tenant's monthly usage into normal / warning / emergency
/// signals. Pull-based: nothing is evaluated until someone asks.
pub struct BudgetGovernor<S: DocumentStore, R: TenantRepository> {
    meter: Arc<UsageMeter<S, R>>,
}

impl<S: DocumentStore, R: TenantRepository> BudgetGovernor<S, R> {
    pub fn new(meter: Arc<UsageMeter<S, R>>) -> Self {
        Self { meter }
    }

    pub async fn evaluate(&self, tenant_id: &TenantId) -> TenantryResult<BudgetStatus> {
        let settings = self.meter.tenants().get_by_id(tenant_id).await?.settings;
        let totals = self.meter.monthly_totals(tenant_id).await?;
        let status = classify(&settings, spend(&settings, totals.iter()));

        match status.level {
            BudgetLevel::Normal => {}
            BudgetLevel::Warning => warn!(
                tenant_id = %tenant_id,
                spend = status.spend,
                percentage = status.percentage,
                "Monthly budget warning"
            ),
            BudgetLevel::Emergency => error!(
                tenant_id = %tenant_id,
                spend = status.spend,
                percentage = status.percentage,
                blocking = status.block_non_essential,
                "Monthly budget emergency"
            ),
        }
        Ok(status)
    }

    /// Fail with `QuotaExceeded` if the budget blocks this operation.
    /// Essential operations always pass.
    pub async fn guard(&self, tenant_id: &TenantId, essential: bool) -> TenantryResult<BudgetStatus> {
        let status = self.evaluate(tenant_id).await?;
        if status.block_non_essential && !essential {
            return Err(TenantryError::QuotaExceeded {
                resource: "monthly-budget".into(),
                current: status.spend,
                limit: status.budget.unwrap_or_default(),
                percentage: status.percentage,
            });
        }
        Ok(status)
    }
}

fn spend<'a>(
    settings: &TenantSettings,
    totals: impl Iterator<Item = (&'a ResourceKind, &'a u64)>,
) -> f64 {
    totals
        .map(|(kind, units)| *units as f64 * settings.unit_cost(kind.as_str()))
        .sum()
}

fn classify(settings: &TenantSettings, spend: f64) -> BudgetStatus {
    let Some(budget) = settings.monthly_budget else {
        return BudgetStatus {
            level: BudgetLevel::Normal,
            spend,
            budget: None,
            percentage: 0.0,
            block_non_essential: false,
            message: "no monthly budget configured".into(),
        };
    };

    // A zero budget is exhausted by any spend at all.
    let ratio = if budget > 0.0 {
        spend / budget
    } else if spend > 0.0 {
        1.0
    } else {
        0.0
    };
    let percentage = ratio * 100.0;

    let level = if ratio >= settings.emergency_threshold {
        BudgetLevel::Emergency
    } else if ratio >= settings.alert_threshold {
        BudgetLevel::Warning
    } else {
        BudgetLevel::Normal
    };
    let block_non_essential = level == BudgetLevel::Emergency && settings.emergency_stop;

    let message = match level {
        BudgetLevel::Normal => format!("{percentage:.1}% of monthly budget {budget:.2} used"),
        BudgetLevel::Warning => {
            format!("budget warning: {percentage:.1}% of monthly budget {budget:.2} used")
        }
        BudgetLevel::Emergency if block_non_essential => format!(
            "budget emergency: {percentage:.1}% of monthly budget {budget:.2} used, \
             non-essential operations are blocked"
        ),
        BudgetLevel::Emergency => {
            format!("budget emergency: {percentage:.1}% of monthly budget {budget:.2} used")
        }
    };

    BudgetStatus {
        level,
        spend,
        budget: Some(budget),
        percentage,
        block_non_essential,
        message,
    }
}
