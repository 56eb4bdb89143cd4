//! Tenant domain model.
//!
//! A tenant is the unit of data-access partitioning. Every persisted
//! document and usage record belongs to exactly one tenant.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TenantryError, TenantryResult};

/// Namespace for deriving tenant ids from principal identities.
const TENANT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_94d3_4b0f_8e25_c1d0_7a3b_55e9);

const MAX_TENANT_ID_LEN: usize = 128;

/// Validated tenant identifier.
///
/// Construction is the only place a tenant id is checked, so every API that
/// accepts a `&TenantId` is guaranteed a present, well-formed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parse a raw tenant identifier.
    ///
    /// Rejects empty ids, ids over 128 characters, and characters outside
    /// `[A-Za-z0-9_.:@-]`.
    pub fn parse(raw: &str) -> TenantryResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TenantryError::invalid("tenant id is required"));
        }
        if trimmed.len() > MAX_TENANT_ID_LEN {
            return Err(TenantryError::invalid(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} characters"
            )));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-')))
        {
            return Err(TenantryError::invalid(format!(
                "tenant id contains invalid character {bad:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Derive the tenant id owned by a principal.
    ///
    /// The same principal always maps to the same tenant.
    pub fn from_principal(principal_id: &str) -> TenantryResult<Self> {
        let principal = principal_id.trim();
        if principal.is_empty() {
            return Err(TenantryError::invalid("principal id is required"));
        }
        Ok(Self(
            Uuid::new_v5(&TENANT_NAMESPACE, principal.as_bytes()).to_string(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "Free",
            PlanTier::Starter => "Starter",
            PlanTier::Professional => "Professional",
            PlanTier::Enterprise => "Enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Free" => Some(PlanTier::Free),
            "Starter" => Some(PlanTier::Starter),
            "Professional" => Some(PlanTier::Professional),
            "Enterprise" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "Active",
            TenantStatus::Suspended => "Suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(TenantStatus::Active),
            "Suspended" => Some(TenantStatus::Suspended),
            _ => None,
        }
    }
}

/// Hourly and monthly ceilings for one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceLimit {
    pub hourly: Option<u64>,
    pub monthly: Option<u64>,
}

/// Per-tenant governance configuration, written by tenant administrators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TenantSettings {
    /// Spend ceiling for the calendar month. `None` disables budget alerts.
    pub monthly_budget: Option<f64>,
    /// Fraction of the budget at which the governor warns (default: 0.75).
    pub alert_threshold: f64,
    /// Fraction of the budget at which the governor signals an emergency
    /// (default: 0.90).
    pub emergency_threshold: f64,
    /// Whether an emergency blocks non-essential metered work (default: true).
    pub emergency_stop: bool,
    /// Fraction of a quota limit at which decisions are flagged as near the
    /// limit (default: 0.90).
    pub admission_threshold: f64,
    /// Limits keyed by resource kind.
    pub resource_limits: BTreeMap<String, ResourceLimit>,
    /// Cost per unit keyed by resource kind. Missing kinds cost 1.0 per unit.
    pub unit_costs: BTreeMap<String, f64>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            monthly_budget: None,
            alert_threshold: 0.75,
            emergency_threshold: 0.90,
            emergency_stop: true,
            admission_threshold: 0.90,
            resource_limits: BTreeMap::new(),
            unit_costs: BTreeMap::new(),
        }
    }
}

impl TenantSettings {
    /// Basic numeric-range checks. Nothing beyond that is enforced here.
    pub fn validate(&self) -> TenantryResult<()> {
        if let Some(budget) = self.monthly_budget {
            if !(budget.is_finite() && budget >= 0.0) {
                return Err(TenantryError::invalid(
                    "monthly_budget must be a non-negative number",
                ));
            }
        }
        for (name, value) in [
            ("alert_threshold", self.alert_threshold),
            ("emergency_threshold", self.emergency_threshold),
            ("admission_threshold", self.admission_threshold),
        ] {
            if !(value.is_finite() && value > 0.0 && value <= 1.0) {
                return Err(TenantryError::invalid(format!(
                    "{name} must be within (0, 1]"
                )));
            }
        }
        if self.alert_threshold > self.emergency_threshold {
            return Err(TenantryError::invalid(
                "alert_threshold must not exceed emergency_threshold",
            ));
        }
        for (kind, cost) in &self.unit_costs {
            if !(cost.is_finite() && *cost >= 0.0) {
                return Err(TenantryError::invalid(format!(
                    "unit cost for {kind} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }

    pub fn limit_for(&self, kind: &str) -> ResourceLimit {
        self.resource_limits.get(kind).copied().unwrap_or_default()
    }

    pub fn unit_cost(&self, kind: &str) -> f64 {
        self.unit_costs.get(kind).copied().unwrap_or(1.0)
    }
}

/// An isolated customer account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// The principal whose first access created this tenant.
    pub principal_id: String,
    pub plan: PlanTier,
    pub status: TenantStatus,
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields that can be updated on an existing tenant.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateTenant {
    pub plan: Option<PlanTier>,
    pub status: Option<TenantStatus>,
}
