//! Usage metering domain model.

use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TenantryError, TenantryResult};
use crate::models::document::Document;
use crate::models::tenant::TenantId;

/// Collection that holds usage records.
pub const USAGE_COLLECTION: &str = "usage_records";

/// A metered resource, e.g. `ai-tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKind(String);

impl ResourceKind {
    pub const AI_TOKENS: &'static str = "ai-tokens";
    pub const WORKFLOW_RUN: &'static str = "workflow-run";
    pub const API_CALL: &'static str = "api-call";

    pub fn parse(raw: &str) -> TenantryResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(TenantryError::invalid(format!(
                "invalid resource kind {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn ai_tokens() -> Self {
        Self(Self::AI_TOKENS.into())
    }

    pub fn workflow_run() -> Self {
        Self(Self::WORKFLOW_RUN.into())
    }

    pub fn api_call() -> Self {
        Self(Self::API_CALL.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = TenantryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.0
    }
}

/// An append-only metered event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub resource_kind: ResourceKind,
    pub quantity: u64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Document body for a new record. `recorded_at_ms` backs window filters.
    pub fn body(kind: &ResourceKind, quantity: u64, at: DateTime<Utc>) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("resource_kind".into(), Value::from(kind.as_str()));
        data.insert("quantity".into(), Value::from(quantity));
        data.insert("recorded_at".into(), Value::from(at.to_rfc3339()));
        data.insert("recorded_at_ms".into(), Value::from(at.timestamp_millis()));
        data
    }

    pub fn from_document(doc: &Document) -> TenantryResult<Self> {
        let malformed = |field: &str| TenantryError::Internal(format!(
            "usage record {} has malformed field {field}",
            doc.id
        ));

        let kind = doc
            .field("resource_kind")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("resource_kind"))?;
        let quantity = doc
            .field("quantity")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("quantity"))?;
        let recorded_at = doc
            .field("recorded_at_ms")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| malformed("recorded_at_ms"))?;

        Ok(Self {
            id: doc.id.clone(),
            tenant_id: doc.tenant_id.clone(),
            resource_kind: ResourceKind::parse(kind)?,
            quantity,
            recorded_at,
        })
    }
}

/// Calendar-aligned aggregation window (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaWindow {
    Hourly,
    Monthly,
}

impl QuotaWindow {
    /// Start of the window containing `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let aligned = match self {
            QuotaWindow::Hourly => {
                Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
            }
            QuotaWindow::Monthly => Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0),
        };
        aligned.single().unwrap_or(now)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaWindow::Hourly => "hourly",
            QuotaWindow::Monthly => "monthly",
        }
    }
}

/// Result of an admission-control query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub resource_kind: ResourceKind,
    /// Window that produced this decision; `None` when the kind is unlimited.
    pub window: Option<QuotaWindow>,
    pub current_usage: u64,
    pub projected_usage: u64,
    pub limit: Option<u64>,
    /// Projected usage as a percentage of the limit.
    pub percentage: f64,
    /// Projected usage reaches the tenant's admission threshold.
    pub near_limit: bool,
}

impl QuotaDecision {
    pub fn unlimited(kind: ResourceKind, current_usage: u64, projected: u64) -> Self {
        Self {
            allowed: true,
            resource_kind: kind,
            window: None,
            current_usage,
            projected_usage: current_usage.saturating_add(projected),
            limit: None,
            percentage: 0.0,
            near_limit: false,
        }
    }

    /// Human-readable summary for quota messages.
    pub fn message(&self) -> String {
        match (self.limit, self.window) {
            (Some(limit), Some(window)) => format!(
                "{} {} usage {} of {} ({:.1}%)",
                self.resource_kind,
                window.as_str(),
                self.projected_usage,
                limit,
                self.percentage
            ),
            _ => format!("{} is not limited", self.resource_kind),
        }
    }
}
