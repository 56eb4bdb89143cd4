//! Scoped document model and the query shape accepted by document stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TenantryError, TenantryResult};
use crate::models::tenant::TenantId;

/// Keys owned by the storage layer. Callers may not set them inside `data`.
pub const RESERVED_FIELDS: &[&str] = &["id", "tenant_id", "created_at", "updated_at"];

const MAX_COLLECTION_LEN: usize = 64;

/// A persisted business record (deal, contact, campaign, usage record, ...).
///
/// `tenant_id` is set when the document is created and never changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub tenant_id: TenantId,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// A fully stamped document ready to be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDocument {
    pub id: String,
    pub collection: String,
    pub tenant_id: TenantId,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewDocument {
    pub fn into_document(self) -> Document {
        Document {
            id: self.id,
            collection: self.collection,
            tenant_id: self.tenant_id,
            data: self.data,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Collection names are flat lowercase namespaces such as `deals`.
pub fn validate_collection(name: &str) -> TenantryResult<()> {
    let mut chars = name.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_tail =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_head || !valid_tail || name.len() > MAX_COLLECTION_LEN {
        return Err(TenantryError::invalid(format!(
            "invalid collection name {name:?}"
        )));
    }
    Ok(())
}

/// Field names usable in filters and ordering.
pub fn validate_field(name: &str) -> TenantryResult<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TenantryError::invalid(format!("invalid field name {name:?}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn as_operator(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }
}

/// One caller-supplied predicate on a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Newest first.
    pub fn newest_first() -> Self {
        Self::desc("created_at")
    }
}

/// A query against one collection of one tenant.
///
/// The tenant is a required constructor argument with no setter, so every
/// query a store ever receives is already restricted to a single tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    collection: String,
    tenant_id: TenantId,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl DocumentQuery {
    pub fn new(collection: impl Into<String>, tenant_id: &TenantId) -> Self {
        Self {
            collection: collection.into(),
            tenant_id: tenant_id.clone(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check collection and field names before the query reaches a store.
    pub fn validate(&self) -> TenantryResult<()> {
        validate_collection(&self.collection)?;
        for filter in &self.filters {
            validate_field(&filter.field)?;
        }
        for order in &self.order {
            validate_field(&order.field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names() {
        assert!(validate_collection("deals").is_ok());
        assert!(validate_collection("usage_records").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("Deals").is_err());
        assert!(validate_collection("deals/123/notes").is_err());
        assert!(validate_collection("1deals").is_err());
    }

    #[test]
    fn field_names_reject_injection() {
        assert!(validate_field("stage").is_ok());
        assert!(validate_field("recorded_at_ms").is_ok());
        assert!(validate_field("stage = 1 OR true").is_err());
        assert!(validate_field("a.b").is_err());
    }

    #[test]
    fn query_carries_its_tenant() {
        let tenant = TenantId::parse("acme").unwrap();
        let query = DocumentQuery::new("deals", &tenant)
            .filter(Filter::eq("stage", "won"))
            .order_by(OrderBy::newest_first())
            .limit(10);
        assert_eq!(query.tenant_id(), &tenant);
        assert_eq!(query.collection(), "deals");
        assert!(query.validate().is_ok());
    }
}
