//! SurrealDB implementation of [`DocumentStore`].
//!
//! Every collection lives in the single `document` table, distinguished by
//! the `collection` column. Caller data sits under `data`; the tenant and
//! timestamps are top-level columns that the schema keeps read-only.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use surrealdb_types::SurrealValue;
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::document::{
    Document, DocumentQuery, NewDocument, OrderBy, SortDirection,
};
use tenantry_core::models::tenant::TenantId;
use tenantry_core::repository::DocumentStore;
use tracing::debug;

use crate::connection::DbManager;
use crate::error::DbError;

/// DB-side row struct for queries where the record ID is already known.
#[derive(Debug, SurrealValue)]
struct DocumentRow {
    collection: String,
    tenant_id: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// DB-side row struct that includes the record ID via `meta::id(id)`.
#[derive(Debug, SurrealValue)]
struct DocumentRowWithId {
    record_id: String,
    collection: String,
    tenant_id: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode(
    id: String,
    collection: String,
    tenant_id: &str,
    data: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<Document, DbError> {
    let tenant_id = TenantId::parse(tenant_id)
        .map_err(|e| DbError::Decode(format!("document {id}: {e}")))?;
    let Value::Object(data) = data else {
        return Err(DbError::Decode(format!("document {id}: data is not an object")));
    };
    Ok(Document {
        id,
        collection,
        tenant_id,
        data,
        created_at,
        updated_at,
    })
}

impl DocumentRow {
    fn into_document(self, id: &str) -> Result<Document, DbError> {
        decode(
            id.to_string(),
            self.collection,
            &self.tenant_id,
            self.data,
            self.created_at,
            self.updated_at,
        )
    }
}

impl DocumentRowWithId {
    fn try_into_document(self) -> Result<Document, DbError> {
        decode(
            self.record_id,
            self.collection,
            &self.tenant_id,
            self.data,
            self.created_at,
            self.updated_at,
        )
    }
}

/// Column expression for a caller-visible field name.
///
/// Storage columns are addressed directly, everything else lives in `data`.
/// Names have already passed `validate_field`, so embedding them is safe.
fn column(field: &str) -> String {
    match field {
        "id" => "meta::id(id)".into(),
        "tenant_id" | "created_at" | "updated_at" => field.into(),
        other => format!("data.{other}"),
    }
}

fn order_clause(order: &[OrderBy]) -> String {
    let default = [OrderBy::newest_first()];
    let order = if order.is_empty() { &default[..] } else { order };
    let parts: Vec<String> = order
        .iter()
        .map(|o| {
            let field = match o.field.as_str() {
                "id" => "record_id".to_string(),
                other => column(other),
            };
            let dir = match o.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{field} {dir}")
        })
        .collect();
    parts.join(", ")
}

/// Value bound for a filter. Timestamp columns compare against datetimes.
enum Bound {
    Json(Value),
    Time(DateTime<Utc>),
}

fn bound_value(field: &str, value: &Value) -> TenantryResult<Bound> {
    if matches!(field, "created_at" | "updated_at") {
        let parsed = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .ok_or_else(|| {
                TenantryError::invalid(format!("{field} filter requires an RFC 3339 timestamp"))
            })?;
        return Ok(Bound::Time(parsed.with_timezone(&Utc)));
    }
    Ok(Bound::Json(value.clone()))
}

/// SurrealDB implementation of the document store.
#[derive(Clone)]
pub struct SurrealDocumentStore {
    db: DbManager,
}

impl SurrealDocumentStore {
    pub fn new(db: DbManager) -> Self {
        Self { db }
    }
}

impl DocumentStore for SurrealDocumentStore {
    async fn insert(&self, doc: NewDocument) -> TenantryResult<Document> {
        let db = self.db.client()?;
        let id = doc.id.clone();

        let result = db
            .query(
                "CREATE type::record('document', $id) SET \
                 collection = $collection, \
                 tenant_id = $tenant_id, \
                 data = $data, \
                 created_at = $created_at, \
                 updated_at = $updated_at",
            )
            .bind(("id", doc.id))
            .bind(("collection", doc.collection))
            .bind(("tenant_id", doc.tenant_id.to_string()))
            .bind(("data", Value::Object(doc.data)))
            .bind(("created_at", doc.created_at))
            .bind(("updated_at", doc.updated_at))
            .await
            .map_err(DbError::from)?;

        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "document".into(),
            id: id.clone(),
        })?;

        Ok(row.into_document(&id)?)
    }

    async fn insert_batch(&self, docs: Vec<NewDocument>) -> TenantryResult<Vec<Document>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.client()?;

        // One transaction: a failing CREATE cancels every statement in it.
        let mut query = String::from("BEGIN TRANSACTION;\n");
        for i in 0..docs.len() {
            query.push_str(&format!(
                "CREATE type::record('document', $id_{i}) SET \
                 collection = $collection_{i}, \
                 tenant_id = $tenant_id_{i}, \
                 data = $data_{i}, \
                 created_at = $created_at_{i}, \
                 updated_at = $updated_at_{i};\n"
            ));
        }
        query.push_str("COMMIT TRANSACTION;");

        let mut builder = db.query(query);
        for (i, doc) in docs.iter().enumerate() {
            builder = builder
                .bind((format!("id_{i}"), doc.id.clone()))
                .bind((format!("collection_{i}"), doc.collection.clone()))
                .bind((format!("tenant_id_{i}"), doc.tenant_id.to_string()))
                .bind((format!("data_{i}"), Value::Object(doc.data.clone())))
                .bind((format!("created_at_{i}"), doc.created_at))
                .bind((format!("updated_at_{i}"), doc.updated_at));
        }

        let result = builder.await.map_err(DbError::from)?;
        result.check().map_err(DbError::from)?;

        debug!(count = docs.len(), "Batch committed");
        Ok(docs.into_iter().map(NewDocument::into_document).collect())
    }

    async fn get(&self, id: &str) -> TenantryResult<Option<Document>> {
        let db = self.db.client()?;

        let mut result = db
            .query("SELECT * FROM type::record('document', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(row.into_document(id)?)),
            None => Ok(None),
        }
    }

    async fn find(&self, query: &DocumentQuery) -> TenantryResult<Vec<Document>> {
        query.validate()?;
        let db = self.db.client()?;

        // The tenant predicate comes first and is not optional.
        let mut clauses = vec![
            "tenant_id = $tenant_id".to_string(),
            "collection = $collection".to_string(),
        ];
        let mut bounds = Vec::with_capacity(query.filters.len());
        for (i, filter) in query.filters.iter().enumerate() {
            clauses.push(format!(
                "{} {} $f_{i}",
                column(&filter.field),
                filter.op.as_operator()
            ));
            bounds.push(bound_value(&filter.field, &filter.value)?);
        }

        let mut sql = format!(
            "SELECT meta::id(id) AS record_id, * FROM document WHERE {} ORDER BY {}",
            clauses.join(" AND "),
            order_clause(&query.order)
        );
        if query.limit.is_some() {
            sql.push_str(" LIMIT $limit");
        }

        let mut builder = db
            .query(sql)
            .bind(("tenant_id", query.tenant_id().to_string()))
            .bind(("collection", query.collection().to_string()));
        for (i, bound) in bounds.into_iter().enumerate() {
            builder = match bound {
                Bound::Json(value) => builder.bind((format!("f_{i}"), value)),
                Bound::Time(at) => builder.bind((format!("f_{i}"), at)),
            };
        }
        if let Some(limit) = query.limit {
            builder = builder.bind(("limit", limit));
        }

        let mut result = builder.await.map_err(DbError::from)?;
        let rows: Vec<DocumentRowWithId> = result.take(0).map_err(DbError::from)?;

        let docs = rows
            .into_iter()
            .map(DocumentRowWithId::try_into_document)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(docs)
    }

    async fn update_data(
        &self,
        id: &str,
        data: Map<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> TenantryResult<Document> {
        let db = self.db.client()?;

        let result = db
            .query(
                "UPDATE type::record('document', $id) SET \
                 data = $data, updated_at = $updated_at",
            )
            .bind(("id", id.to_string()))
            .bind(("data", Value::Object(data)))
            .bind(("updated_at", updated_at))
            .await
            .map_err(DbError::from)?;

        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "document".into(),
            id: id.to_string(),
        })?;

        Ok(row.into_document(id)?)
    }

    async fn remove(&self, id: &str) -> TenantryResult<bool> {
        let db = self.db.client()?;

        let result = db
            .query("DELETE type::record('document', $id) RETURN BEFORE")
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;

        let mut result = result.check().map_err(DbError::from)?;
        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantry_core::models::document::OrderBy;

    #[test]
    fn storage_columns_are_addressed_directly() {
        assert_eq!(column("created_at"), "created_at");
        assert_eq!(column("id"), "meta::id(id)");
        assert_eq!(column("stage"), "data.stage");
    }

    #[test]
    fn default_order_is_newest_first() {
        assert_eq!(order_clause(&[]), "created_at DESC");
        assert_eq!(
            order_clause(&[OrderBy::asc("amount"), OrderBy::desc("id")]),
            "data.amount ASC, record_id DESC"
        );
    }

    #[test]
    fn timestamp_filters_need_rfc3339() {
        assert!(bound_value("created_at", &Value::from("yesterday")).is_err());
        assert!(matches!(
            bound_value("created_at", &Value::from("2026-01-01T00:00:00Z")),
            Ok(Bound::Time(_))
        ));
        assert!(matches!(
            bound_value("stage", &Value::from("won")),
            Ok(Bound::Json(_))
        ));
    }
}
