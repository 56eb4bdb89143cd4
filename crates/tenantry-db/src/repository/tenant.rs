//! SurrealDB implementation of [`TenantRepository`].

use chrono::{DateTime, Utc};
use surrealdb_types::SurrealValue;
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::tenant::{
    PlanTier, Tenant, TenantId, TenantSettings, TenantStatus, UpdateTenant,
};
use tenantry_core::repository::TenantRepository;
use tracing::info;

use crate::connection::DbManager;
use crate::error::DbError;

/// DB-side row struct for queries where the tenant id is already known.
#[derive(Debug, SurrealValue)]
struct TenantRow {
    principal_id: String,
    plan: String,
    status: String,
    settings: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TenantRow {
    fn into_tenant(self, id: &TenantId) -> Result<Tenant, DbError> {
        let plan = PlanTier::parse(&self.plan)
            .ok_or_else(|| DbError::Decode(format!("unknown plan tier: {}", self.plan)))?;
        let status = TenantStatus::parse(&self.status)
            .ok_or_else(|| DbError::Decode(format!("unknown tenant status: {}", self.status)))?;
        let settings: TenantSettings = serde_json::from_value(self.settings)
            .map_err(|e| DbError::Decode(format!("tenant {id} settings: {e}")))?;
        Ok(Tenant {
            id: id.clone(),
            principal_id: self.principal_id,
            plan,
            status,
            settings,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn settings_value(settings: &TenantSettings) -> Result<serde_json::Value, DbError> {
    serde_json::to_value(settings).map_err(|e| DbError::Decode(format!("settings: {e}")))
}

/// SurrealDB implementation of the tenant registry.
#[derive(Clone)]
pub struct SurrealTenantRepository {
    db: DbManager,
}

impl SurrealTenantRepository {
    pub fn new(db: DbManager) -> Self {
        Self { db }
    }

    async fn create(&self, id: &TenantId, principal_id: &str, plan: PlanTier) -> TenantryResult<Tenant> {
        let db = self.db.client()?;

        let result = db
            .query(
                "CREATE type::record('tenant', $id) SET \
                 principal_id = $principal_id, \
                 plan = $plan, status = $status, \
                 settings = $settings",
            )
            .bind(("id", id.to_string()))
            .bind(("principal_id", principal_id.to_string()))
            .bind(("plan", plan.as_str().to_string()))
            .bind(("status", TenantStatus::Active.as_str().to_string()))
            .bind(("settings", settings_value(&TenantSettings::default())?))
            .await
            .map_err(DbError::from)?;

        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<TenantRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "tenant".into(),
            id: id.to_string(),
        })?;

        info!(tenant_id = %id, plan = plan.as_str(), "Tenant created");
        Ok(row.into_tenant(id)?)
    }
}

impl TenantRepository for SurrealTenantRepository {
    async fn get_or_create_for_principal(
        &self,
        principal_id: &str,
        plan: PlanTier,
    ) -> TenantryResult<Tenant> {
        let id = TenantId::from_principal(principal_id)?;

        match self.get_by_id(&id).await {
            Ok(tenant) => return Ok(tenant),
            Err(TenantryError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        match self.create(&id, principal_id.trim(), plan).await {
            Ok(tenant) => Ok(tenant),
            // A concurrent first access may have created it between our read
            // and write; that surfaces as a conflict or a write-write abort.
            Err(e) => match self.get_by_id(&id).await {
                Ok(tenant) => Ok(tenant),
                Err(_) => Err(e),
            },
        }
    }

    async fn get_by_id(&self, id: &TenantId) -> TenantryResult<Tenant> {
        let db = self.db.client()?;

        let mut result = db
            .query("SELECT * FROM type::record('tenant', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<TenantRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "tenant".into(),
            id: id.to_string(),
        })?;

        Ok(row.into_tenant(id)?)
    }

    async fn update(&self, id: &TenantId, input: UpdateTenant) -> TenantryResult<Tenant> {
        let db = self.db.client()?;

        let mut sets = Vec::new();
        if input.plan.is_some() {
            sets.push("plan = $plan");
        }
        if input.status.is_some() {
            sets.push("status = $status");
        }
        sets.push("updated_at = time::now()");

        let query = format!("UPDATE type::record('tenant', $id) SET {}", sets.join(", "));

        let mut builder = db.query(query).bind(("id", id.to_string()));
        if let Some(plan) = input.plan {
            builder = builder.bind(("plan", plan.as_str().to_string()));
        }
        if let Some(status) = input.status {
            builder = builder.bind(("status", status.as_str().to_string()));
        }

        let result = builder.await.map_err(DbError::from)?;
        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<TenantRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "tenant".into(),
            id: id.to_string(),
        })?;

        Ok(row.into_tenant(id)?)
    }

    async fn update_settings(
        &self,
        id: &TenantId,
        settings: TenantSettings,
    ) -> TenantryResult<Tenant> {
        settings.validate()?;
        let db = self.db.client()?;

        let result = db
            .query(
                "UPDATE type::record('tenant', $id) SET \
                 settings = $settings, updated_at = time::now()",
            )
            .bind(("id", id.to_string()))
            .bind(("settings", settings_value(&settings)?))
            .await
            .map_err(DbError::from)?;

        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<TenantRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "tenant".into(),
            id: id.to_string(),
        })?;

        info!(tenant_id = %id, "Tenant settings updated");
        Ok(row.into_tenant(id)?)
    }
}
