//! Tenantry Core — domain models, error taxonomy and the backend traits
//! shared by every Tenantry crate.

pub mod error;
pub mod models;
pub mod repository;

pub use error::{TenantryError, TenantryResult};
pub use models::tenant::TenantId;
