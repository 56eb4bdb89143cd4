//! Tenantry Database — SurrealDB connection management and backend
//! implementations.
//!
//! This crate provides:
//! - Connection management ([`DbManager`], [`DbConfig`]); the manager also
//!   serves as the health monitor's transport
//! - Schema initialization and migrations ([`run_migrations`])
//! - Error types ([`DbError`]) and their mapping onto `TenantryError`
//! - The document store and tenant registry in [`repository`]

mod connection;
mod error;
mod schema;

pub mod repository;

pub use connection::{DbConfig, DbManager};
pub use error::DbError;
pub use schema::{run_migrations, schema_v1};
