//! Tenantry Governance — tenant-isolated data access, connection
//! resilience and usage governance over a hosted document store.
//!
//! Components, leaves first:
//! - [`RetryExecutor`]: bounded exponential-backoff retry
//! - [`ConnectionHealthMonitor`]: probing, connectivity state and recovery
//! - [`TenantScopedStore`]: the tenant-checked CRUD façade
//! - [`UsageMeter`]: usage records and quota admission
//! - [`BudgetGovernor`]: monthly budget signals
//!
//! Everything is generic over the backend traits in `tenantry-core`, so
//! this crate has no dependency on the database crate.

pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod outbox;
pub mod replay;
pub mod retry;
pub mod status;
pub mod store;
pub mod usage;

pub use budget::BudgetGovernor;
pub use cache::ReadCache;
pub use config::{GovernanceConfig, MonitorConfig, StoreConfig, UsageConfig};
pub use error::GovernanceError;
pub use health::ConnectionHealthMonitor;
pub use outbox::{DeferredWrite, DegradedWriteQueue};
pub use replay::replay_deferred;
pub use retry::{FailureCounter, RetryExecutor, RetryPolicy};
pub use status::{ConnectivityStatus, PendingWrites};
pub use store::{ReconcileReport, TenantScopedStore, WriteOutcome};
pub use usage::UsageMeter;
