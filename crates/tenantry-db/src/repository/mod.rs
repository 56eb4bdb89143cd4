//! SurrealDB repository implementations.

mod document;
mod tenant;

pub use document::SurrealDocumentStore;
pub use tenant::SurrealTenantRepository;
