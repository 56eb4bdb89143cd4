//! SurrealDB connection management.
//!
//! The manager owns the live client behind a lock so the health monitor can
//! force a disconnect/reconnect cycle while repositories keep a cheap clone
//! of the manager.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use tenantry_core::error::TenantryResult;
use tenantry_core::repository::BackendTransport;
use tracing::{info, warn};

use crate::error::DbError;

/// Configuration for connecting to SurrealDB.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Endpoint URL (e.g., `ws://127.0.0.1:8000` or `mem://`).
    pub url: String,
    /// SurrealDB namespace.
    pub namespace: String,
    /// SurrealDB database name.
    pub database: String,
    /// Root username. Embedded endpoints run without credentials.
    pub username: Option<String>,
    /// Root password.
    pub password: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000".into(),
            namespace: "tenantry".into(),
            database: "main".into(),
            username: Some("root".into()),
            password: Some("root".into()),
        }
    }
}

impl DbConfig {
    /// In-memory embedded database, used by tests and local runs.
    pub fn memory() -> Self {
        Self {
            url: "mem://".into(),
            namespace: "test".into(),
            database: "test".into(),
            username: None,
            password: None,
        }
    }

    /// Read `TENANTRY_DB_*` variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env::var("TENANTRY_DB_URL").unwrap_or(defaults.url),
            namespace: env::var("TENANTRY_DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: env::var("TENANTRY_DB_DATABASE").unwrap_or(defaults.database),
            username: env::var("TENANTRY_DB_USERNAME").ok().or(defaults.username),
            password: env::var("TENANTRY_DB_PASSWORD").ok().or(defaults.password),
        }
    }

    /// True for engines that run inside this process instead of behind a
    /// socket. Those are neither authenticated nor reopened on reconnect.
    pub fn is_embedded(&self) -> bool {
        let scheme = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(scheme, _)| scheme);
        EMBEDDED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str())
    }
}

const EMBEDDED_SCHEMES: &[&str] = &[
    "mem",
    "memory",
    "rocksdb",
    "surrealkv",
    "surrealkv+versioned",
    "file",
    "indxdb",
];

struct Inner {
    config: DbConfig,
    client: RwLock<Surreal<Any>>,
    connected: AtomicBool,
}

/// Manages a (re)connectable SurrealDB client.
#[derive(Clone)]
pub struct DbManager {
    inner: Arc<Inner>,
}

impl DbManager {
    /// Connect to SurrealDB using the provided configuration.
    ///
    /// Authenticates as root when credentials are configured, selects the
    /// namespace and database, and returns a ready-to-use manager.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let client = open(config).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                client: RwLock::new(client),
                connected: AtomicBool::new(true),
            }),
        })
    }

    /// A clone of the live client, or `Disconnected` while the transport is
    /// forced down.
    pub fn client(&self) -> Result<Surreal<Any>, DbError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(DbError::Disconnected(self.inner.config.url.clone()));
        }
        let guard = self
            .inner
            .client
            .read()
            .map_err(|_| DbError::Disconnected(self.inner.config.url.clone()))?;
        Ok(guard.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }
}

/// Open, authenticate and select namespace/database.
async fn open(config: &DbConfig) -> Result<Surreal<Any>, DbError> {
    info!(
        url = %config.url,
        namespace = %config.namespace,
        database = %config.database,
        "Connecting to SurrealDB"
    );

    let db = any::connect(config.url.as_str()).await?;

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        if !config.is_embedded() {
            db.signin(Root {
                username: username.clone(),
                password: password.clone(),
            })
            .await?;
        }
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    info!("Successfully connected to SurrealDB");

    Ok(db)
}

impl BackendTransport for DbManager {
    async fn probe(&self) -> TenantryResult<()> {
        let db = self.client()?;
        db.query("RETURN true")
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn disconnect(&self) -> TenantryResult<()> {
        self.inner.connected.store(false, Ordering::Release);
        warn!(url = %self.inner.config.url, "SurrealDB transport forced down");
        Ok(())
    }

    async fn reconnect(&self) -> TenantryResult<()> {
        // The embedded engine lives inside the client; replacing it would
        // discard every record, so only the connected flag is restored.
        if !self.inner.config.is_embedded() {
            let fresh = open(&self.inner.config).await?;
            let mut guard = self
                .inner
                .client
                .write()
                .map_err(|_| DbError::Disconnected(self.inner.config.url.clone()))?;
            *guard = fresh;
        }
        self.inner.connected.store(true, Ordering::Release);
        info!(url = %self.inner.config.url, "SurrealDB transport reconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(url: &str) -> DbConfig {
        DbConfig {
            url: url.into(),
            ..DbConfig::default()
        }
    }

    #[test]
    fn embedded_engines_are_recognised() {
        for url in [
            "mem://",
            "memory",
            "rocksdb://data/tenantry.db",
            "surrealkv://data/tenantry",
            "surrealkv+versioned://data/tenantry",
            "file://data/tenantry.db",
            "indxdb://tenantry",
        ] {
            assert!(at(url).is_embedded(), "{url}");
        }
    }

    #[test]
    fn remote_engines_are_not_embedded() {
        for url in [
            "ws://localhost:8000",
            "wss://db.example.com",
            "http://127.0.0.1:8000",
            "tikv://pd:2379",
        ] {
            assert!(!at(url).is_embedded(), "{url}");
        }
    }
}
