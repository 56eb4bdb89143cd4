//! Shared fixtures for the governance integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::document::{Document, DocumentQuery, NewDocument};
use tenantry_core::models::tenant::TenantId;
use tenantry_core::repository::{BackendTransport, DocumentStore};
use tenantry_db::repository::SurrealDocumentStore;
use tenantry_db::{DbConfig, DbManager};
use tenantry_governance::{RetryPolicy, StoreConfig};

/// Helper: spin up in-memory DB and run migrations.
pub async fn memory_db() -> DbManager {
    let db = DbManager::connect(&DbConfig::memory()).await.unwrap();
    tenantry_db::run_migrations(&db.client().unwrap())
        .await
        .unwrap();
    db
}

pub fn tenant(raw: &str) -> TenantId {
    TenantId::parse(raw).unwrap()
}

/// Short, deterministic retries so tests stay fast on a real clock.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(20),
        jitter: Duration::ZERO,
        attempt_timeout: Duration::from_secs(5),
    }
}

pub fn store_config() -> StoreConfig {
    StoreConfig {
        retry: fast_retry(),
        ..StoreConfig::default()
    }
}

/// Fault switches shared between a test and its [`FlakyStore`].
#[derive(Clone, Default)]
pub struct Faults {
    /// Every call fails transiently while set.
    pub down: Arc<AtomicBool>,
    /// The next N calls fail transiently.
    pub fail_next: Arc<AtomicU32>,
    /// After N more calls the backend goes down.
    pub down_after: Arc<Mutex<Option<u32>>>,
    /// The next N inserts are written but report a transient failure.
    pub lose_ack_next: Arc<AtomicU32>,
    /// Batches fail as if a statement in the middle was rejected.
    pub reject_batches: Arc<AtomicBool>,
    /// Calls that reached the wrapper.
    pub calls: Arc<AtomicU32>,
}

impl Faults {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn down_after(&self, n: u32) {
        *self.down_after.lock().unwrap() = Some(n);
    }

    pub fn lose_ack_next(&self, n: u32) {
        self.lose_ack_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> TenantryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut down_after = self.down_after.lock().unwrap();
            match down_after.as_mut() {
                Some(0) => {
                    self.set_down(true);
                    *down_after = None;
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(TenantryError::Transient("backend down".into()));
        }
        let take = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if take.is_ok() {
            return Err(TenantryError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

/// A [`DocumentStore`] that forwards to a real one unless told to fail.
pub struct FlakyStore<S> {
    pub inner: S,
    pub faults: Faults,
}

impl FlakyStore<SurrealDocumentStore> {
    pub async fn over_memory_db() -> (Self, Faults) {
        let faults = Faults::default();
        let store = Self {
            inner: SurrealDocumentStore::new(memory_db().await),
            faults: faults.clone(),
        };
        (store, faults)
    }
}

impl<S: DocumentStore> DocumentStore for FlakyStore<S> {
    async fn insert(&self, doc: NewDocument) -> TenantryResult<Document> {
        self.faults.check()?;
        let lost = self
            .faults
            .lose_ack_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let written = self.inner.insert(doc).await?;
        if lost {
            return Err(TenantryError::Transient("acknowledgement lost".into()));
        }
        Ok(written)
    }

    async fn insert_batch(&self, docs: Vec<NewDocument>) -> TenantryResult<Vec<Document>> {
        self.faults.check()?;
        if self.faults.reject_batches.load(Ordering::SeqCst) {
            return Err(TenantryError::Database(
                "statement 3 of batch rejected, transaction cancelled".into(),
            ));
        }
        self.inner.insert_batch(docs).await
    }

    async fn get(&self, id: &str) -> TenantryResult<Option<Document>> {
        self.faults.check()?;
        self.inner.get(id).await
    }

    async fn find(&self, query: &DocumentQuery) -> TenantryResult<Vec<Document>> {
        self.faults.check()?;
        self.inner.find(query).await
    }

    async fn update_data(
        &self,
        id: &str,
        data: Map<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> TenantryResult<Document> {
        self.faults.check()?;
        self.inner.update_data(id, data, updated_at).await
    }

    async fn remove(&self, id: &str) -> TenantryResult<bool> {
        self.faults.check()?;
        self.inner.remove(id).await
    }
}

/// A [`BackendTransport`] whose reachability is flipped by the test.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub up: Arc<AtomicBool>,
    /// Probes never answer while set.
    pub hang: Arc<AtomicBool>,
    /// A reconnect brings the backend back.
    pub heal_on_reconnect: Arc<AtomicBool>,
    pub probes: Arc<AtomicU32>,
    pub disconnects: Arc<AtomicU32>,
    pub reconnects: Arc<AtomicU32>,
}

impl ScriptedTransport {
    pub fn up() -> Self {
        let transport = Self::default();
        transport.set_up(true);
        transport
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl BackendTransport for ScriptedTransport {
    async fn probe(&self) -> TenantryResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TenantryError::Transient("connection refused".into()))
        }
    }

    async fn disconnect(&self) -> TenantryResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> TenantryResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.heal_on_reconnect.load(Ordering::SeqCst) {
            self.set_up(true);
        }
        Ok(())
    }
}
