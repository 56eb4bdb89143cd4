//! Deferred writes captured while the backend is unreachable.
//!
//! The queue is FIFO. With a path configured every entry is also kept as
//! one JSON line in that file, so deferred work survives a restart; the
//! file is rewritten whenever entries leave the queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tenantry_core::error::TenantryResult;
use tenantry_core::models::document::NewDocument;
use tenantry_core::models::tenant::TenantId;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::GovernanceError;

/// A store write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeferredWrite {
    /// Fully stamped at defer time; the id makes the replay idempotent.
    Create { document: NewDocument },
    Update {
        collection: String,
        id: String,
        tenant_id: TenantId,
        patch: Map<String, Value>,
        deferred_at: DateTime<Utc>,
    },
    Delete {
        id: String,
        tenant_id: TenantId,
        deferred_at: DateTime<Utc>,
    },
}

impl DeferredWrite {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            DeferredWrite::Create { document } => &document.tenant_id,
            DeferredWrite::Update { tenant_id, .. } | DeferredWrite::Delete { tenant_id, .. } => {
                tenant_id
            }
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            DeferredWrite::Create { document } => &document.id,
            DeferredWrite::Update { id, .. } | DeferredWrite::Delete { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeferredWrite::Create { .. } => "create",
            DeferredWrite::Update { .. } => "update",
            DeferredWrite::Delete { .. } => "delete",
        }
    }
}

struct QueueState {
    entries: VecDeque<DeferredWrite>,
    path: Option<PathBuf>,
}

/// FIFO of [`DeferredWrite`]s, optionally mirrored to a JSON-lines file.
#[derive(Clone)]
pub struct DegradedWriteQueue {
    state: Arc<Mutex<QueueState>>,
}

impl DegradedWriteQueue {
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                entries: VecDeque::new(),
                path: None,
            })),
        }
    }

    /// Open a file-backed queue, loading entries left by a previous run.
    ///
    /// Lines that no longer decode are skipped with a warning.
    pub async fn open(path: impl Into<PathBuf>) -> TenantryResult<Self> {
        let path = path.into();
        let entries = load(&path).await?;
        if !entries.is_empty() {
            info!(
                path = %path.display(),
                count = entries.len(),
                "Loaded deferred writes from previous run"
            );
        }
        Ok(Self {
            state: Arc::new(Mutex::new(QueueState {
                entries,
                path: Some(path),
            })),
        })
    }

    pub async fn push(&self, write: DeferredWrite) -> TenantryResult<()> {
        let mut state = self.state.lock().await;
        if let Some(path) = &state.path {
            append(path, &write).await?;
        }
        debug!(
            op = write.kind(),
            tenant_id = %write.tenant_id(),
            document_id = write.document_id(),
            "Write deferred"
        );
        state.entries.push_back(write);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the queued writes, oldest first.
    pub async fn entries(&self) -> Vec<DeferredWrite> {
        self.state.lock().await.entries.iter().cloned().collect()
    }

    /// Whether a write for this document is still waiting to be replayed.
    pub async fn holds(&self, tenant_id: &TenantId, id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .any(|w| w.document_id() == id && w.tenant_id() == tenant_id)
    }

    /// The oldest queued write, left in place.
    pub async fn front(&self) -> Option<DeferredWrite> {
        self.state.lock().await.entries.front().cloned()
    }

    /// Remove the oldest write once it has been applied or discarded.
    ///
    /// The file is rewritten before the entry leaves memory, so a failed
    /// rewrite keeps the write queued.
    pub async fn pop_front(&self) -> TenantryResult<Option<DeferredWrite>> {
        let mut state = self.state.lock().await;
        if state.entries.is_empty() {
            return Ok(None);
        }
        if let Some(path) = &state.path {
            rewrite(path, state.entries.iter().skip(1)).await?;
        }
        Ok(state.entries.pop_front())
    }
}

async fn load(path: &Path) -> Result<VecDeque<DeferredWrite>, GovernanceError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = VecDeque::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeferredWrite>(line) {
            Ok(write) => entries.push_back(write),
            Err(e) => warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping undecodable deferred write"
            ),
        }
    }
    Ok(entries)
}

async fn append(path: &Path, write: &DeferredWrite) -> Result<(), GovernanceError> {
    let mut line = serde_json::to_string(write)?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn rewrite<'a>(
    path: &Path,
    entries: impl Iterator<Item = &'a DeferredWrite>,
) -> Result<(), GovernanceError> {
    let mut body = String::new();
    for write in entries {
        body.push_str(&serde_json::to_string(write)?);
        body.push('\n');
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
