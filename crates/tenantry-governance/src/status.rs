//! Shared handles passed between the health monitor and the data path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use tenantry_core::models::connectivity::{ConnectivityState, HealthSnapshot};
use tokio::sync::{Notify, watch};

/// Process-wide connectivity signal.
///
/// Written by [`ConnectionHealthMonitor`](crate::health::ConnectionHealthMonitor),
/// read by the retry executor and by anything that renders health. Cloning
/// shares the same underlying state.
#[derive(Clone)]
pub struct ConnectivityStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    state: AtomicU8,
    snapshot: watch::Sender<HealthSnapshot>,
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityStatus {
    pub fn new() -> Self {
        let initial = HealthSnapshot::default();
        let (snapshot, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(StatusInner {
                state: AtomicU8::new(initial.state.as_u8()),
                snapshot,
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receive every published snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Apply `f` to the snapshot and notify subscribers if anything changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        self.inner.snapshot.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            self.inner
                .state
                .store(snapshot.state.as_u8(), Ordering::Release);
            *snapshot != before
        });
    }
}

/// Count of store writes currently in flight.
///
/// The health monitor waits for this to drain before it tears the
/// connection down.
#[derive(Clone, Default)]
pub struct PendingWrites {
    inner: Arc<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Register a write; it stays pending until the guard is dropped.
    pub fn track(&self) -> PendingGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        PendingGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Wait until no writes are pending. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                // Registered before the check so a concurrent drop cannot be missed.
                let notified = self.inner.idle.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

pub struct PendingGuard {
    inner: Arc<PendingInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_publishes_only_changes() {
        let status = ConnectivityStatus::new();
        let mut rx = status.subscribe();
        assert!(!rx.has_changed().unwrap());

        status.update(|s| s.state = ConnectivityState::Connected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, ConnectivityState::Connected);
        assert_eq!(status.state(), ConnectivityState::Connected);

        status.update(|s| s.state = ConnectivityState::Connected);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_observes_guard_drop() {
        let pending = PendingWrites::new();
        let guard = pending.track();
        assert_eq!(pending.count(), 1);

        assert!(!pending.wait_idle(Duration::from_millis(50)).await);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(pending.count(), 0);
    }
}
