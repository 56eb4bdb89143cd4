//! Backend connection health monitoring and recovery.
//!
//! The monitor owns the only writer side of [`ConnectivityStatus`]. It probes
//! the backend on a fixed interval (and immediately when told the network
//! came back), moves the state machine
//!
//! ```text
//! Connecting ──ok──▶ Connected ──fail──▶ Degraded ──fail×N──▶ Offline
//!      ▲                 ▲                                      │
//!      └───── fail ──────┴────────── ok / recovery ok ──────────┘
//! ```
//!
//! and, each time the consecutive-failure count reaches a multiple of the
//! threshold, runs the recovery procedure: flush pending writes, disconnect,
//! cool down, reconnect, re-probe with the aggressive probe policy. A failed
//! recovery leaves the link `Offline` with `degraded_mode` set; the next
//! attempt waits for another full run of failed scheduled probes.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_core::models::connectivity::{ConnectivityState, HealthSnapshot};
use tenantry_core::repository::BackendTransport;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::status::{ConnectivityStatus, PendingWrites};

/// Periodic reachability prober for one backend.
///
/// Cloning shares the same monitor; `start` and `stop` may be called from
/// any clone.
pub struct ConnectionHealthMonitor<T: BackendTransport + 'static> {
    inner: Arc<MonitorInner<T>>,
}

impl<T: BackendTransport + 'static> Clone for ConnectionHealthMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MonitorInner<T> {
    transport: T,
    status: ConnectivityStatus,
    config: MonitorConfig,
    pending: Option<PendingWrites>,
    /// Detached: recovery re-probes run while the status reads `Offline`.
    retry: RetryExecutor,
    wake: Notify,
    shutdown: Notify,
    connected_since: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BackendTransport + 'static> ConnectionHealthMonitor<T> {
    pub fn new(transport: T, status: ConnectivityStatus, config: MonitorConfig) -> Self {
        Self::build(transport, status, config, None)
    }

    /// A monitor whose recovery waits for these writes to drain before it
    /// tears the connection down.
    pub fn with_pending_writes(
        transport: T,
        status: ConnectivityStatus,
        config: MonitorConfig,
        pending: PendingWrites,
    ) -> Self {
        Self::build(transport, status, config, Some(pending))
    }

    fn build(
        transport: T,
        status: ConnectivityStatus,
        config: MonitorConfig,
        pending: Option<PendingWrites>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                transport,
                status,
                config,
                pending,
                retry: RetryExecutor::detached(),
                wake: Notify::new(),
                shutdown: Notify::new(),
                connected_since: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> &ConnectivityStatus {
        &self.inner.status
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.inner.status.subscribe()
    }

    /// Spawn the probe loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        info!(
            interval_ms = self.inner.config.probe_interval.as_millis() as u64,
            failure_threshold = self.inner.config.failure_threshold,
            "Starting connection health monitor"
        );
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move { monitor.run().await }));
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn stop(&self) {
        let handle = lock(&self.inner.task).take();
        let Some(handle) = handle else {
            return;
        };
        self.inner.shutdown.notify_one();
        if let Err(e) = handle.await {
            error!(error = %e, "Health monitor task ended abnormally");
        }
        info!("Connection health monitor stopped");
    }

    /// The OS reported the network as gone: go `Offline` without probing.
    pub fn notify_network_offline(&self) {
        *lock(&self.inner.connected_since) = None;
        let before = self.inner.status.state();
        self.inner.status.update(|s| {
            s.state = ConnectivityState::Offline;
            s.stable = false;
        });
        if before != ConnectivityState::Offline {
            warn!(previous = %before, "Network reported offline");
        }
    }

    /// The OS reported the network as back: probe now.
    pub fn notify_network_online(&self) {
        info!("Network reported online, scheduling probe");
        self.inner.wake.notify_one();
    }

    /// Run one probe and apply its outcome, including recovery if the
    /// failure threshold is reached.
    pub async fn probe_once(&self) -> ConnectivityState {
        let probe = tokio::time::timeout(
            self.inner.config.probe_timeout,
            self.inner.transport.probe(),
        );
        let outcome = match probe.await {
            Ok(result) => result,
            Err(_) => Err(TenantryError::Timeout(self.inner.config.probe_timeout)),
        };
        match outcome {
            Ok(()) => self.record_success(),
            Err(e) => self.record_failure(e).await,
        }
        self.check_stability();
        self.inner.status.state()
    }

    /// Mark the link stable once it has stayed `Connected` for the
    /// stabilization window. Returns the current `stable` flag.
    pub fn check_stability(&self) -> bool {
        let snapshot = self.inner.status.snapshot();
        if snapshot.state != ConnectivityState::Connected {
            return false;
        }
        if snapshot.stable {
            return true;
        }
        let Some(since) = *lock(&self.inner.connected_since) else {
            return false;
        };
        if since.elapsed() < self.inner.config.stabilization_window {
            return false;
        }
        self.inner.status.update(|s| s.stable = true);
        info!("Backend connection stable");
        true
    }

    fn stability_deadline(&self) -> Option<Instant> {
        let snapshot = self.inner.status.snapshot();
        if snapshot.state != ConnectivityState::Connected || snapshot.stable {
            return None;
        }
        let since = *lock(&self.inner.connected_since);
        since.map(|at| at + self.inner.config.stabilization_window)
    }

    fn record_success(&self) {
        let before = self.inner.status.snapshot();
        let resumed = before.state != ConnectivityState::Connected;
        if resumed {
            *lock(&self.inner.connected_since) = Some(Instant::now());
        }
        self.inner.status.update(|s| {
            s.state = ConnectivityState::Connected;
            s.consecutive_failures = 0;
            s.last_success_at = Some(Utc::now());
            s.degraded_mode = false;
            if resumed {
                s.stable = false;
            }
        });
        if resumed {
            info!(previous = %before.state, "Backend connection established");
        } else {
            debug!("Backend probe succeeded");
        }
    }

    async fn record_failure(&self, err: TenantryError) {
        *lock(&self.inner.connected_since) = None;
        let before = self.inner.status.snapshot();
        let failures = before.consecutive_failures.saturating_add(1);
        let threshold = self.inner.config.failure_threshold.max(1);

        if failures < threshold {
            let next = match before.state {
                ConnectivityState::Connecting => ConnectivityState::Connecting,
                ConnectivityState::Offline => ConnectivityState::Offline,
                ConnectivityState::Connected | ConnectivityState::Degraded => {
                    ConnectivityState::Degraded
                }
            };
            self.inner.status.update(|s| {
                s.state = next;
                s.consecutive_failures = failures;
                s.stable = false;
            });
            warn!(failures, threshold, state = %next, error = %err, "Backend probe failed");
            return;
        }

        self.inner.status.update(|s| {
            s.state = ConnectivityState::Offline;
            s.consecutive_failures = failures;
            s.stable = false;
        });
        if before.state != ConnectivityState::Offline {
            error!(failures, error = %err, "Backend unreachable, going offline");
        }
        if failures % threshold == 0 {
            self.recover().await;
        }
    }

    async fn recover(&self) {
        let inner = &self.inner;
        let config = &inner.config;
        warn!("Starting connection recovery");

        if let Some(pending) = &inner.pending {
            if !pending.wait_idle(config.flush_timeout).await {
                warn!(
                    pending = pending.count(),
                    "Pending writes did not flush before recovery"
                );
            }
        }

        if let Err(e) = inner.transport.disconnect().await {
            warn!(error = %e, "Disconnect during recovery failed");
        }

        tokio::time::sleep(config.cooldown).await;

        let reconnected =
            match tokio::time::timeout(config.reconnect_timeout, inner.transport.reconnect()).await
            {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "Reconnect failed");
                    false
                }
                Err(_) => {
                    warn!(
                        timeout_ms = config.reconnect_timeout.as_millis() as u64,
                        "Reconnect timed out"
                    );
                    false
                }
            };

        let probed: TenantryResult<()> = if reconnected {
            inner
                .retry
                .execute(&RetryPolicy::probe(), || inner.transport.probe())
                .await
        } else {
            Err(TenantryError::Transient("reconnect failed".into()))
        };

        match probed {
            Ok(()) => {
                self.record_success();
                info!("Connection recovery succeeded");
            }
            Err(e) => {
                inner.status.update(|s| s.degraded_mode = true);
                error!(error = %e, "Connection recovery failed, running in degraded mode");
            }
        }
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.stability_deadline();
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                _ = self.inner.wake.notified() => {
                    self.probe_once().await;
                    ticker.reset();
                }
                _ = until(deadline) => {
                    self.check_stability();
                }
            }
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
