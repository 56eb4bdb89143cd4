//! Background replay of deferred writes.

use std::sync::Arc;
use std::time::Duration;

use tenantry_core::models::connectivity::{ConnectivityState, HealthSnapshot};
use tenantry_core::repository::DocumentStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::store::TenantScopedStore;

/// Replay deferred writes each time the backend becomes reachable, and on
/// every tick of `every` while it is connected and writes are queued.
///
/// The tick picks up writes deferred by an outage too short to take the
/// monitor out of `Connected`. Returns once the status sender is gone.
pub async fn replay_deferred<S: DocumentStore>(
    store: Arc<TenantScopedStore<S>>,
    mut health: watch::Receiver<HealthSnapshot>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut connected = health.borrow_and_update().state == ConnectivityState::Connected;

    loop {
        tokio::select! {
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_connected =
                    health.borrow_and_update().state == ConnectivityState::Connected;
                let reconnected = now_connected && !connected;
                connected = now_connected;
                if reconnected {
                    replay(&store).await;
                }
            }
            _ = ticker.tick() => {
                if connected && store.deferred_len().await > 0 {
                    replay(&store).await;
                }
            }
        }
    }
    debug!("Deferred write replay stopped");
}

async fn replay<S: DocumentStore>(store: &TenantScopedStore<S>) {
    if let Err(e) = store.reconcile_deferred().await {
        error!(error = %e, "Deferred write replay failed");
    }
}
