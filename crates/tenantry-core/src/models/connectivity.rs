//! Backend connectivity model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity of the process to the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectivityState {
    /// No probe has succeeded yet.
    #[default]
    Connecting,
    Connected,
    /// Probes are failing but the failure threshold has not been reached.
    Degraded,
    /// Operations should fail fast instead of retrying.
    Offline,
}

impl ConnectivityState {
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectivityState::Connecting => 0,
            ConnectivityState::Connected => 1,
            ConnectivityState::Degraded => 2,
            ConnectivityState::Offline => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectivityState::Connected,
            2 => ConnectivityState::Degraded,
            3 => ConnectivityState::Offline,
            _ => ConnectivityState::Connecting,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Read-only health signal exposed to UI and observability collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthSnapshot {
    pub state: ConnectivityState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Connected with no failures for at least the stabilization window.
    pub stable: bool,
    /// Recovery failed; the UI should show a degraded-mode indicator.
    pub degraded_mode: bool,
}
