//! Governance configuration.
//!
//! Every struct has a `Default` matching production values. `from_env`
//! overlays `TENANTRY_*` variables; a variable that is set but does not
//! parse is an error rather than a silent fallback.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GovernanceError;
use crate::retry::RetryPolicy;

/// Configuration for the connection health monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Time between scheduled probes (default: 20 s).
    pub probe_interval: Duration,
    /// Deadline for a single scheduled probe (default: 5 s).
    pub probe_timeout: Duration,
    /// Failure-free time in `Connected` before the link counts as stable
    /// (default: 2 s).
    pub stabilization_window: Duration,
    /// Consecutive failed probes that take the link `Offline` and start
    /// recovery (default: 3).
    pub failure_threshold: u32,
    /// How long recovery waits for in-flight writes (default: 5 s).
    pub flush_timeout: Duration,
    /// Pause between disconnect and reconnect (default: 1 s).
    pub cooldown: Duration,
    /// Deadline for the reconnect step (default: 10 s).
    pub reconnect_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(5),
            stabilization_window: Duration::from_secs(2),
            failure_threshold: 3,
            flush_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for the tenant-scoped store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Retry policy for reads and writes.
    pub retry: RetryPolicy,
    /// Lifetime of a cached document (default: 5 s).
    pub read_cache_ttl: Duration,
    /// Maximum cached documents (default: 1024).
    pub read_cache_capacity: usize,
    /// File backing the deferred-write queue. `None` keeps it in memory.
    pub deferred_queue_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            read_cache_ttl: Duration::from_secs(5),
            read_cache_capacity: 1024,
            deferred_queue_path: None,
        }
    }
}

/// Configuration for usage metering.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageConfig {
    /// Maximum age of a cached usage total (default: 120 s).
    pub refresh_interval: Duration,
    /// Maximum cached `(tenant, kind, window)` totals (default: 4096).
    pub cache_capacity: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(120),
            cache_capacity: 4096,
        }
    }
}

/// Everything the governance layer needs, bundled for the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GovernanceConfig {
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
    pub usage: UsageConfig,
}

impl GovernanceConfig {
    /// Read `TENANTRY_*` variables from the process environment.
    pub fn from_env() -> Result<Self, GovernanceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GovernanceError> {
        let vars = Vars { lookup: &lookup };
        let mut config = Self::default();

        let monitor = &mut config.monitor;
        vars.secs("TENANTRY_PROBE_INTERVAL_SECS", &mut monitor.probe_interval)?;
        vars.secs("TENANTRY_PROBE_TIMEOUT_SECS", &mut monitor.probe_timeout)?;
        vars.millis(
            "TENANTRY_STABILIZATION_WINDOW_MS",
            &mut monitor.stabilization_window,
        )?;
        vars.parse("TENANTRY_FAILURE_THRESHOLD", &mut monitor.failure_threshold)?;
        vars.secs("TENANTRY_FLUSH_TIMEOUT_SECS", &mut monitor.flush_timeout)?;
        vars.secs("TENANTRY_RECOVERY_COOLDOWN_SECS", &mut monitor.cooldown)?;
        vars.secs(
            "TENANTRY_RECONNECT_TIMEOUT_SECS",
            &mut monitor.reconnect_timeout,
        )?;
        if monitor.failure_threshold == 0 {
            return Err(GovernanceError::Config {
                key: "TENANTRY_FAILURE_THRESHOLD".into(),
                value: "0".into(),
            });
        }

        let store = &mut config.store;
        vars.parse("TENANTRY_RETRY_MAX_ATTEMPTS", &mut store.retry.max_attempts)?;
        vars.millis("TENANTRY_RETRY_BASE_DELAY_MS", &mut store.retry.base_delay)?;
        vars.millis("TENANTRY_RETRY_MAX_DELAY_MS", &mut store.retry.max_delay)?;
        vars.millis(
            "TENANTRY_RETRY_ATTEMPT_TIMEOUT_MS",
            &mut store.retry.attempt_timeout,
        )?;
        vars.secs("TENANTRY_READ_CACHE_TTL_SECS", &mut store.read_cache_ttl)?;
        vars.parse(
            "TENANTRY_READ_CACHE_CAPACITY",
            &mut store.read_cache_capacity,
        )?;
        if let Some(path) = vars.get("TENANTRY_DEFERRED_QUEUE_PATH") {
            store.deferred_queue_path = Some(PathBuf::from(path));
        }

        let usage = &mut config.usage;
        vars.secs("TENANTRY_USAGE_REFRESH_SECS", &mut usage.refresh_interval)?;
        vars.parse("TENANTRY_USAGE_CACHE_CAPACITY", &mut usage.cache_capacity)?;

        Ok(config)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// A set, non-blank variable.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), GovernanceError> {
        if let Some(raw) = self.get(key) {
            *target = raw.parse().map_err(|_| GovernanceError::Config {
                key: key.to_string(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    fn secs(&self, key: &str, target: &mut Duration) -> Result<(), GovernanceError> {
        let mut secs = target.as_secs();
        self.parse(key, &mut secs)?;
        if self.get(key).is_some() {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn millis(&self, key: &str, target: &mut Duration) -> Result<(), GovernanceError> {
        let mut millis = target.as_millis() as u64;
        self.parse(key, &mut millis)?;
        if self.get(key).is_some() {
            *target = Duration::from_millis(millis);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = GovernanceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, GovernanceConfig::default());
        assert_eq!(config.monitor.probe_interval, Duration::from_secs(20));
        assert_eq!(config.monitor.failure_threshold, 3);
        assert_eq!(config.usage.refresh_interval, Duration::from_secs(120));
    }

    #[test]
    fn overrides_are_applied() {
        let config = GovernanceConfig::from_lookup(lookup(&[
            ("TENANTRY_PROBE_INTERVAL_SECS", "5"),
            ("TENANTRY_STABILIZATION_WINDOW_MS", "750"),
            ("TENANTRY_FAILURE_THRESHOLD", "4"),
            ("TENANTRY_RETRY_MAX_ATTEMPTS", "6"),
            ("TENANTRY_DEFERRED_QUEUE_PATH", "/var/lib/tenantry/deferred.jsonl"),
            ("TENANTRY_USAGE_REFRESH_SECS", " 30 "),
        ]))
        .unwrap();

        assert_eq!(config.monitor.probe_interval, Duration::from_secs(5));
        assert_eq!(
            config.monitor.stabilization_window,
            Duration::from_millis(750)
        );
        assert_eq!(config.monitor.failure_threshold, 4);
        assert_eq!(config.store.retry.max_attempts, 6);
        assert_eq!(
            config.store.deferred_queue_path,
            Some(PathBuf::from("/var/lib/tenantry/deferred.jsonl"))
        );
        assert_eq!(config.usage.refresh_interval, Duration::from_secs(30));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = GovernanceConfig::from_lookup(lookup(&[(
            "TENANTRY_PROBE_INTERVAL_SECS",
            "soon",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("TENANTRY_PROBE_INTERVAL_SECS"));

        assert!(
            GovernanceConfig::from_lookup(lookup(&[("TENANTRY_FAILURE_THRESHOLD", "0")]))
                .is_err()
        );
    }
}
