//! Lightweight telemetry facade for the site agent binaries. Provides
//! structured counters/latencies without requiring external exporters so
//! tests can assert instrumentation behavior directly.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::SystemTime,
};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!("Only one of the `dev`, `test`, or `prod` features may be enabled for qkd-telemetry.");

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 1_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(feature = "prod")]
const DEFAULT_FLUSH_MS: u64 = 5_000;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Endpoint where telemetry would be shipped (not used by this facade).
    pub endpoint: String,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TelemetryConfig {
    pub fn sample(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), "site-agent".into())]),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, Vec<u64>>,
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Vec<u64>>,
}

/// Counter and latency names emitted by the detection gating, key store,
/// and site agent crates. Kept here so call sites agree on spelling.
pub mod metrics {
    pub const DETECTIONS_RECEIVED: &str = "gating.detections_received";
    pub const BINS_SATURATED: &str = "gating.bins_saturated";
    pub const HISTOGRAM_BUILD_MS: &str = "gating.histogram_build_ms";
    pub const KEYS_ISSUED: &str = "keystore.keys_issued";
    pub const KEYS_EXPIRED: &str = "keystore.keys_expired";
    pub const HOP_COMBINE_MS: &str = "keystore.hop_combine_ms";
    pub const HOP_COMBINE_FAILURES: &str = "keystore.hop_combine_failures";
    pub const LINK_STATUS_CHANGES: &str = "site_agent.link_status_changes";
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock().unwrap();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        let mut guard = self.state.lock().unwrap();
        guard.latencies_ms.entry(name.to_owned()).or_default().push(value);
    }

    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock().unwrap();
        let snapshot = TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: guard.counters.clone(),
            latencies_ms: guard.latencies_ms.clone(),
        };
        guard.counters.clear();
        guard.latencies_ms.clear();
        snapshot
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("http://localhost:4318"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter(metrics::KEYS_ISSUED, 1).unwrap();
        handle.record_counter(metrics::KEYS_ISSUED, 2).unwrap();
        handle.record_latency_ms(metrics::HOP_COMBINE_MS, 42);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counters[metrics::KEYS_ISSUED], 3);
        assert_eq!(snapshot.latencies_ms[metrics::HOP_COMBINE_MS], vec![42]);
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter(metrics::KEYS_ISSUED, u64::MAX).unwrap();
        let err = handle.record_counter(metrics::KEYS_ISSUED, 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn flush_clears_state() {
        let handle = handle();
        handle.record_counter(metrics::KEYS_ISSUED, 1).unwrap();
        handle.flush();
        let second = handle.flush();
        assert!(second.counters.is_empty());
    }
}
