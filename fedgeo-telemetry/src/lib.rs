//! Telemetry facade for fedgeo silos and coordinators: named counters and
//! latency samples that tests can assert on, plus the [`QueryLog`] that
//! accumulates per-query wall time and bytes exchanged.

mod query_log;

pub use query_log::{QueryLog, QueryLogSummary, QueryTimer};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for fedgeo-telemetry."
);

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 1_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(feature = "prod")]
const DEFAULT_FLUSH_MS: u64 = 30_000;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// How often long-running processes log a snapshot.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Labels attached to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), component.into())]),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("query log histogram unavailable: {0}")]
    Histogram(String),
}

/// Folded latency samples of one series since the last flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn record(&mut self, value: u64) {
        self.samples += 1;
        self.total_ms = self.total_ms.saturating_add(value);
        self.max_ms = self.max_ms.max(value);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.samples as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies: BTreeMap<String, LatencySummary>,
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies: BTreeMap<String, LatencySummary>,
}

/// Shared counters and latency series of one silo or coordinator process.
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
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        self.state
            .lock()
            .latencies
            .entry(name.to_owned())
            .or_default()
            .record(value);
    }

    /// Current value of a counter since the last flush.
    pub fn counter(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Drains counters and latency series into a snapshot.
    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock();
        TelemetrySnapshot {
            labels: self.config.labels.clone(),
            counters: std::mem::take(&mut guard.counters),
            latencies: std::mem::take(&mut guard.latencies),
        }
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("silo"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter("silo.released", 4).unwrap();
        handle.record_counter("silo.released", 2).unwrap();
        handle.record_latency_ms("silo.release", 3);
        assert_eq!(handle.counter("silo.released"), 6);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counters["silo.released"], 6);
        assert_eq!(
            snapshot.latencies["silo.release"],
            LatencySummary {
                samples: 1,
                total_ms: 3,
                max_ms: 3
            }
        );
        assert_eq!(snapshot.labels["component"], "silo");
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("silo.dummies", u64::MAX).unwrap();
        let err = handle.record_counter("silo.dummies", 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn latency_summary_folds_samples() {
        let handle = handle();
        for value in [2, 8, 5] {
            handle.record_latency_ms("coordinator.verify", value);
        }
        let summary = handle.flush().latencies["coordinator.verify"];
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.max_ms, 8);
        assert_eq!(summary.mean_ms(), 5.0);
    }

    #[test]
    fn flush_clears_state() {
        let handle = handle();
        handle.record_counter("silo.released", 1).unwrap();
        handle.flush();
        assert!(handle.flush().counters.is_empty());
    }
}
