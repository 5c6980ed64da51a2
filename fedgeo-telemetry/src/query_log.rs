use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::TelemetryError;

/// Longest query latency tracked exactly: one hour, in microseconds.
const MAX_LATENCY_MICROS: u64 = 3_600_000_000;

struct QueryLogState {
    queries: u64,
    total_time: Duration,
    total_bytes: u64,
    latency_micros: Histogram<u64>,
}

/// Running totals of completed queries. Cloning shares the same log.
#[derive(Clone)]
pub struct QueryLog {
    state: Arc<Mutex<QueryLogState>>,
}

/// Started when a query begins; handed back to [`QueryLog::finish`].
#[derive(Debug)]
pub struct QueryTimer {
    started: Instant,
}

impl QueryTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryLogSummary {
    pub queries: u64,
    pub total_time: Duration,
    pub total_bytes: u64,
    pub avg_time_ms: f64,
    pub avg_bytes: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl QueryLog {
    pub fn new() -> Result<Self, TelemetryError> {
        let latency_micros = Histogram::new_with_bounds(1, MAX_LATENCY_MICROS, 3)
            .map_err(|err| TelemetryError::Histogram(format!("{err:?}")))?;
        Ok(Self {
            state: Arc::new(Mutex::new(QueryLogState {
                queries: 0,
                total_time: Duration::ZERO,
                total_bytes: 0,
                latency_micros,
            })),
        })
    }

    pub fn start(&self) -> QueryTimer {
        QueryTimer {
            started: Instant::now(),
        }
    }

    /// Closes one query and folds its time and byte count into the totals.
    pub fn finish(&self, timer: QueryTimer, bytes: u64) -> Duration {
        let elapsed = timer.elapsed();
        let mut state = self.state.lock();
        state.queries += 1;
        state.total_time += elapsed;
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        state
            .latency_micros
            .saturating_record((elapsed.as_micros() as u64).max(1));
        elapsed
    }

    /// Bytes attributed to the log without closing a query.
    pub fn add_bytes(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.total_bytes = state.total_bytes.saturating_add(bytes);
    }

    pub fn summary(&self) -> QueryLogSummary {
        let state = self.state.lock();
        let per_query = |total: f64| {
            if state.queries == 0 {
                0.0
            } else {
                total / state.queries as f64
            }
        };
        let quantile_ms = |q: f64| {
            if state.queries == 0 {
                0.0
            } else {
                state.latency_micros.value_at_quantile(q) as f64 / 1_000.0
            }
        };
        QueryLogSummary {
            queries: state.queries,
            total_time: state.total_time,
            total_bytes: state.total_bytes,
            avg_time_ms: per_query(state.total_time.as_secs_f64() * 1_000.0),
            avg_bytes: per_query(state.total_bytes as f64),
            p50_ms: quantile_ms(0.50),
            p95_ms: quantile_ms(0.95),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.queries = 0;
        state.total_time = Duration::ZERO;
        state.total_bytes = 0;
        state.latency_micros.reset();
    }
}

impl fmt::Display for QueryLogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "queries:        {}", self.queries)?;
        writeln!(f, "avg time (ms):  {:.3}", self.avg_time_ms)?;
        writeln!(f, "p50/p95 (ms):   {:.3} / {:.3}", self.p50_ms, self.p95_ms)?;
        writeln!(f, "avg bytes:      {:.1}", self.avg_bytes)?;
        write!(f, "total bytes:    {}", self.total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_finished_queries() {
        let log = QueryLog::new().unwrap();
        log.finish(log.start(), 100);
        log.finish(log.start(), 300);
        let summary = log.summary();
        assert_eq!(summary.queries, 2);
        assert_eq!(summary.total_bytes, 400);
        assert_eq!(summary.avg_bytes, 200.0);
        assert!(summary.p95_ms >= summary.p50_ms);
    }

    #[test]
    fn empty_log_reports_zeros() {
        let summary = QueryLog::new().unwrap().summary();
        assert_eq!(summary.queries, 0);
        assert_eq!(summary.avg_time_ms, 0.0);
        assert_eq!(summary.p50_ms, 0.0);
    }

    #[test]
    fn clones_share_state_and_reset_clears_it() {
        let log = QueryLog::new().unwrap();
        let other = log.clone();
        other.add_bytes(12);
        other.finish(other.start(), 0);
        assert_eq!(log.summary().total_bytes, 12);
        log.reset();
        assert_eq!(other.summary().queries, 0);
    }
}
