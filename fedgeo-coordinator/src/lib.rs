//! The fedgeo coordinator: runs each range query through the federated
//! protocol (`SETUP → INDEX_FETCH → QUERY_PERTURB → CANDIDATE_BROADCAST →
//! RECORD_FETCH → VERIFY → DONE`) against every configured silo, or fans
//! the exact query out directly in baseline mode.
//!
//! # Quickstart
//! ```
//! use std::sync::Arc;
//! use fedgeo_coordinator::{Coordinator, ProtocolConfig};
//! use fedgeo_core::SpatialQuery;
//! use fedgeo_networking::{NetworkingConfig, RequestHandler, SiloClient, SiloRequest, SiloResponse};
//! use fedgeo_telemetry::{TelemetryConfig, TelemetryHandle};
//!
//! struct Empty;
//! impl RequestHandler for Empty {
//!     fn handle(&self, _request: SiloRequest) -> SiloResponse {
//!         SiloResponse::Records(Vec::new())
//!     }
//! }
//!
//! let client = SiloClient::in_process(0, Arc::new(Empty), &NetworkingConfig::sample());
//! let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("coordinator"));
//! let coordinator = Coordinator::new(
//!     vec![client],
//!     ProtocolConfig::baseline(),
//!     Some([0u8; 32]),
//!     telemetry,
//! )
//! .unwrap();
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let answer = runtime
//!     .block_on(coordinator.run(&SpatialQuery::range_circle(0.0, 0.0, 1.0)))
//!     .unwrap();
//! assert_eq!(answer.count, 0);
//! ```

mod coordinator;
mod perturb;

pub use coordinator::{Coordinator, Hit, QueryAnswer};
pub use perturb::{candidate_buckets, QueryPerturber, SpatialMechanism};

use std::fmt;

use fedgeo_core::{QueryKind, SiloId};
use fedgeo_dp::DpError;
use fedgeo_networking::RpcError;
use fedgeo_telemetry::TelemetryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol states a federated query moves through, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryStage {
    Setup,
    IndexFetch,
    QueryPerturb,
    CandidateBroadcast,
    RecordFetch,
    Verify,
    Done,
}

impl QueryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStage::Setup => "setup",
            QueryStage::IndexFetch => "index-fetch",
            QueryStage::QueryPerturb => "query-perturb",
            QueryStage::CandidateBroadcast => "candidate-broadcast",
            QueryStage::RecordFetch => "record-fetch",
            QueryStage::Verify => "verify",
            QueryStage::Done => "done",
        }
    }

    /// Telemetry latency series for the stage.
    pub fn metric(&self) -> &'static str {
        match self {
            QueryStage::Setup => "coordinator.setup",
            QueryStage::IndexFetch => "coordinator.index-fetch",
            QueryStage::QueryPerturb => "coordinator.query-perturb",
            QueryStage::CandidateBroadcast => "coordinator.candidate-broadcast",
            QueryStage::RecordFetch => "coordinator.record-fetch",
            QueryStage::Verify => "coordinator.verify",
            QueryStage::Done => "coordinator.done",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueryMode {
    #[default]
    Federated,
    Baseline,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Federated => "federated",
            QueryMode::Baseline => "baseline",
        }
    }
}

/// Privacy and execution parameters shared by every query a coordinator runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolConfig {
    /// Budget spent perturbing each query center.
    pub epsilon_spatial: f64,
    #[serde(default)]
    pub mechanism: SpatialMechanism,
    /// Fetch candidates sealed under each silo's payload key.
    #[serde(default)]
    pub encrypt_records: bool,
    #[serde(default)]
    pub mode: QueryMode,
}

impl ProtocolConfig {
    pub fn sample() -> Self {
        Self {
            epsilon_spatial: 0.5,
            mechanism: SpatialMechanism::Planar,
            encrypt_records: false,
            mode: QueryMode::Federated,
        }
    }

    pub fn baseline() -> Self {
        Self {
            mode: QueryMode::Baseline,
            ..Self::sample()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.epsilon_spatial.is_finite() && self.epsilon_spatial > 0.0) {
            return Err(format!(
                "spatial epsilon must be a finite value > 0 (got {})",
                self.epsilon_spatial
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator configuration invalid: {0}")]
    Configuration(String),
    #[error("spatial mechanism unusable: {0}")]
    Mechanism(#[from] DpError),
    #[error("{stage} aborted: {source}")]
    Rpc {
        stage: QueryStage,
        #[source]
        source: RpcError,
    },
    #[error("{stage} aborted: silo {silo} violated the protocol: {detail}")]
    ProtocolInvariant {
        stage: QueryStage,
        silo: SiloId,
        detail: String,
    },
    #[error("{stage} aborted: silo task failed: {details}")]
    Task { stage: QueryStage, details: String },
    #[error("{0} queries are not supported")]
    UnsupportedQuery(QueryKind),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

impl CoordinatorError {
    pub(crate) fn from_rpc(stage: QueryStage, source: RpcError) -> Self {
        if source.is_protocol_violation() {
            CoordinatorError::ProtocolInvariant {
                stage,
                silo: source.silo(),
                detail: source.to_string(),
            }
        } else {
            CoordinatorError::Rpc { stage, source }
        }
    }

    /// Stage the query was in when it failed, if it got that far.
    pub fn stage(&self) -> Option<QueryStage> {
        match self {
            CoordinatorError::Rpc { stage, .. }
            | CoordinatorError::ProtocolInvariant { stage, .. }
            | CoordinatorError::Task { stage, .. } => Some(*stage),
            CoordinatorError::Mechanism(_) => Some(QueryStage::QueryPerturb),
            _ => None,
        }
    }

    pub fn silo(&self) -> Option<SiloId> {
        match self {
            CoordinatorError::Rpc { source, .. } => Some(source.silo()),
            CoordinatorError::ProtocolInvariant { silo, .. } => Some(*silo),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_validation_reports_bad_epsilon() {
        assert_eq!(ProtocolConfig::sample().validate(), Ok(()));
        for epsilon in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = ProtocolConfig {
                epsilon_spatial: epsilon,
                ..ProtocolConfig::sample()
            };
            let reason = config.validate().unwrap_err();
            assert!(reason.contains("spatial epsilon"), "{reason}");
        }
    }
}
