//! A fedgeo silo: owns one partition of point records, publishes a grid
//! index with noisy bucket counts, and releases privacy-padded candidate
//! batches for the buckets a coordinator asks about.
//!
//! # Quickstart
//! ```
//! use std::sync::Arc;
//! use fedgeo_core::Record;
//! use fedgeo_grid::GridConfig;
//! use fedgeo_networking::{RequestHandler, SiloRequest, SiloResponse};
//! use fedgeo_silo::{Silo, SiloOptions, SiloService};
//! use fedgeo_telemetry::{TelemetryConfig, TelemetryHandle};
//!
//! let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("silo"));
//! let options = SiloOptions::new(0, GridConfig::sample());
//! let silo = Silo::build(vec![Record::new(0, 1.0, 1.0)], options, telemetry).unwrap();
//! let service = SiloService::new(Arc::new(silo));
//! let reply = service.handle(SiloRequest::PublishIndexMetadata);
//! assert!(matches!(reply, SiloResponse::IndexMetadata(_)));
//! ```

mod service;
mod silo;

pub use service::SiloService;
pub use silo::{Silo, SiloOptions};

use fedgeo_core::{BucketId, QueryKind};
use fedgeo_crypto::CipherError;
use fedgeo_grid::GridError;
use fedgeo_networking::{RemoteErrorKind, SessionId};
use fedgeo_telemetry::TelemetryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiloError {
    #[error("silo configuration invalid: {0}")]
    Configuration(String),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("bucket {bucket} does not exist (index has {buckets} buckets)")]
    UnknownBucket { bucket: BucketId, buckets: usize },
    #[error("session {0} has no pending candidate set")]
    UnknownSession(SessionId),
    #[error("session {0} already holds a candidate set")]
    SessionInUse(SessionId),
    #[error("encrypted release is disabled on this silo")]
    EncryptionDisabled,
    #[error("{0} queries are not supported")]
    UnsupportedQuery(QueryKind),
}

impl SiloError {
    /// Classification reported back to the caller over RPC.
    pub fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            SiloError::UnknownBucket { .. }
            | SiloError::UnknownSession(_)
            | SiloError::SessionInUse(_) => RemoteErrorKind::ProtocolViolation,
            SiloError::EncryptionDisabled | SiloError::UnsupportedQuery(_) => {
                RemoteErrorKind::Unsupported
            }
            SiloError::Configuration(_) => RemoteErrorKind::InvalidRequest,
            SiloError::Grid(_) | SiloError::Cipher(_) | SiloError::Telemetry(_) => {
                RemoteErrorKind::Internal
            }
        }
    }
}
