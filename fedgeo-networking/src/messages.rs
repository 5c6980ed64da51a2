use std::fmt;

use fedgeo_core::{BucketId, Circle, Record, Rectangle, SiloId, SpatialQuery};
use fedgeo_crypto::{EncryptedRecord, PayloadKey};
use fedgeo_grid::GridGeometry;
use serde::{Deserialize, Serialize};

/// Binds `SetCandidateBuckets` to the `ReleaseCandidateRecords` of the same
/// query.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Bytes bound into sealed records as associated data.
    pub fn aad(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What a silo publishes about its index: cell layout plus the noisy count
/// of every bucket, indexed by bucket id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IndexMetadata {
    pub silo_id: SiloId,
    pub geometry: GridGeometry,
    pub noisy_counts: Vec<i64>,
}

impl IndexMetadata {
    pub fn is_well_formed(&self) -> bool {
        self.geometry.is_well_formed() && self.noisy_counts.len() == self.geometry.num_buckets()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum SiloRequest {
    PublishIndexMetadata,
    SetCandidateBuckets {
        session: SessionId,
        buckets: Vec<BucketId>,
    },
    ReleaseCandidateRecords {
        session: SessionId,
    },
    ReleaseEncryptedCandidateRecords {
        session: SessionId,
    },
    GetEncryptionKey,
    AnswerCircleRangeQuery {
        circle: Circle,
    },
    AnswerRectangleRangeQuery {
        rectangle: Rectangle,
    },
    AnswerRangeCount {
        query: SpatialQuery,
    },
}

impl SiloRequest {
    pub fn method(&self) -> &'static str {
        match self {
            SiloRequest::PublishIndexMetadata => "publish-index-metadata",
            SiloRequest::SetCandidateBuckets { .. } => "set-candidate-buckets",
            SiloRequest::ReleaseCandidateRecords { .. } => "release-candidate-records",
            SiloRequest::ReleaseEncryptedCandidateRecords { .. } => {
                "release-encrypted-candidate-records"
            }
            SiloRequest::GetEncryptionKey => "get-encryption-key",
            SiloRequest::AnswerCircleRangeQuery { .. } => "answer-circle-range-query",
            SiloRequest::AnswerRectangleRangeQuery { .. } => "answer-rectangle-range-query",
            SiloRequest::AnswerRangeCount { .. } => "answer-range-count",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteErrorKind {
    /// Unknown bucket ids, unknown sessions and similar misuse of the
    /// two-step candidate protocol.
    ProtocolViolation,
    InvalidRequest,
    Unsupported,
    Internal,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", content = "value", rename_all = "kebab-case")]
pub enum SiloResponse {
    IndexMetadata(IndexMetadata),
    Ack,
    Records(Vec<Record>),
    EncryptedRecords(Vec<EncryptedRecord>),
    EncryptionKey(PayloadKey),
    Count(u64),
    Error(RemoteError),
}

impl SiloResponse {
    pub fn error(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        SiloResponse::Error(RemoteError {
            kind,
            message: message.into(),
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SiloResponse::IndexMetadata(_) => "index-metadata",
            SiloResponse::Ack => "ack",
            SiloResponse::Records(_) => "records",
            SiloResponse::EncryptedRecords(_) => "encrypted-records",
            SiloResponse::EncryptionKey(_) => "encryption-key",
            SiloResponse::Count(_) => "count",
            SiloResponse::Error(_) => "error",
        }
    }
}
