use std::{sync::Arc, time::Duration};

use fedgeo_core::{BucketId, Circle, Record, Rectangle, SiloId, SpatialQuery};
use fedgeo_crypto::{EncryptedRecord, PayloadKey};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    codec::{JsonCodec, WireCodec},
    messages::{IndexMetadata, RemoteErrorKind, SessionId, SiloRequest, SiloResponse},
    transport::{InProcessTransport, RequestHandler, SiloTransport, TcpTransport, TransportError},
    NetworkingConfig,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("silo {silo}: {method} timed out after {after:?}")]
    Timeout {
        silo: SiloId,
        method: &'static str,
        after: Duration,
    },
    #[error("silo {silo}: {method} failed in transport: {source}")]
    Transport {
        silo: SiloId,
        method: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("silo {silo}: {method} rejected ({kind:?}): {message}")]
    Remote {
        silo: SiloId,
        method: &'static str,
        kind: RemoteErrorKind,
        message: String,
    },
    #[error("silo {silo}: {method} answered with {got} instead of {expected}")]
    UnexpectedResponse {
        silo: SiloId,
        method: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

impl RpcError {
    pub fn silo(&self) -> SiloId {
        match self {
            RpcError::Timeout { silo, .. }
            | RpcError::Transport { silo, .. }
            | RpcError::Remote { silo, .. }
            | RpcError::UnexpectedResponse { silo, .. } => *silo,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RpcError::Remote {
                kind: RemoteErrorKind::ProtocolViolation,
                ..
            }
        )
    }
}

/// A decoded reply plus the bytes its exchange cost on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Metered<T> {
    pub value: T,
    pub bytes: u64,
}

/// Typed stub for one silo. Every call is bounded by the configured timeout.
pub struct SiloClient {
    silo_id: SiloId,
    transport: Arc<dyn SiloTransport>,
    rpc_timeout: Duration,
}

macro_rules! expect_response {
    ($self:ident, $response:expr, $bytes:expr, $method:literal, $variant:ident, $label:literal) => {
        match $response {
            SiloResponse::$variant(value) => Ok(Metered {
                value,
                bytes: $bytes,
            }),
            other => Err($self.unexpected($method, $label, &other)),
        }
    };
}

impl SiloClient {
    pub fn new(silo_id: SiloId, transport: Arc<dyn SiloTransport>, rpc_timeout: Duration) -> Self {
        Self {
            silo_id,
            transport,
            rpc_timeout,
        }
    }

    pub fn tcp(silo_id: SiloId, address: impl Into<String>, config: &NetworkingConfig) -> Self {
        let codec: Arc<dyn WireCodec> = Arc::new(JsonCodec);
        let transport = TcpTransport::new(address, codec, config.max_frame_bytes);
        Self::new(silo_id, Arc::new(transport), config.rpc_timeout())
    }

    pub fn in_process(
        silo_id: SiloId,
        handler: Arc<dyn RequestHandler>,
        config: &NetworkingConfig,
    ) -> Self {
        let codec: Arc<dyn WireCodec> = Arc::new(JsonCodec);
        let transport = InProcessTransport::new(format!("in-process:{silo_id}"), handler, codec);
        Self::new(silo_id, Arc::new(transport), config.rpc_timeout())
    }

    pub fn silo_id(&self) -> SiloId {
        self.silo_id
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    async fn call(&self, request: SiloRequest) -> Result<(SiloResponse, u64), RpcError> {
        let method = request.method();
        let exchange = match timeout(self.rpc_timeout, self.transport.call(&request)).await {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(source)) => {
                warn!(silo = self.silo_id, method, error = %source, "rpc transport failure");
                return Err(RpcError::Transport {
                    silo: self.silo_id,
                    method,
                    source,
                });
            }
            Err(_) => {
                warn!(silo = self.silo_id, method, timeout = ?self.rpc_timeout, "rpc timed out");
                return Err(RpcError::Timeout {
                    silo: self.silo_id,
                    method,
                    after: self.rpc_timeout,
                });
            }
        };
        debug!(silo = self.silo_id, method, bytes = exchange.bytes, "rpc completed");
        match exchange.response {
            SiloResponse::Error(remote) => Err(RpcError::Remote {
                silo: self.silo_id,
                method,
                kind: remote.kind,
                message: remote.message,
            }),
            response => Ok((response, exchange.bytes)),
        }
    }

    fn unexpected(
        &self,
        method: &'static str,
        expected: &'static str,
        got: &SiloResponse,
    ) -> RpcError {
        RpcError::UnexpectedResponse {
            silo: self.silo_id,
            method,
            expected,
            got: got.label(),
        }
    }

    pub async fn publish_index_metadata(&self) -> Result<Metered<IndexMetadata>, RpcError> {
        let (response, bytes) = self.call(SiloRequest::PublishIndexMetadata).await?;
        expect_response!(
            self,
            response,
            bytes,
            "publish-index-metadata",
            IndexMetadata,
            "index-metadata"
        )
    }

    pub async fn set_candidate_buckets(
        &self,
        session: SessionId,
        buckets: Vec<BucketId>,
    ) -> Result<Metered<()>, RpcError> {
        let (response, bytes) = self
            .call(SiloRequest::SetCandidateBuckets { session, buckets })
            .await?;
        match response {
            SiloResponse::Ack => Ok(Metered { value: (), bytes }),
            other => Err(self.unexpected("set-candidate-buckets", "ack", &other)),
        }
    }

    pub async fn release_candidate_records(
        &self,
        session: SessionId,
    ) -> Result<Metered<Vec<Record>>, RpcError> {
        let (response, bytes) = self
            .call(SiloRequest::ReleaseCandidateRecords { session })
            .await?;
        expect_response!(
            self,
            response,
            bytes,
            "release-candidate-records",
            Records,
            "records"
        )
    }

    pub async fn release_encrypted_candidate_records(
        &self,
        session: SessionId,
    ) -> Result<Metered<Vec<EncryptedRecord>>, RpcError> {
        let (response, bytes) = self
            .call(SiloRequest::ReleaseEncryptedCandidateRecords { session })
            .await?;
        expect_response!(
            self,
            response,
            bytes,
            "release-encrypted-candidate-records",
            EncryptedRecords,
            "encrypted-records"
        )
    }

    pub async fn get_encryption_key(&self) -> Result<Metered<PayloadKey>, RpcError> {
        let (response, bytes) = self.call(SiloRequest::GetEncryptionKey).await?;
        expect_response!(
            self,
            response,
            bytes,
            "get-encryption-key",
            EncryptionKey,
            "encryption-key"
        )
    }

    pub async fn answer_circle_range_query(
        &self,
        circle: Circle,
    ) -> Result<Metered<Vec<Record>>, RpcError> {
        let (response, bytes) = self
            .call(SiloRequest::AnswerCircleRangeQuery { circle })
            .await?;
        expect_response!(
            self,
            response,
            bytes,
            "answer-circle-range-query",
            Records,
            "records"
        )
    }

    pub async fn answer_rectangle_range_query(
        &self,
        rectangle: Rectangle,
    ) -> Result<Metered<Vec<Record>>, RpcError> {
        let (response, bytes) = self
            .call(SiloRequest::AnswerRectangleRangeQuery { rectangle })
            .await?;
        expect_response!(
            self,
            response,
            bytes,
            "answer-rectangle-range-query",
            Records,
            "records"
        )
    }

    pub async fn answer_range_count(&self, query: SpatialQuery) -> Result<Metered<u64>, RpcError> {
        let (response, bytes) = self.call(SiloRequest::AnswerRangeCount { query }).await?;
        expect_response!(
            self,
            response,
            bytes,
            "answer-range-count",
            Count,
            "count"
        )
    }
}
