use std::sync::Arc;

use fedgeo_networking::{RequestHandler, SiloRequest, SiloResponse};
use tracing::warn;

use crate::{Silo, SiloError};

/// Adapts a [`Silo`] to the RPC dispatch interface.
#[derive(Clone)]
pub struct SiloService {
    silo: Arc<Silo>,
}

impl SiloService {
    pub fn new(silo: Arc<Silo>) -> Self {
        Self { silo }
    }

    pub fn silo(&self) -> &Arc<Silo> {
        &self.silo
    }

    fn dispatch(&self, request: SiloRequest) -> Result<SiloResponse, SiloError> {
        let silo = &self.silo;
        Ok(match request {
            SiloRequest::PublishIndexMetadata => SiloResponse::IndexMetadata(silo.index_metadata()),
            SiloRequest::SetCandidateBuckets { session, buckets } => {
                silo.set_candidate_buckets(session, buckets)?;
                SiloResponse::Ack
            }
            SiloRequest::ReleaseCandidateRecords { session } => {
                SiloResponse::Records(silo.release_candidate_records(session)?)
            }
            SiloRequest::ReleaseEncryptedCandidateRecords { session } => {
                SiloResponse::EncryptedRecords(silo.release_encrypted_candidate_records(session)?)
            }
            SiloRequest::GetEncryptionKey => SiloResponse::EncryptionKey(silo.encryption_key()?),
            SiloRequest::AnswerCircleRangeQuery { circle } => {
                SiloResponse::Records(silo.answer_circle(&circle))
            }
            SiloRequest::AnswerRectangleRangeQuery { rectangle } => {
                SiloResponse::Records(silo.answer_rectangle(&rectangle))
            }
            SiloRequest::AnswerRangeCount { query } => {
                SiloResponse::Count(silo.answer_range_count(&query)?)
            }
        })
    }
}

impl RequestHandler for SiloService {
    fn handle(&self, request: SiloRequest) -> SiloResponse {
        let method = request.method();
        self.dispatch(request).unwrap_or_else(|err| {
            warn!(silo = self.silo.id(), method, error = %err, "request rejected");
            SiloResponse::error(err.remote_kind(), err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SiloOptions;
    use fedgeo_core::Record;
    use fedgeo_grid::GridConfig;
    use fedgeo_networking::{RemoteErrorKind, SessionId};
    use fedgeo_telemetry::{TelemetryConfig, TelemetryHandle};

    fn service() -> SiloService {
        let silo = Silo::build(
            vec![Record::new(0, 0.0, 0.0), Record::new(1, 3.0, 4.0)],
            SiloOptions::new(8, GridConfig::sample()),
            TelemetryHandle::from_config(TelemetryConfig::sample("silo")),
        )
        .unwrap();
        SiloService::new(Arc::new(silo))
    }

    #[test]
    fn errors_become_classified_responses() {
        let reply = service().handle(SiloRequest::ReleaseCandidateRecords {
            session: SessionId(77),
        });
        match reply {
            SiloResponse::Error(err) => {
                assert_eq!(err.kind, RemoteErrorKind::ProtocolViolation);
                assert!(err.message.contains("000000000000004d"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn key_request_without_encryption_is_unsupported() {
        let reply = service().handle(SiloRequest::GetEncryptionKey);
        assert!(matches!(
            reply,
            SiloResponse::Error(ref err) if err.kind == RemoteErrorKind::Unsupported
        ));
    }
}
