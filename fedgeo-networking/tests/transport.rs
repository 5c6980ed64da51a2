use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fedgeo_core::{Circle, Record};
use fedgeo_networking::{
    serve, Exchange, JsonCodec, NetworkingConfig, RemoteError, RemoteErrorKind, RequestHandler,
    RpcError, SessionId, SiloClient, SiloRequest, SiloResponse, SiloTransport, TcpTransport,
    TransportError, WireCodec,
};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

/// Answers circle queries with a fixed record and rejects candidate sets.
struct Fixture;

impl RequestHandler for Fixture {
    fn handle(&self, request: SiloRequest) -> SiloResponse {
        match request {
            SiloRequest::AnswerCircleRangeQuery { .. } => {
                SiloResponse::Records(vec![Record::new(9, 1.25, -3.5)])
            }
            SiloRequest::SetCandidateBuckets { .. } => {
                SiloResponse::error(RemoteErrorKind::ProtocolViolation, "unknown bucket 99")
            }
            _ => SiloResponse::Ack,
        }
    }
}

struct Stalled;

#[async_trait]
impl SiloTransport for Stalled {
    fn address(&self) -> &str {
        "stalled"
    }

    async fn call(&self, _request: &SiloRequest) -> Result<Exchange, TransportError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Exchange {
            response: SiloResponse::Ack,
            bytes: 0,
        })
    }
}

#[tokio::test]
async fn tcp_round_trip_meters_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        Arc::new(Fixture),
        Arc::new(JsonCodec),
        1024 * 1024,
        async move {
            let _ = stop_rx.await;
        },
    ));

    let client = SiloClient::tcp(4, address, &NetworkingConfig::sample());
    let reply = client
        .answer_circle_range_query(Circle::new(0.0, 0.0, 5.0))
        .await
        .expect("circle query");
    assert_eq!(reply.value, vec![Record::new(9, 1.25, -3.5)]);
    assert!(reply.bytes > 0);

    let _ = stop_tx.send(());
    server.await.expect("join").expect("serve");
}

#[tokio::test]
async fn remote_rejection_surfaces_as_protocol_violation() {
    let client = SiloClient::in_process(2, Arc::new(Fixture), &NetworkingConfig::sample());
    let err = client
        .set_candidate_buckets(SessionId(1), vec![99])
        .await
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert_eq!(err.silo(), 2);
}

#[tokio::test]
async fn wrong_variant_is_reported() {
    let client = SiloClient::in_process(3, Arc::new(Fixture), &NetworkingConfig::sample());
    let err = client.publish_index_metadata().await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::UnexpectedResponse {
            expected: "index-metadata",
            got: "ack",
            ..
        }
    ));
}

#[tokio::test]
async fn stalled_silo_times_out() {
    let client = SiloClient::new(7, Arc::new(Stalled), Duration::from_millis(50));
    let err = client.publish_index_metadata().await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { silo: 7, .. }));
}

#[tokio::test]
async fn unreachable_silo_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    drop(listener);
    let client = SiloClient::tcp(1, address, &NetworkingConfig::sample());
    let err = client.get_encryption_key().await.unwrap_err();
    assert!(matches!(err, RpcError::Transport { silo: 1, .. }));
}

#[tokio::test]
async fn server_refuses_frame_over_the_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        Arc::new(Fixture),
        Arc::new(JsonCodec),
        64,
        async move {
            let _ = stop_rx.await;
        },
    ));

    // no newline ever arrives; the server must stop reading at the limit
    let mut stream = TcpStream::connect(address).await.expect("connect");
    stream.write_all(&[b'x'; 65]).await.expect("write");
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await.expect("reply");
    line.pop();
    let reply = JsonCodec.decode_response(&line).expect("decode");
    assert!(matches!(
        reply,
        SiloResponse::Error(RemoteError {
            kind: RemoteErrorKind::InvalidRequest,
            ..
        })
    ));
    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).await.expect("eof"), 0);

    let _ = stop_tx.send(());
    server.await.expect("join").expect("serve");
}

#[tokio::test]
async fn client_refuses_response_over_the_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (reader, mut writer) = stream.into_split();
        let mut request = Vec::new();
        BufReader::new(reader)
            .read_until(b'\n', &mut request)
            .await
            .expect("request");
        let _ = writer.write_all(&vec![b'y'; 4096]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let transport = TcpTransport::new(address, Arc::new(JsonCodec), 64);
    let err = transport
        .call(&SiloRequest::GetEncryptionKey)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::FrameTooLarge { size: 65, limit: 64 }
    ));
    peer.await.expect("peer");
}
