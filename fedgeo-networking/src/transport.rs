use std::{future::Future, io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::{
    codec::{CodecError, WireCodec},
    messages::{RemoteErrorKind, SiloRequest, SiloResponse},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure talking to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{address} closed the connection before answering")]
    Closed { address: String },
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
}

/// A response together with the number of bytes both frames occupied.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
    pub response: SiloResponse,
    pub bytes: u64,
}

/// Silo-side dispatch of one decoded request.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: SiloRequest) -> SiloResponse;
}

#[async_trait]
pub trait SiloTransport: Send + Sync {
    fn address(&self) -> &str;
    async fn call(&self, request: &SiloRequest) -> Result<Exchange, TransportError>;
}

/// Calls a handler living in the same process, still passing every message
/// through the codec so byte accounting matches the socket transport.
pub struct InProcessTransport {
    label: String,
    handler: Arc<dyn RequestHandler>,
    codec: Arc<dyn WireCodec>,
}

impl InProcessTransport {
    pub fn new(
        label: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
        codec: Arc<dyn WireCodec>,
    ) -> Self {
        Self {
            label: label.into(),
            handler,
            codec,
        }
    }
}

#[async_trait]
impl SiloTransport for InProcessTransport {
    fn address(&self) -> &str {
        &self.label
    }

    async fn call(&self, request: &SiloRequest) -> Result<Exchange, TransportError> {
        let request_frame = self.codec.encode_request(request)?;
        let decoded = self.codec.decode_request(&request_frame)?;
        let response_frame = self.codec.encode_response(&self.handler.handle(decoded))?;
        let response = self.codec.decode_response(&response_frame)?;
        Ok(Exchange {
            response,
            bytes: (request_frame.len() + response_frame.len()) as u64,
        })
    }
}

/// One newline-delimited request/response per TCP connection.
pub struct TcpTransport {
    address: String,
    codec: Arc<dyn WireCodec>,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(
        address: impl Into<String>,
        codec: Arc<dyn WireCodec>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            address: address.into(),
            codec,
            max_frame_bytes,
        }
    }

    fn io_error(&self, source: io::Error) -> TransportError {
        TransportError::Io {
            address: self.address.clone(),
            source,
        }
    }
}

#[async_trait]
impl SiloTransport for TcpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: &SiloRequest) -> Result<Exchange, TransportError> {
        let mut frame = self.codec.encode_request(request)?;
        frame.push(b'\n');
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|err| self.io_error(err))?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(&frame)
            .await
            .map_err(|err| self.io_error(err))?;
        writer.flush().await.map_err(|err| self.io_error(err))?;

        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let read = read_frame(&mut reader, &mut line, self.max_frame_bytes)
            .await
            .map_err(|err| self.io_error(err))?;
        match read {
            Frame::Eof => {
                return Err(TransportError::Closed {
                    address: self.address.clone(),
                })
            }
            Frame::Oversized => {
                return Err(TransportError::FrameTooLarge {
                    size: line.len(),
                    limit: self.max_frame_bytes,
                })
            }
            Frame::Complete => {}
        }
        let bytes = (frame.len() + line.len() + 1) as u64;
        let response = self.codec.decode_response(&line)?;
        Ok(Exchange { response, bytes })
    }
}

/// Accepts connections until `shutdown` resolves, answering every frame on a
/// connection with `handler`.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    codec: Arc<dyn WireCodec>,
    max_frame_bytes: usize,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    info!(
        address = %listener.local_addr()?,
        codec = codec.name(),
        "silo endpoint listening"
    );
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("silo endpoint shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                let codec = Arc::clone(&codec);
                tokio::spawn(async move {
                    let served = serve_connection(stream, handler, codec, max_frame_bytes).await;
                    if let Err(err) = served {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    codec: Arc<dyn WireCodec>,
    max_frame_bytes: usize,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let read = read_frame(&mut reader, &mut line, max_frame_bytes).await?;
        let response = match read {
            Frame::Eof => return Ok(()),
            Frame::Oversized => SiloResponse::error(
                RemoteErrorKind::InvalidRequest,
                format!("frame exceeds {max_frame_bytes} bytes"),
            ),
            Frame::Complete => match codec.decode_request(&line) {
                Ok(request) => {
                    debug!(method = request.method(), "dispatching request");
                    handler.handle(request)
                }
                Err(err) => SiloResponse::error(RemoteErrorKind::InvalidRequest, err.to_string()),
            },
        };
        let mut frame = codec
            .encode_response(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;
        if matches!(read, Frame::Oversized) {
            // the rest of the oversized frame is still unread
            return Ok(());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    Eof,
    Complete,
    Oversized,
}

/// Reads one frame into `line`, without its newline, buffering at most
/// `max_frame_bytes + 1` bytes.
async fn read_frame<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_frame_bytes: usize,
) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let limit = max_frame_bytes.saturating_add(1) as u64;
    if (&mut *reader).take(limit).read_until(b'\n', line).await? == 0 {
        return Ok(Frame::Eof);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        Ok(Frame::Complete)
    } else if line.len() > max_frame_bytes {
        Ok(Frame::Oversized)
    } else {
        Ok(Frame::Complete)
    }
}
