//! RPC surface between the fedgeo coordinator and its silos.
//!
//! Messages are plain serde types ([`SiloRequest`], [`SiloResponse`]); a
//! [`WireCodec`] turns them into frames and a [`SiloTransport`] moves the
//! frames, either inside one process or over newline-delimited TCP. The
//! coordinator only ever talks to a [`SiloClient`], which adds per-call
//! timeouts and byte metering on top of whichever transport it was built
//! with.
//!
//! # Quickstart
//! ```
//! use std::sync::Arc;
//! use fedgeo_networking::{
//!     NetworkingConfig, RequestHandler, SiloClient, SiloRequest, SiloResponse,
//! };
//!
//! struct Empty;
//! impl RequestHandler for Empty {
//!     fn handle(&self, _request: SiloRequest) -> SiloResponse {
//!         SiloResponse::Count(0)
//!     }
//! }
//!
//! let config = NetworkingConfig::sample();
//! let client = SiloClient::in_process(0, Arc::new(Empty), &config);
//! assert_eq!(client.address(), "in-process:0");
//! ```

mod client;
mod codec;
mod messages;
mod transport;

pub use client::{Metered, RpcError, SiloClient};
pub use codec::{CodecError, JsonCodec, WireCodec};
pub use messages::{
    IndexMetadata, RemoteError, RemoteErrorKind, SessionId, SiloRequest, SiloResponse,
};
pub use transport::{
    serve, Exchange, InProcessTransport, RequestHandler, SiloTransport, TcpTransport,
    TransportError,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for fedgeo-networking."
);

#[cfg(feature = "dev")]
const DEFAULT_RPC_TIMEOUT_MS: u64 = 2_000;
#[cfg(feature = "test")]
const DEFAULT_RPC_TIMEOUT_MS: u64 = 500;
#[cfg(feature = "prod")]
const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// Default silo listen address.
pub const DEFAULT_SILO_ADDRESS: &str = "0.0.0.0:50051";

fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_RPC_TIMEOUT_MS
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkingConfig {
    /// Upper bound on one RPC, including connection setup.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Largest frame accepted from a peer.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self::sample()
    }
}

impl NetworkingConfig {
    pub fn sample() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rpc_timeout_ms == 0 {
            return Err("rpc timeout must be greater than zero".into());
        }
        if self.max_frame_bytes == 0 {
            return Err("max frame size must be greater than zero".into());
        }
        Ok(())
    }
}
