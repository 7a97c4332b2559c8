//! Core protocol types: handshake options, message headers and the
//! membership registry's HTTP conventions.

pub mod error;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Magic value identifying a mux-rpc connection, sent in the handshake.
pub const MAGIC: u32 = 0x6d78_7270;

/// Default bound on connection establishment plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP path the membership registry is served at.
pub const REGISTRY_PATH: &str = "/muxrpc/registry";

/// Path an HTTP `CONNECT` must name to tunnel onto an RPC server.
pub const RPC_PATH: &str = "/muxrpc";

/// Status the server answers a successful `CONNECT` with; the connection
/// then switches to the RPC wire protocol.
pub const CONNECTED_STATUS: &str = "200 Connected to mux-rpc";

/// Request header a server heartbeats its own address in.
pub const SERVER_HEADER: &str = "x-muxrpc-server";

/// Response header the registry lists alive addresses in (comma-separated).
pub const SERVERS_HEADER: &str = "x-muxrpc-servers";

/// Registry entries not refreshed within this window are considered dead.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default interval between registry refreshes on the discovery side.
pub const DEFAULT_DISCOVERY_REFRESH: Duration = Duration::from_secs(10);

/// One-time per-connection negotiation message.
///
/// The client sends exactly one `ConnectOptions` value, always JSON-encoded,
/// immediately after the connection opens and before any header/body frames.
/// The server validates [`magic`](Self::magic) and resolves the codec named by
/// [`codec_type`](Self::codec_type) for the remainder of the connection.
///
/// A zero [`connect_timeout`](Self::connect_timeout) means dialing is
/// unbounded; a zero [`handle_timeout`](Self::handle_timeout) means the server
/// applies no per-call deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Protocol magic value, must equal [`MAGIC`].
    pub magic: u32,
    /// Identifier of the codec used for all subsequent frames.
    pub codec_type: String,
    /// Bound on connect + handshake; zero waits unboundedly.
    pub connect_timeout: Duration,
    /// Server-side per-call deadline; zero disables it.
    pub handle_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            codec_type: crate::codec::JSON_CODEC.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl ConnectOptions {
    /// Replaces the codec identifier.
    pub fn with_codec(mut self, codec_type: impl Into<String>) -> Self {
        self.codec_type = codec_type.into();
        self
    }

    /// Replaces the connect timeout. `Duration::ZERO` waits unboundedly.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replaces the server-side handle timeout. `Duration::ZERO` disables it.
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }
}

/// Per-message header, carried in front of every request and response body.
///
/// `seq` ties a response back to the call that issued the request. An empty
/// `error` signals success; a non-empty `error` carries the remote failure
/// message and the response has no body frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Qualified method name, `"Service.method"`.
    pub service_method: String,
    /// Sequence number, unique among a connection's outstanding calls.
    pub seq: u64,
    /// Empty on success, otherwise the failure message.
    pub error: String,
}

impl Header {
    /// Creates a request header (empty error).
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Creates a success-response header for `seq` (empty error).
    pub fn response(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Creates an error-response header for `seq`.
    pub fn error_response(service_method: impl Into<String>, seq: u64, error: impl Into<String>) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: error.into(),
        }
    }

    /// Whether this header signals success.
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}
