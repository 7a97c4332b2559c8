//! Connection-serving RPC server.
//!
//! Each accepted connection goes through handshake, then a serving loop that
//! reads header/body frame pairs and spawns one task per request, bounded by
//! the handshake's handle timeout. Responses from concurrent request tasks
//! are serialized through a single mutex-guarded write half so frames never
//! interleave.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use muxrpc_core::codec::Codec;
use muxrpc_core::protocol::{CONNECTED_STATUS, RPC_PATH};
use muxrpc_core::{read_frame, write_frame, CodecRegistry, ConnectOptions, Header, MuxError, Result, MAGIC};

use crate::service::Service;

/// The mux-rpc server.
///
/// Services are registered up front; [`serve`](Self::serve) then accepts
/// connections forever, one task per connection and one task per in-flight
/// request.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use muxrpc_server::{Server, Service};
///
/// # #[tokio::main]
/// # async fn main() -> muxrpc_core::Result<()> {
/// let server = Arc::new(Server::new());
/// server.register(
///     Service::new("Arith").method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) }),
/// )?;
///
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:9999").await?;
/// server.serve(listener).await
/// # }
/// ```
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
    codecs: CodecRegistry,
}

impl Server {
    /// Creates a server with the built-in codec set.
    pub fn new() -> Self {
        Self::with_codecs(CodecRegistry::default())
    }

    /// Creates a server with a caller-supplied codec registry.
    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            codecs,
        }
    }

    /// Registers a service under its name.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::ServiceAlreadyDefined`] if a service with the same
    /// name is already registered.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().expect("service table poisoned");
        let name = service.name().to_string();
        if services.contains_key(&name) {
            return Err(MuxError::ServiceAlreadyDefined(name));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Accepts TCP connections forever, spawning one task per connection.
    ///
    /// Accept errors are logged and the loop keeps going; per-connection
    /// failures never take the accept loop down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_conn(stream).await {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Accepts connections tunneled through an HTTP `CONNECT` exchange,
    /// otherwise like [`serve`](Self::serve).
    ///
    /// A client opens a plain TCP connection, sends
    /// `CONNECT /muxrpc HTTP/1.0` and, once the `200` status line comes back,
    /// the same connection switches to the RPC wire protocol. Anything other
    /// than a `CONNECT` for [`RPC_PATH`] is answered with a 405 and dropped.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "http connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_http_conn(stream).await {
                            debug!(%peer, error = %e, "http connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept http connection");
                }
            }
        }
    }

    /// Runs the `CONNECT` exchange, then hands the connection to
    /// [`serve_conn`](Self::serve_conn).
    async fn serve_http_conn(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut stream = BufReader::new(stream);

        let mut request_line = String::new();
        stream.read_line(&mut request_line).await?;
        // Drain the rest of the request head; the tunnel carries no headers
        // worth inspecting.
        let mut line = String::new();
        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                break;
            }
        }

        if !request_line.starts_with(&format!("CONNECT {} ", RPC_PATH)) {
            stream.write_all(b"HTTP/1.0 405 must CONNECT\r\n\r\n").await?;
            stream.flush().await?;
            return Err(MuxError::Http(request_line.trim().to_string()));
        }

        stream
            .write_all(format!("HTTP/1.0 {CONNECTED_STATUS}\r\n\r\n").as_bytes())
            .await?;
        stream.flush().await?;
        self.serve_conn(stream).await
    }

    /// Accepts unix-socket connections forever, like [`serve`](Self::serve).
    pub async fn serve_unix(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_conn(stream).await {
                            debug!(error = %e, "unix connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept unix connection");
                }
            }
        }
    }

    /// Serves a single already-established connection: handshake, then the
    /// request loop until the peer disconnects or the stream fails.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        // Handshake: exactly one JSON-encoded options frame before anything
        // else. Failing closed here drops the connection.
        let opts_frame = read_frame(&mut reader).await?;
        let opts: ConnectOptions = serde_json::from_slice(&opts_frame)?;
        if opts.magic != MAGIC {
            warn!(magic = format_args!("{:#x}", opts.magic), "handshake rejected");
            return Err(MuxError::BadMagic(opts.magic));
        }
        let codec = self
            .codecs
            .get(&opts.codec_type)
            .ok_or_else(|| MuxError::UnknownCodec(opts.codec_type.clone()))?;

        let writer = Arc::new(Mutex::new(writer));
        let handle_timeout = opts.handle_timeout;

        loop {
            let header_frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(MuxError::ConnectionClosed) => {
                    debug!("connection closed by peer");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            // The stream is positioned by headers; a header that does not
            // decode leaves us with no sequence number to answer to.
            let header = codec.decode_header(&header_frame)?;
            let body_frame = read_frame(&mut reader).await?;

            let args = match codec.decode_body(&body_frame) {
                Ok(args) => args,
                Err(e) => {
                    // Scoped to this sequence number; keep serving.
                    warn!(seq = header.seq, error = %e, "failed to decode request body");
                    send_response(&writer, codec.as_ref(), &header, Err(e)).await?;
                    continue;
                }
            };

            match self.resolve(&header.service_method) {
                Ok(service) => {
                    let writer = writer.clone();
                    let codec = codec.clone();
                    tokio::spawn(async move {
                        handle_request(service, header, args, codec, writer, handle_timeout).await;
                    });
                }
                Err(e) => {
                    send_response(&writer, codec.as_ref(), &header, Err(e)).await?;
                }
            }
        }
    }

    /// Resolves the service half of a `"Service.method"` name.
    fn resolve(&self, service_method: &str) -> Result<Arc<Service>> {
        let (service_name, _) = service_method
            .split_once('.')
            .ok_or_else(|| MuxError::BadServiceMethod(service_method.to_string()))?;

        let services = self.services.read().expect("service table poisoned");
        services
            .get(service_name)
            .cloned()
            .ok_or_else(|| MuxError::MethodNotFound(service_method.to_string()))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one request to completion and writes its response.
///
/// A nonzero handle timeout races the invocation against a deadline; when the
/// deadline wins, the invocation future is dropped (canceling the handler)
/// and the caller gets a handle-timeout error response right away.
async fn handle_request<W>(
    service: Arc<Service>,
    header: Header,
    args: Value,
    codec: Arc<dyn Codec>,
    writer: Arc<Mutex<WriteHalf<W>>>,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send,
{
    let method = header
        .service_method
        .split_once('.')
        .map(|(_, method)| method)
        .unwrap_or_default();

    let invocation = service.invoke(method, args);
    let result = if handle_timeout.is_zero() {
        invocation.await
    } else {
        match tokio::time::timeout(handle_timeout, invocation).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::HandleTimeout(handle_timeout)),
        }
    };

    if let Err(e) = send_response(&writer, codec.as_ref(), &header, result).await {
        warn!(seq = header.seq, error = %e, "failed to write response");
    }
}

/// Writes one response. The header frame and its body frame go out under a
/// single lock acquisition so concurrent request tasks never interleave
/// frames on the shared write half.
async fn send_response<W>(
    writer: &Mutex<WriteHalf<W>>,
    codec: &dyn Codec,
    request: &Header,
    result: Result<Value>,
) -> Result<()>
where
    W: AsyncWrite + Send,
{
    match result {
        Ok(reply) => {
            let header = codec.encode_header(&Header::response(&request.service_method, request.seq))?;
            let body = codec.encode_body(&reply)?;
            let mut writer = writer.lock().await;
            write_frame(&mut *writer, &header).await?;
            write_frame(&mut *writer, &body).await
        }
        Err(e) => {
            let header = codec.encode_header(&Header::error_response(
                &request.service_method,
                request.seq,
                e.to_string(),
            ))?;
            let mut writer = writer.lock().await;
            write_frame(&mut *writer, &header).await
        }
    }
}
