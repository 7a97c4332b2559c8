//! Multiplexing RPC client.
//!
//! One [`Client`] owns one connection. Calls are written under a mutex-held
//! write half and registered in a pending table keyed by sequence number; a
//! dedicated receive task reads header/body frames and fires each pending
//! call's oneshot with its decoded reply or carried error. A response whose
//! sequence number has no pending entry (caller already timed out or dropped
//! its handle) is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use muxrpc_core::codec::Codec;
use muxrpc_core::protocol::{CONNECTED_STATUS, RPC_PATH};
use muxrpc_core::{read_frame, write_frame, CodecRegistry, ConnectOptions, Header, MuxError, Result};

/// Byte stream a client can run over. Blanket-implemented; exists so dialed
/// TCP and unix streams erase to one type.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedStream = Box<dyn Transport>;
type PendingTable = StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

/// State shared between callers and the receive task.
struct Shared {
    pending: PendingTable,
    closed: AtomicBool,
}

impl Shared {
    /// Registers a pending call unless the connection is already closed.
    ///
    /// Checked under the pending lock: an insert either lands before
    /// [`shutdown`](Self::shutdown) drains the table (and is failed by it) or
    /// observes `closed` and is rejected here. No entry can slip in after the
    /// drain and wait forever.
    fn insert(&self, seq: u64, tx: oneshot::Sender<Result<Value>>) -> Result<()> {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        pending.insert(seq, tx);
        Ok(())
    }

    fn remove(&self, seq: u64) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.lock().expect("pending table poisoned").remove(&seq)
    }

    /// Marks the connection dead and fails every pending call uniformly.
    /// `closed` flips under the pending lock, pairing with [`insert`](Self::insert).
    fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(MuxError::ConnectionClosed));
        }
    }
}

/// Handle to one in-flight call, returned by [`Client::send`].
///
/// Await it with [`wait`](Self::wait). Dropping the handle (including a
/// caller-side timeout racing against `wait`) removes the call's pending
/// entry, so a late response is discarded instead of leaking; the server's
/// in-flight processing is not affected.
pub struct Call {
    seq: u64,
    rx: oneshot::Receiver<Result<Value>>,
    shared: Arc<Shared>,
}

impl Call {
    /// Sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the call's terminal event: the decoded reply, the remote
    /// error carried in the response header, or a connection-closed error.
    ///
    /// The receiver stays in place while awaiting, so racing `wait` against a
    /// deadline and dropping the losing future still runs this handle's
    /// `Drop` cleanup.
    pub async fn wait(mut self) -> Result<Value> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::ConnectionClosed),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("seq", &self.seq).finish_non_exhaustive()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // No-op when the receive task already completed this call.
        self.shared.remove(self.seq);
    }
}

/// A client for one mux-rpc connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and calls from
/// many tasks multiplex over the single connection concurrently.
///
/// # Example
///
/// ```no_run
/// use muxrpc_core::ConnectOptions;
/// use muxrpc_client::Client;
///
/// # #[tokio::main]
/// # async fn main() -> muxrpc_core::Result<()> {
/// let client = Client::dial("127.0.0.1:9999", ConnectOptions::default()).await?;
/// let sum: i64 = client.call("Arith.sum", &(2, 3)).await?;
/// assert_eq!(sum, 5);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    codec: Arc<dyn Codec>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    seq: AtomicU64,
    shared: Arc<Shared>,
    recv_task: JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a TCP address and performs the handshake, the whole operation
    /// bounded by `opts.connect_timeout` (zero waits unboundedly).
    pub async fn dial(addr: &str, opts: ConnectOptions) -> Result<Self> {
        Self::dial_with_codecs(addr, opts, CodecRegistry::default()).await
    }

    /// Like [`dial`](Self::dial), resolving `opts.codec_type` from a
    /// caller-supplied registry so third-party codecs can be negotiated.
    pub async fn dial_with_codecs(addr: &str, opts: ConnectOptions, codecs: CodecRegistry) -> Result<Self> {
        let connect_timeout = opts.connect_timeout;
        bounded(connect_timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            Self::handshake(Box::new(stream), &opts, &codecs).await
        })
        .await
    }

    /// Dials a TCP address and tunnels onto the RPC server through an HTTP
    /// `CONNECT` exchange, otherwise like [`dial`](Self::dial). The remote
    /// end must be listening with `Server::serve_http`.
    pub async fn dial_http(addr: &str, opts: ConnectOptions) -> Result<Self> {
        let connect_timeout = opts.connect_timeout;
        bounded(connect_timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            let stream = http_connect(stream).await?;
            Self::handshake(Box::new(stream), &opts, &CodecRegistry::default()).await
        })
        .await
    }

    /// Dials a unix socket path, otherwise like [`dial`](Self::dial).
    pub async fn dial_unix(path: &str, opts: ConnectOptions) -> Result<Self> {
        let connect_timeout = opts.connect_timeout;
        let codecs = CodecRegistry::default();
        bounded(connect_timeout, async move {
            let stream = UnixStream::connect(path).await?;
            Self::handshake(Box::new(stream), &opts, &codecs).await
        })
        .await
    }

    /// Runs the handshake over an already-established stream, bounded by
    /// `opts.connect_timeout`. Useful for custom transports and tests.
    pub async fn connect<S>(stream: S, opts: ConnectOptions) -> Result<Self>
    where
        S: Transport + 'static,
    {
        Self::connect_with_codecs(stream, opts, CodecRegistry::default()).await
    }

    /// [`connect`](Self::connect) with a caller-supplied codec registry.
    pub async fn connect_with_codecs<S>(stream: S, opts: ConnectOptions, codecs: CodecRegistry) -> Result<Self>
    where
        S: Transport + 'static,
    {
        let connect_timeout = opts.connect_timeout;
        bounded(connect_timeout, Self::handshake(Box::new(stream), &opts, &codecs)).await
    }

    /// Sends the options frame, resolves the codec and spawns the receive
    /// task. Not bounded by any timeout itself.
    async fn handshake(mut stream: BoxedStream, opts: &ConnectOptions, codecs: &CodecRegistry) -> Result<Self> {
        let codec = codecs
            .get(&opts.codec_type)
            .ok_or_else(|| MuxError::UnknownCodec(opts.codec_type.clone()))?;

        let opts_frame = serde_json::to_vec(opts)?;
        write_frame(&mut stream, &opts_frame).await?;

        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let recv_task = tokio::spawn(receive_loop(reader, codec.clone(), shared.clone()));

        Ok(Self {
            codec,
            writer: Mutex::new(writer),
            seq: AtomicU64::new(1),
            shared,
            recv_task,
        })
    }

    /// Whether the connection is still usable. Turns false once the receive
    /// task hits a connection-level failure.
    pub fn is_available(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Issues a call and returns immediately with its [`Call`] handle.
    pub async fn send(&self, service_method: &str, args: Value) -> Result<Call> {
        if !self.is_available() {
            return Err(MuxError::ConnectionClosed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let header_frame = self.codec.encode_header(&Header::request(service_method, seq))?;
        let body_frame = self.codec.encode_body(&args)?;

        let (tx, rx) = oneshot::channel();
        self.shared.insert(seq, tx)?;

        // Both frames of the request go out under one lock acquisition.
        let write_result = {
            let mut writer = self.writer.lock().await;
            match write_frame(&mut *writer, &header_frame).await {
                Ok(()) => write_frame(&mut *writer, &body_frame).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = write_result {
            self.shared.remove(seq);
            return Err(e);
        }

        trace!(seq, service_method, "request sent");
        Ok(Call {
            seq,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Calls `service_method` with a raw JSON body and waits for the reply.
    pub async fn call_value(&self, service_method: &str, args: Value) -> Result<Value> {
        self.send(service_method, args).await?.wait().await
    }

    /// Typed call: serializes `args`, deserializes the reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call_value(service_method, serde_json::to_value(args)?).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Like [`call_value`](Self::call_value), but gives up after `timeout`.
    ///
    /// On timeout the pending entry is removed and the caller returns
    /// promptly; the server may still be processing the request and its
    /// eventual response is discarded.
    pub async fn call_value_timeout(
        &self,
        service_method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let call = self.send(service_method, args).await?;
        match tokio::time::timeout(timeout, call.wait()).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::CallTimeout(timeout)),
        }
    }

    /// Typed variant of [`call_value_timeout`](Self::call_value_timeout).
    pub async fn call_timeout<A, R>(&self, service_method: &str, args: &A, timeout: Duration) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self
            .call_value_timeout(service_method, serde_json::to_value(args)?, timeout)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Marks the client closed and fails any pending calls.
    pub fn close(&self) {
        self.recv_task.abort();
        self.shared.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Performs the client half of the HTTP `CONNECT` exchange and returns the
/// stream positioned at the start of the RPC wire protocol.
async fn http_connect(stream: TcpStream) -> Result<BufReader<TcpStream>> {
    let mut stream = BufReader::new(stream);
    stream
        .write_all(format!("CONNECT {RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
        .await?;
    stream.flush().await?;

    let mut status = String::new();
    stream.read_line(&mut status).await?;
    if !status.contains(CONNECTED_STATUS) {
        return Err(MuxError::Http(status.trim().to_string()));
    }
    // Consume the rest of the response head up to the blank line.
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(stream)
}

/// Races `fut` against `timeout` unless the timeout is zero.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MuxError::ConnectTimeout(timeout)),
    }
}

/// Reads responses until the connection fails, routing each to its pending
/// call by sequence number.
async fn receive_loop(mut reader: ReadHalf<BoxedStream>, codec: Arc<dyn Codec>, shared: Arc<Shared>) {
    let err = loop {
        let header_frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        let header = match codec.decode_header(&header_frame) {
            Ok(header) => header,
            Err(e) => break e,
        };

        let result = if header.is_ok() {
            // Body decode failures are scoped to this one call.
            match read_frame(&mut reader).await {
                Ok(body_frame) => codec.decode_body(&body_frame),
                Err(e) => break e,
            }
        } else {
            Err(MuxError::Remote(header.error.clone()))
        };

        match shared.remove(header.seq) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                // Caller already gave up; drop the response on the floor.
                trace!(seq = header.seq, "discarding response with no pending call");
            }
        }
    };

    debug!(error = %err, "receive loop ended");
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_timeout_fires_when_handshake_stalls() {
        // A duplex pipe with a tiny buffer: the handshake frame cannot be
        // written, so only the deadline can resolve the dial.
        let (local, _remote) = tokio::io::duplex(1);
        let opts = ConnectOptions::default().with_connect_timeout(Duration::from_millis(50));

        let err = Client::connect(local, opts).await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectTimeout(_)));
        assert!(err.to_string().contains("connect timeout"));
    }

    #[tokio::test]
    async fn test_zero_connect_timeout_never_races() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let opts = ConnectOptions::default().with_connect_timeout(Duration::ZERO);

        let client = Client::connect(local, opts).await.unwrap();
        assert!(client.is_available());

        // The peer sees exactly one options frame.
        let frame = read_frame(&mut remote).await.unwrap();
        let opts: ConnectOptions = serde_json::from_slice(&frame).unwrap();
        assert_eq!(opts.magic, muxrpc_core::MAGIC);
    }

    #[tokio::test]
    async fn test_unknown_codec_rejected_at_dial() {
        let (local, _remote) = tokio::io::duplex(1024);
        let opts = ConnectOptions::default().with_codec("application/gob");

        let err = Client::connect(local, opts).await.unwrap_err();
        assert!(matches!(err, MuxError::UnknownCodec(_)));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_pending_calls() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let client = Client::connect(local, ConnectOptions::default()).await.unwrap();

        // Swallow the handshake, then the request, then hang up.
        let _ = read_frame(&mut remote).await.unwrap();
        let call = client.send("Echo.echo", serde_json::json!("hi")).await.unwrap();
        let _ = read_frame(&mut remote).await.unwrap();
        let _ = read_frame(&mut remote).await.unwrap();
        drop(remote);

        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed));
        assert!(!client.is_available());

        // New calls fail immediately on a dead client.
        let err = client.send("Echo.echo", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_pending_registration_after_shutdown_is_rejected() {
        // A send racing the receive loop's shutdown must not strand a call
        // in a table nothing will ever drain again.
        let shared = Shared {
            pending: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        shared.shutdown();

        let (tx, _rx) = oneshot::channel();
        let err = shared.insert(7, tx).unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed));
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_unique() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        let client = Client::connect(local, ConnectOptions::default()).await.unwrap();
        let _ = read_frame(&mut remote).await.unwrap();

        let a = client.send("Echo.echo", serde_json::json!(1)).await.unwrap();
        let b = client.send("Echo.echo", serde_json::json!(2)).await.unwrap();
        assert_ne!(a.seq(), b.seq());
    }
}
