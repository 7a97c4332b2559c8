//! End-to-end client/server tests over real TCP connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::net::TcpListener;

use muxrpc_client::Client;
use muxrpc_core::codec::{Codec, CodecRegistry};
use muxrpc_core::{ConnectOptions, Header, MuxError};
use muxrpc_server::{Server, Service};

async fn start_server() -> std::net::SocketAddr {
    let server = Arc::new(Server::new());
    server
        .register(
            Service::new("Arith")
                .method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) })
                .method("mul", |(a, b): (i64, i64)| async move { Ok(a * b) }),
        )
        .unwrap();
    server
        .register(Service::new("Echo").method("echo", |v: Value| async move { Ok(v) }))
        .unwrap();
    server
        .register(Service::new("Slow").method("run", |(): ()| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("done")
        }))
        .unwrap();
    server
        .register(Service::new("Fail").method("always", |(): ()| async move {
            Err::<Value, _>(MuxError::Remote("boom".to_string()))
        }))
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

#[tokio::test]
async fn test_sum_end_to_end() {
    let addr = start_server().await;
    let client = Client::dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let sum: i64 = client.call("Arith.sum", &(2, 3)).await.unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn test_concurrent_calls_keep_their_replies_apart() {
    let addr = start_server().await;
    let client = Arc::new(
        Client::dial(&addr.to_string(), ConnectOptions::default())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let echoed: i64 = client.call("Echo.echo", &i).await.unwrap();
            assert_eq!(echoed, i);
            let sum: i64 = client.call("Arith.sum", &(i, 100)).await.unwrap();
            assert_eq!(sum, i + 100);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_remote_error_surfaces_verbatim() {
    let addr = start_server().await;
    let client = Client::dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let err = client.call_value("Fail.always", Value::Null).await.unwrap_err();
    assert!(matches!(err, MuxError::Remote(_)));
    assert_eq!(err.to_string(), "boom");

    // A remote error never poisons the connection.
    let sum: i64 = client.call("Arith.sum", &(1, 1)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_unknown_method_reported_by_server() {
    let addr = start_server().await;
    let client = Client::dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let err = client.call_value("Arith.div", json!([1, 2])).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_server_handle_timeout_reaches_the_caller() {
    let addr = start_server().await;
    let opts = ConnectOptions::default().with_handle_timeout(Duration::from_millis(100));
    let client = Client::dial(&addr.to_string(), opts).await.unwrap();

    let start = Instant::now();
    let err = client.call_value("Slow.run", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("handle timeout"));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_call_timeout_returns_promptly_and_connection_survives() {
    let addr = start_server().await;
    let client = Client::dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let start = Instant::now();
    let err = client
        .call_value_timeout("Slow.run", Value::Null, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::CallTimeout(_)));
    assert!(start.elapsed() < Duration::from_secs(1));

    // The abandoned call's late response is discarded, not misrouted.
    let sum: i64 = client.call("Arith.sum", &(20, 22)).await.unwrap();
    assert_eq!(sum, 42);
}

/// JSON frames carrying a leading marker byte, negotiated under its own
/// identifier. Distinct enough from plain JSON that accidental fallback to
/// the built-in codec breaks the connection immediately.
struct MarkedJsonCodec;

const MARKED_JSON: &str = "application/marked-json";

impl Codec for MarkedJsonCodec {
    fn name(&self) -> &str {
        MARKED_JSON
    }

    fn encode_header(&self, header: &Header) -> muxrpc_core::Result<Vec<u8>> {
        let mut out = vec![0x7f];
        out.extend(serde_json::to_vec(header)?);
        Ok(out)
    }

    fn decode_header(&self, data: &[u8]) -> muxrpc_core::Result<Header> {
        match data.split_first() {
            Some((0x7f, rest)) => Ok(serde_json::from_slice(rest)?),
            _ => Err(MuxError::Codec("missing marker byte".to_string())),
        }
    }

    fn encode_body(&self, body: &Value) -> muxrpc_core::Result<Vec<u8>> {
        let mut out = vec![0x7f];
        out.extend(serde_json::to_vec(body)?);
        Ok(out)
    }

    fn decode_body(&self, data: &[u8]) -> muxrpc_core::Result<Value> {
        match data.split_first() {
            Some((0x7f, rest)) => Ok(serde_json::from_slice(rest)?),
            _ => Err(MuxError::Codec("missing marker byte".to_string())),
        }
    }
}

#[tokio::test]
async fn test_third_party_codec_negotiates_end_to_end() {
    let mut codecs = CodecRegistry::default();
    codecs.register(Arc::new(MarkedJsonCodec));

    let server = Arc::new(Server::with_codecs(codecs.clone()));
    server
        .register(Service::new("Arith").method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) }))
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let opts = ConnectOptions::default().with_codec(MARKED_JSON);
    let client = Client::dial_with_codecs(&addr.to_string(), opts, codecs)
        .await
        .unwrap();

    let sum: i64 = client.call("Arith.sum", &(2, 3)).await.unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn test_closed_client_rejects_new_calls() {
    let addr = start_server().await;
    let client = Client::dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    client.close();
    let err = client.call_value("Arith.sum", json!([1, 2])).await.unwrap_err();
    assert!(matches!(err, MuxError::ConnectionClosed));
}
