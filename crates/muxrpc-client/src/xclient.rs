//! Load-balanced multi-server client.
//!
//! An [`XClient`] resolves each unary call to one server through its
//! [`Discovery`], pools one [`Client`] per remote address, and can fan a call
//! out to every known server with [`broadcast`](XClient::broadcast).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use muxrpc_core::{ConnectOptions, MuxError, Result};

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};

/// Dials a `protocol@addr` style address, picking the transport from the
/// prefix: `tcp@host:port`, `http@host:port` (an HTTP `CONNECT` tunnel onto
/// the same RPC server) or `unix@/path`.
///
/// # Errors
///
/// [`MuxError::BadAddress`] for strings without an `@` separator or with an
/// unsupported protocol.
pub async fn xdial(rpc_addr: &str, opts: ConnectOptions) -> Result<Client> {
    let (protocol, addr) = rpc_addr
        .split_once('@')
        .ok_or_else(|| MuxError::BadAddress(rpc_addr.to_string()))?;

    match protocol {
        "tcp" => Client::dial(addr, opts).await,
        "http" => Client::dial_http(addr, opts).await,
        "unix" => Client::dial_unix(addr, opts).await,
        _ => Err(MuxError::BadAddress(rpc_addr.to_string())),
    }
}

/// One logical endpoint over a set of interchangeable servers.
///
/// Connections are pooled per address and checked for liveness before reuse;
/// a dead pooled client is discarded and redialed.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use muxrpc_core::ConnectOptions;
/// use muxrpc_client::{MultiServerDiscovery, SelectMode, XClient};
///
/// # #[tokio::main]
/// # async fn main() -> muxrpc_core::Result<()> {
/// let discovery = Arc::new(MultiServerDiscovery::new(vec![
///     "tcp@127.0.0.1:9001".to_string(),
///     "tcp@127.0.0.1:9002".to_string(),
/// ]));
/// let xclient = XClient::new(discovery, SelectMode::RoundRobin, ConnectOptions::default());
///
/// let sum: i64 = xclient.call("Arith.sum", &(2, 3)).await?;
/// assert_eq!(sum, 5);
/// # Ok(())
/// # }
/// ```
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opts: ConnectOptions,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opts: ConnectOptions) -> Self {
        Self {
            discovery,
            mode,
            opts,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pooled client for `rpc_addr`, redialing if the pooled one
    /// has died.
    async fn client_for(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!(addr = rpc_addr, "discarding dead pooled connection");
            clients.remove(rpc_addr);
        }

        let client = Arc::new(xdial(rpc_addr, self.opts.clone()).await?);
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr(&self, rpc_addr: &str, service_method: &str, args: Value) -> Result<Value> {
        let client = self.client_for(rpc_addr).await?;
        client.call_value(service_method, args).await
    }

    /// Calls one server selected by this client's [`SelectMode`].
    pub async fn call_value(&self, service_method: &str, args: Value) -> Result<Value> {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Typed variant of [`call_value`](Self::call_value).
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call_value(service_method, serde_json::to_value(args)?).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Fans `service_method` out to every server known to discovery.
    ///
    /// Each target runs concurrently with its own private reply. The first
    /// terminal result wins: a success cancels the siblings and becomes the
    /// returned reply, a genuine failure cancels the siblings and becomes the
    /// returned error. Results forced by that cancellation are never
    /// recorded, so later per-peer outcomes are intentionally dropped. An
    /// empty server set yields `Value::Null`.
    pub async fn broadcast_value(&self, service_method: &str, args: Value) -> Result<Value> {
        let servers = self.discovery.get_all().await?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let outcome: StdMutex<BroadcastOutcome> = StdMutex::new(BroadcastOutcome::default());

        let calls = servers.iter().map(|rpc_addr| {
            let mut cancel = cancel_rx.clone();
            let args = args.clone();
            let outcome = &outcome;
            let cancel_tx = &cancel_tx;
            async move {
                let result = tokio::select! {
                    result = self.call_addr(rpc_addr, service_method, args) => result,
                    _ = cancel.changed() => Err(MuxError::Canceled),
                };

                let mut outcome = outcome.lock().expect("broadcast state poisoned");
                if outcome.settled() {
                    return;
                }
                match result {
                    Ok(reply) => {
                        outcome.reply = Some(reply);
                        let _ = cancel_tx.send(true);
                    }
                    // Cancellation of a sibling is not a peer failure.
                    Err(MuxError::Canceled) => {}
                    Err(e) => {
                        debug!(addr = rpc_addr, error = %e, "broadcast peer failed");
                        outcome.first_error = Some(e);
                        let _ = cancel_tx.send(true);
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        let outcome = outcome.into_inner().expect("broadcast state poisoned");
        match (outcome.first_error, outcome.reply) {
            (Some(e), _) => Err(e),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Typed variant of [`broadcast_value`](Self::broadcast_value).
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self
            .broadcast_value(service_method, serde_json::to_value(args)?)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Drops every pooled connection.
    pub async fn close(&self) {
        self.clients.lock().await.clear();
    }
}

#[derive(Default)]
struct BroadcastOutcome {
    first_error: Option<MuxError>,
    reply: Option<Value>,
}

impl BroadcastOutcome {
    fn settled(&self) -> bool {
        self.first_error.is_some() || self.reply.is_some()
    }
}
