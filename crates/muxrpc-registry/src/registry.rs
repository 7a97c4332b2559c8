//! The registry state and its axum service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use muxrpc_core::protocol::{DEFAULT_REGISTRY_TIMEOUT, REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};
use muxrpc_core::Result;

/// One known server: its address and when it last heartbeated.
#[derive(Debug, Clone)]
pub struct ServerItem {
    pub addr: String,
    pub last_heartbeat: Instant,
}

/// Mutex-guarded map from address to [`ServerItem`], plus the expiry window.
///
/// A `timeout` of zero disables expiry entirely. Constructed explicitly and
/// passed around as `Arc<Registry>`; there is no process-wide default.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use muxrpc_registry::Registry;
///
/// let registry = Registry::new(Duration::from_secs(300));
/// registry.put_server("tcp@127.0.0.1:9999");
/// assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9999"]);
/// ```
pub struct Registry {
    timeout: Duration,
    servers: StdMutex<HashMap<String, ServerItem>>,
}

impl Registry {
    /// Creates a registry with the given expiry window; zero disables expiry.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: StdMutex::new(HashMap::new()),
        }
    }

    /// A registry with the default 5-minute expiry window.
    pub fn with_default_timeout() -> Self {
        Self::new(DEFAULT_REGISTRY_TIMEOUT)
    }

    /// Registers `addr`, or refreshes its heartbeat timestamp if known.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().expect("server map poisoned");
        servers
            .entry(addr.to_string())
            .and_modify(|item| item.last_heartbeat = Instant::now())
            .or_insert_with(|| {
                debug!(addr, "server registered");
                ServerItem {
                    addr: addr.to_string(),
                    last_heartbeat: Instant::now(),
                }
            });
    }

    /// Computes the alive set, evicting expired entries as a side effect.
    /// Survivors come back sorted lexicographically.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().expect("server map poisoned");
        let timeout = self.timeout;
        servers.retain(|addr, item| {
            let alive = timeout.is_zero() || item.last_heartbeat.elapsed() <= timeout;
            if !alive {
                debug!(addr, "server expired");
            }
            alive
        });

        let mut alive: Vec<String> = servers.values().map(|item| item.addr.clone()).collect();
        alive.sort();
        alive
    }

    /// The axum router serving the registry protocol at
    /// [`REGISTRY_PATH`](muxrpc_core::protocol::REGISTRY_PATH). Methods other
    /// than GET and POST get the method router's default 405.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(REGISTRY_PATH, get(list_servers).post(register_server))
            .with_state(self.clone())
    }

    /// Serves the registry on `listener` until the server fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, path = REGISTRY_PATH, "registry listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    ([(SERVERS_HEADER, alive)], StatusCode::OK)
}

async fn register_server(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty());

    match addr {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_list() {
        let registry = Registry::new(Duration::from_secs(300));
        registry.put_server("tcp@127.0.0.1:9001");
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);
    }

    #[test]
    fn test_listing_is_sorted() {
        let registry = Registry::new(Duration::from_secs(300));
        registry.put_server("tcp@b:1");
        registry.put_server("tcp@a:1");
        registry.put_server("tcp@c:1");
        assert_eq!(registry.alive_servers(), vec!["tcp@a:1", "tcp@b:1", "tcp@c:1"]);
    }

    #[test]
    fn test_expiry_is_lazy_and_purges() {
        let registry = Registry::new(Duration::from_millis(20));
        registry.put_server("tcp@127.0.0.1:9001");

        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.alive_servers().is_empty());
        // The entry is gone, not just filtered.
        assert!(registry.servers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_refreshes_timestamp() {
        let registry = Registry::new(Duration::from_millis(60));
        registry.put_server("tcp@127.0.0.1:9001");

        std::thread::sleep(Duration::from_millis(40));
        registry.put_server("tcp@127.0.0.1:9001");
        std::thread::sleep(Duration::from_millis(40));

        // The refresh 40ms ago keeps it alive past the original deadline.
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@127.0.0.1:9001");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);
    }
}
