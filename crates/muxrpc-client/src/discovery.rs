//! Server discovery: where the client finds the set of interchangeable
//! servers it may call.
//!
//! Two variants behind the [`Discovery`] trait: a static list set once
//! ([`MultiServerDiscovery`]) and a membership-registry poller
//! ([`RegistryDiscovery`]) that refreshes its cache on demand, at most once
//! per freshness window.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use muxrpc_core::protocol::{DEFAULT_DISCOVERY_REFRESH, SERVERS_HEADER};
use muxrpc_core::{MuxError, Result};

/// Strategy for picking one server per unary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random.
    Random,
    /// Cycle through the list, wrapping on the current length.
    RoundRobin,
}

/// Source of the currently-known server set.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Refreshes the cached server set from its backing source, if any.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the server set wholesale.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Selects one server address by `mode`.
    ///
    /// # Errors
    ///
    /// [`MuxError::NoAvailableServers`] when the set is empty.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns a defensive copy of the current server set.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor; always read modulo the current length so a
    /// shrinking list never puts it out of range.
    index: usize,
}

/// A static server list, supplied once and never refreshed.
///
/// The round-robin cursor starts at a random position so a fleet of clients
/// does not hammer the same first server.
pub struct MultiServerDiscovery {
    state: StdMutex<ServerList>,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..u32::MAX as usize);
        Self {
            state: StdMutex::new(ServerList { servers, index }),
        }
    }

    fn select(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock().expect("server list poisoned");
        let n = state.servers.len();
        if n == 0 {
            return Err(MuxError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => Ok(state.servers[rand::thread_rng().gen_range(0..n)].clone()),
            SelectMode::RoundRobin => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    fn set_servers(&self, servers: Vec<String>) {
        self.state.lock().expect("server list poisoned").servers = servers;
    }

    fn snapshot(&self) -> Vec<String> {
        self.state.lock().expect("server list poisoned").servers.clone()
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.set_servers(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

/// Discovery backed by the membership registry's HTTP endpoint.
///
/// `refresh` is a no-op while the cached list is younger than the freshness
/// window; past it, one `GET` fetches the alive set from the registry's
/// comma-separated response header. Selection and snapshots go through
/// `refresh` first, so a stale cache heals on use.
pub struct RegistryDiscovery {
    inner: MultiServerDiscovery,
    registry: String,
    refresh_window: Duration,
    last_refresh: StdMutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `refresh_window == Duration::ZERO` selects the 10-second default.
    pub fn new(registry: impl Into<String>, refresh_window: Duration) -> Self {
        let refresh_window = if refresh_window.is_zero() {
            DEFAULT_DISCOVERY_REFRESH
        } else {
            refresh_window
        };
        Self {
            inner: MultiServerDiscovery::new(Vec::new()),
            registry: registry.into(),
            refresh_window,
            last_refresh: StdMutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_refresh
            .lock()
            .expect("refresh clock poisoned")
            .map(|at| at.elapsed() < self.refresh_window)
            .unwrap_or(false)
    }

    fn mark_refreshed(&self) {
        *self.last_refresh.lock().expect("refresh clock poisoned") = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }

        debug!(registry = %self.registry, "refreshing servers from registry");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| MuxError::Registry(e.to_string()))?;

        let listed = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let servers: Vec<String> = listed
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(String::from)
            .collect();

        self.inner.set_servers(servers);
        self.mark_refreshed();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.set_servers(servers);
        self.mark_refreshed();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.inner.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.inner.snapshot())
    }
}
