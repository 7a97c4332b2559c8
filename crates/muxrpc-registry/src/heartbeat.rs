//! Heartbeat sender: a long-lived task that keeps one server's registry
//! entry alive.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use muxrpc_core::protocol::{DEFAULT_REGISTRY_TIMEOUT, SERVER_HEADER};
use muxrpc_core::{MuxError, Result};

/// Safety margin subtracted from the registry timeout when deriving the
/// default heartbeat period, so at least one heartbeat lands before expiry
/// even with scheduling jitter.
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(60);

/// `POST`s one heartbeat for `addr` to the registry.
pub async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    debug!(addr, registry = registry_url, "sending heartbeat");
    let response = http
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|e| MuxError::Registry(e.to_string()))?;

    if !response.status().is_success() {
        return Err(MuxError::Registry(format!(
            "heartbeat rejected with status {}",
            response.status()
        )));
    }
    Ok(())
}

/// Spawns the heartbeat task for `addr`.
///
/// Sends once immediately, then on the fixed `period` (default: the registry
/// expiry window minus a one-minute margin) only while sends keep succeeding.
/// The first failed send logs a warning and stops the task for good; the
/// server then ages out of the registry unless something restarts the
/// heartbeat.
pub fn start_heartbeat(registry_url: String, addr: String, period: Option<Duration>) -> JoinHandle<()> {
    let period = period.unwrap_or_else(|| DEFAULT_REGISTRY_TIMEOUT.saturating_sub(HEARTBEAT_MARGIN));

    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(period);
        loop {
            // First tick fires immediately.
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!(addr, error = %e, "heartbeat failed, stopping sender");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_to_unreachable_registry_errors() {
        let http = reqwest::Client::new();
        let err = send_heartbeat(&http, "http://127.0.0.1:1/muxrpc/registry", "tcp@x:1")
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Registry(_)));
    }

    #[tokio::test]
    async fn test_sender_stops_after_first_failure() {
        // Unreachable registry: the task must finish on its own, not loop.
        let handle = start_heartbeat(
            "http://127.0.0.1:1/muxrpc/registry".to_string(),
            "tcp@x:1".to_string(),
            Some(Duration::from_millis(10)),
        );
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("heartbeat task should stop after a failed send")
            .unwrap();
    }
}
