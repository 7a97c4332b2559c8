//! # mux-rpc CLI Entry Point
//!
//! Main binary for the mux-rpc system.
//!
//! ## Usage
//!
//! ```bash
//! # Run a membership registry
//! muxrpc registry -b 127.0.0.1:9091
//!
//! # Run a server with the demo Arith service, heartbeating into a registry
//! muxrpc serve -b 127.0.0.1:9999 --registry http://127.0.0.1:9091/muxrpc/registry
//!
//! # Make a one-shot call (outputs raw JSON)
//! muxrpc call tcp@127.0.0.1:9999 Arith.sum '[2, 3]'
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;

use muxrpc_client::xdial;
use muxrpc_core::ConnectOptions;
use muxrpc_registry::{start_heartbeat, Registry};
use muxrpc_server::{Server, Service};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// mux-rpc - a multiplexing RPC system
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Registry(RegistryArgs),
    Serve(ServeArgs),
    Call(CallArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "registry")]
/// run a membership registry
struct RegistryArgs {
    /// address to bind the registry HTTP endpoint to
    #[argh(option, short = 'b', default = "\"127.0.0.1:9091\".to_string()")]
    bind: String,

    /// expiry window in seconds, 0 disables expiry
    #[argh(option, default = "300")]
    timeout_secs: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run an RPC server with the demo Arith service
struct ServeArgs {
    /// address to bind the RPC listener to
    #[argh(option, short = 'b', default = "\"127.0.0.1:9999\".to_string()")]
    bind: String,

    /// registry URL to heartbeat into, e.g. http://127.0.0.1:9091/muxrpc/registry
    #[argh(option)]
    registry: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an RPC method once and print the raw JSON reply
struct CallArgs {
    /// server address in protocol@addr form, e.g. tcp@127.0.0.1:9999
    #[argh(positional)]
    server_address: String,

    /// qualified method name, e.g. Arith.sum
    #[argh(positional)]
    service_method: String,

    /// JSON string with the call arguments, defaults to null
    #[argh(option, short = 'a', long = "args", default = "\"null\".into()")]
    args: String,

    /// give up after this many seconds
    #[argh(option, default = "10")]
    timeout_secs: u64,
}

/// The demo service registered by `muxrpc serve`.
fn arith_service() -> Service {
    Service::new("Arith")
        .method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) })
        .method("mul", |(a, b): (i64, i64)| async move { Ok(a * b) })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for unix tool usage (piping to jq, etc.).
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Registry(args) => {
            let listener = tokio::net::TcpListener::bind(&args.bind)
                .await
                .with_context(|| format!("failed to bind registry to {}", args.bind))?;
            let registry = Arc::new(Registry::new(Duration::from_secs(args.timeout_secs)));
            registry.serve(listener).await?;
        }
        Commands::Serve(args) => {
            let listener = tokio::net::TcpListener::bind(&args.bind)
                .await
                .with_context(|| format!("failed to bind server to {}", args.bind))?;
            let local_addr = listener.local_addr()?;
            tracing::info!("serving Arith on tcp@{}", local_addr);

            let server = Arc::new(Server::new());
            server.register(arith_service())?;

            if let Some(registry) = args.registry {
                start_heartbeat(registry, format!("tcp@{}", local_addr), None);
            }

            server.serve(listener).await?;
        }
        Commands::Call(args) => {
            let call_args: serde_json::Value = serde_json::from_str(&args.args)
                .with_context(|| format!("arguments are not valid JSON: {}", args.args))?;

            let client = xdial(&args.server_address, ConnectOptions::default()).await?;
            let reply = client
                .call_value_timeout(
                    &args.service_method,
                    call_args,
                    Duration::from_secs(args.timeout_secs),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_subcommand() {
        let cli = Cli::from_args(
            &["muxrpc"],
            &["call", "tcp@127.0.0.1:9999", "Arith.sum", "-a", "[2, 3]"],
        )
        .unwrap();
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.server_address, "tcp@127.0.0.1:9999");
                assert_eq!(args.service_method, "Arith.sum");
                assert_eq!(args.args, "[2, 3]");
            }
            _ => panic!("expected call subcommand"),
        }
    }

    #[test]
    fn test_registry_defaults() {
        let cli = Cli::from_args(&["muxrpc"], &["registry"]).unwrap();
        match cli.command {
            Commands::Registry(args) => {
                assert_eq!(args.bind, "127.0.0.1:9091");
                assert_eq!(args.timeout_secs, 300);
            }
            _ => panic!("expected registry subcommand"),
        }
    }

    #[tokio::test]
    async fn test_demo_service_sum() {
        let service = arith_service();
        let reply = service.invoke("sum", serde_json::json!([2, 3])).await.unwrap();
        assert_eq!(reply, serde_json::json!(5));
    }
}
