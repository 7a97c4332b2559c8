//! mux-rpc Membership Registry
//!
//! A small HTTP service servers heartbeat into. The registry tracks the last
//! heartbeat time per address and reports the currently-alive set; expiry is
//! computed lazily at read time, never by a background sweep.
//!
//! # HTTP protocol
//!
//! At [`REGISTRY_PATH`](muxrpc_core::protocol::REGISTRY_PATH):
//!
//! - `POST` with request header `x-muxrpc-server: <addr>` registers or
//!   refreshes that address; a missing header is answered with 500.
//! - `GET` answers 200 with response header `x-muxrpc-servers: a,b,c`, the
//!   alive addresses sorted lexicographically.
//! - Any other method is answered with 405.

pub mod heartbeat;
pub mod registry;

pub use heartbeat::{send_heartbeat, start_heartbeat};
pub use registry::{Registry, ServerItem};
