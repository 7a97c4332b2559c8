//! mux-rpc Client
//!
//! This crate provides the calling side of mux-rpc:
//!
//! - [`Client`]: one connection, many concurrent calls. Each outgoing call
//!   gets a unique sequence number; a dedicated receive task routes responses
//!   back to their callers regardless of arrival order.
//! - [`Discovery`] with a static ([`MultiServerDiscovery`]) and a
//!   registry-polling ([`RegistryDiscovery`]) variant.
//! - [`XClient`]: turns a set of interchangeable servers into one logical
//!   endpoint, pooling one connection per address, selecting a server per
//!   call by [`SelectMode`], and fanning calls out with
//!   [`broadcast`](XClient::broadcast).

pub mod client;
pub mod discovery;
pub mod xclient;

pub use client::{Call, Client};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use xclient::{xdial, XClient};
