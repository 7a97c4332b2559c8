//! mux-rpc Server
//!
//! This crate provides the connection-serving side of mux-rpc: an in-process
//! [`Service`] registry built from explicitly registered, typed method
//! handlers, and a [`Server`] that accepts connections, performs the
//! handshake, and dispatches each request on its own task.

pub mod server;
pub mod service;

pub use server::Server;
pub use service::Service;
