//! mux-rpc Protocol Core
//!
//! This crate provides the wire protocol and codec layer shared by the
//! mux-rpc client, server and membership registry.
//!
//! # Overview
//!
//! mux-rpc is a small multiplexing RPC system: many concurrent calls share one
//! connection, and responses are routed back to their callers by sequence
//! number. This crate contains the pieces every component agrees on:
//!
//! - **Protocol layer**: the one-time [`ConnectOptions`] handshake, the
//!   per-message [`Header`], error handling, and the membership registry's
//!   HTTP header/path constants
//! - **Codec layer**: pluggable header/body encoding behind the [`Codec`]
//!   trait plus length-prefixed framing
//!
//! # Wire format
//!
//! A connection starts with exactly one JSON-encoded [`ConnectOptions`] frame.
//! After that, both sides exchange messages encoded by the negotiated codec:
//! a `Header` frame followed by a body frame, except that a response header
//! carrying a non-empty `error` has no body. Every frame is
//! `[4-byte length prefix as u32 big-endian] + [payload]`.
//!
//! # Example
//!
//! ```
//! use muxrpc_core::{ConnectOptions, Header};
//!
//! let opts = ConnectOptions::default();
//! assert_eq!(opts.codec_type, "application/json");
//!
//! let header = Header::request("Arith.sum", 1);
//! assert!(header.error.is_empty());
//! ```

pub mod codec;
pub mod protocol;

pub use codec::{read_frame, write_frame, Codec, CodecRegistry, JsonCodec, MAX_FRAME_SIZE};
pub use protocol::error::{MuxError, Result};
pub use protocol::{ConnectOptions, Header, MAGIC};
