//! Pluggable header/body encoding.
//!
//! A [`Codec`] turns [`Header`]s and `serde_json::Value` bodies into bytes and
//! back; [`read_frame`]/[`write_frame`] handle the length-prefixed framing
//! around those bytes. Codecs are stateless and shared as `Arc<dyn Codec>`,
//! looked up by string identifier through a [`CodecRegistry`].
//!
//! The built-in codec is [`JsonCodec`] (`"application/json"`). The registry is
//! open: callers can register further codecs (MessagePack, CBOR, ...) under
//! their own identifiers before constructing a server.

mod frame;
mod json;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::error::Result;
use crate::protocol::Header;

pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use json::{JsonCodec, JSON_CODEC};

/// Encodes and decodes header and body frames for one negotiated format.
///
/// Implementations must be pure serializers: framing and I/O live in
/// [`read_frame`]/[`write_frame`], which lets one codec instance serve the
/// read and write halves of a connection concurrently.
pub trait Codec: Send + Sync {
    /// Identifier this codec is negotiated under, e.g. `"application/json"`.
    fn name(&self) -> &str;

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>>;

    fn decode_header(&self, data: &[u8]) -> Result<Header>;

    fn encode_body(&self, body: &Value) -> Result<Vec<u8>>;

    fn decode_body(&self, data: &[u8]) -> Result<Value>;
}

/// Open set of codecs keyed by string identifier.
///
/// # Example
///
/// ```
/// use muxrpc_core::codec::{CodecRegistry, JSON_CODEC};
///
/// let registry = CodecRegistry::default();
/// assert!(registry.get(JSON_CODEC).is_some());
/// assert!(registry.get("application/gob").is_none());
/// ```
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers `codec` under its own [`Codec::name`], replacing any
    /// previous codec with that identifier.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Looks up a codec by identifier.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }
}

impl Default for CodecRegistry {
    /// A registry with the built-in [`JsonCodec`].
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry
    }
}
