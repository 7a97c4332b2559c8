use serde_json::Value;

use crate::protocol::error::Result;
use crate::protocol::Header;

use super::Codec;

/// Identifier the JSON codec is negotiated under.
pub const JSON_CODEC: &str = "application/json";

/// JSON codec, the built-in default.
///
/// # Example
///
/// ```
/// use muxrpc_core::codec::{Codec, JsonCodec};
/// use muxrpc_core::Header;
///
/// let codec = JsonCodec;
/// let header = Header::request("Arith.sum", 1);
///
/// let encoded = codec.encode_header(&header).unwrap();
/// let decoded = codec.decode_header(&encoded).unwrap();
/// assert_eq!(header, decoded);
/// ```
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        JSON_CODEC
    }

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(header)?)
    }

    fn decode_header(&self, data: &[u8]) -> Result<Header> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_body(&self, body: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(body)?)
    }

    fn decode_body(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}
