//! Metadata-exchange wire format.
//!
//! An MDX frame is the 8-byte ASCII signature `CSQLMDEX`, a big-endian
//! u32 body length, and a protobuf-encoded body. The signature doubles as
//! the discriminator on the read path: a peer that does not speak MDX sends
//! application bytes instead, which will not start with the signature.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use prost::Message;

/// Frame signature, always the first eight bytes of an MDX frame.
pub const SIGNATURE: &[u8; 8] = b"CSQLMDEX";

/// Upper bound on a frame body; anything larger is a protocol violation.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// How the client intends to carry database traffic over this socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ClientProtocolType {
    Unspecified = 0,
    /// Plain TCP inside the broker's TLS tunnel.
    Tcp = 1,
    /// A second, driver-negotiated TLS session inside the tunnel.
    Tls = 2,
    /// Unix domain socket semantics tunnelled over the connection.
    Uds = 3,
}

/// Sent by the client immediately after the TLS handshake.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataExchangeRequest {
    #[prost(string, tag = "1")]
    pub user_agent: String,
    #[prost(enumeration = "ClientProtocolType", tag = "2")]
    pub client_protocol_type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
    Unspecified = 0,
    Ok = 1,
    Error = 2,
}

/// The server's verdict on the exchange, read before application data.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataExchangeResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub response_code: i32,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Encode a complete frame: signature, length prefix, protobuf body.
pub fn encode_frame<M: Message>(message: &M) -> Result<BytesMut> {
    let body_len = message.encoded_len();
    if body_len > MAX_BODY_LEN {
        return Err(Error::Protocol(format!(
            "frame body of {} bytes exceeds maximum {}",
            body_len, MAX_BODY_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(SIGNATURE.len() + 4 + body_len);
    buf.put_slice(SIGNATURE);
    buf.put_u32(body_len as u32);
    message
        .encode(&mut buf)
        .map_err(|e| Error::Protocol(format!("unable to encode frame body: {}", e)))?;
    Ok(buf)
}

/// Decode a frame body as a response message.
pub fn decode_response(body: &[u8]) -> Result<MetadataExchangeResponse> {
    MetadataExchangeResponse::decode(body)
        .map_err(|e| Error::Protocol(format!("unable to decode response body: {}", e)))
}
