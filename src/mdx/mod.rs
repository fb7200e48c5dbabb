//! Metadata exchange (MDX).
//!
//! After the TLS handshake the client may tell the server how it intends to
//! use the socket (plain TCP, nested TLS, or unix-socket semantics) by
//! sending one framed protobuf request; the server answers with a framed
//! verdict in front of the application data. Both halves are optional on
//! the wire, so the read side sniffs for the frame signature and degrades
//! to a transparent pipe.

pub mod codec;
pub mod stream;

pub use codec::{
    decode_response, encode_frame, ClientProtocolType, MetadataExchangeRequest,
    MetadataExchangeResponse, ResponseCode, MAX_BODY_LEN, SIGNATURE,
};
pub use stream::MdxStream;
