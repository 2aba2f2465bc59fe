//! Payload codecs.
//!
//! Two encodings travel on the wire, selected by the two encoding bits in
//! the message flags:
//! - [`MsgPackCodec`] — structured data via MessagePack (`rmp-serde`)
//! - [`RawCodec`] — opaque byte passthrough

mod msgpack;
mod raw;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;
