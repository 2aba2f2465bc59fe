//! Wire format constants and the fixed frame prefix.
//!
//! Every frame is three concatenated regions:
//! ```text
//! ┌──────────────┬──────────────┬───────────────────────┐
//! │ Prefix       │ Header       │ Body                  │
//! │ 8 bytes      │ N bytes      │ payload ++ extra      │
//! │ 2 × u32 BE   │ MsgPack map  │                       │
//! └──────────────┴──────────────┴───────────────────────┘
//! ```
//! The prefix carries `total_length` (whole frame) and `head_length`
//! (header region only). All multi-byte integers are Big Endian.

use crate::error::{BusError, Result};

/// Routing identifier types. `INVALID_ID` is the shared sentinel.
pub type SessionId = u32;
pub type EndpointId = u32;
pub type ObjectId = u32;
pub type MsgCode = u32;
pub type MsgSerial = u32;

/// Sentinel for unassigned identifiers and serials.
pub const INVALID_ID: u32 = u32::MAX;

/// Check that an identifier has been assigned.
#[inline]
pub fn is_valid_id(id: u32) -> bool {
    id != INVALID_ID
}

/// Prefix size in bytes (fixed, exactly 8).
pub const PREFIX_SIZE: usize = 8;

/// Maximum encoded header size.
pub const MAX_HEAD_SIZE: usize = 1024;

/// Headroom reserved in front of the payload so prefix + header can be
/// written without moving payload bytes.
pub const MAX_RESERVED_SIZE: usize = PREFIX_SIZE + MAX_HEAD_SIZE;

/// Default maximum total frame size accepted by the decoder (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Reserved code: register subscription items carried in the payload.
pub const CODE_SUBSCRIBE: MsgCode = 0xFFFF_FF00;
/// Reserved code: remove subscription items carried in the payload.
pub const CODE_UNSUBSCRIBE: MsgCode = 0xFFFF_FF01;
/// Reserved code: request a one-shot broadcast without touching subscriptions.
pub const CODE_UPDATE: MsgCode = 0xFFFF_FF02;

/// Message flag bits.
///
/// Bits inside [`flags::GLOBAL_MASK`] travel on the wire in the header's
/// `flag` field; all other bits are process-local bookkeeping.
pub mod flags {
    /// The message carries an error status.
    pub const ERROR: u32 = 1 << 0;
    /// The message payload is a status record.
    pub const STATUS: u32 = 1 << 1;
    /// Broadcast delivered only to the session that just subscribed.
    pub const INITIAL_RESPONSE: u32 = 1 << 2;
    /// Timing overlay is armed; header carries timestamps.
    pub const DEBUG: u32 = 1 << 3;
    /// Shift of the two-bit payload encoding field.
    pub const ENCODING_SHIFT: u32 = 4;
    /// Mask of the two-bit payload encoding field.
    pub const ENCODING_MASK: u32 = 0b11 << ENCODING_SHIFT;

    /// Bits persisted on the wire.
    pub const GLOBAL_MASK: u32 = ERROR | STATUS | INITIAL_RESPONSE | DEBUG | ENCODING_MASK;

    /// Header already encoded into the buffer headroom.
    pub const HEAD_OK: u32 = 1 << 8;
    /// Fire-and-forget: no reply, status, or auto-reply may ever be produced.
    pub const NOREPLY_EXPECTED: u32 = 1 << 9;
    /// Emit a terminal status on last-holder drop unless replied.
    pub const AUTO_REPLY: u32 = 1 << 10;
    /// Caller is blocked on the message's completion primitive.
    pub const SYNC_REPLY: u32 = 1 << 11;
    /// A reply has been produced; set at most once.
    pub const REPLIED: u32 = 1 << 12;
    /// Buffer was received off the wire (provenance accounting).
    pub const EXTERNAL_BUFFER: u32 = 1 << 13;
    /// Session unresolved; route lazily through the endpoint's preferred peer.
    pub const ENDPOINT: u32 = 1 << 14;
    /// Payload is mirrored to the telemetry path.
    pub const ENABLE_LOG: u32 = 1 << 15;
    /// Broadcast triggered by an update request rather than a subscription.
    pub const MANUAL_UPDATE: u32 = 1 << 16;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has(flags: u32, flag: u32) -> bool {
        flags & flag != 0
    }
}

/// Status codes carried in status payloads.
///
/// Values inside `[ST_AUTO_REPLY_OK, ST_OK]` are informational; anything
/// outside that range marks the message with the error bit.
pub mod status {
    /// Explicit success.
    pub const ST_OK: i32 = 0;
    /// Synthesized success emitted when a request is dropped unreplied.
    pub const ST_AUTO_REPLY_OK: i32 = -1;
    /// Unclassified failure.
    pub const ST_UNKNOWN: i32 = -2;
    /// No session or endpoint could be resolved.
    pub const ST_INVALID_ID: i32 = -3;
    /// A pending request's timer fired.
    pub const ST_TIMEOUT: i32 = -4;
    /// The owning session was torn down with the request outstanding.
    pub const ST_PEER_VANISH: i32 = -5;

    /// Whether a status code marks the message as an error.
    #[inline]
    pub fn is_error(code: i32) -> bool {
        !(ST_AUTO_REPLY_OK..=ST_OK).contains(&code)
    }
}

/// Message type. Ordinals are wire-stable; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    Request = 1,
    Reply = 2,
    SubscribeRequest = 3,
    Broadcast = 4,
    SidebandRequest = 5,
    SidebandReply = 6,
    Status = 7,
}

impl MessageType {
    /// Decode a wire ordinal. Values beyond the published enum map to
    /// `Unknown` and are dropped by the dispatcher.
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => MessageType::Request,
            2 => MessageType::Reply,
            3 => MessageType::SubscribeRequest,
            4 => MessageType::Broadcast,
            5 => MessageType::SidebandRequest,
            6 => MessageType::SidebandReply,
            7 => MessageType::Status,
            _ => MessageType::Unknown,
        }
    }

    /// Wire ordinal.
    #[inline]
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Ordinal-stable printable name.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Unknown => "Unknown",
            MessageType::Request => "Request",
            MessageType::Reply => "Reply",
            MessageType::SubscribeRequest => "Subscribe",
            MessageType::Broadcast => "Broadcast",
            MessageType::SidebandRequest => "SidebandRequest",
            MessageType::SidebandReply => "SidebandReply",
            MessageType::Status => "Status",
        }
    }

    /// True for the request family (a reply may come back).
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::SidebandRequest | MessageType::SubscribeRequest
        )
    }

    /// True for the reply family (correlates to a pending serial).
    #[inline]
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::Reply | MessageType::SidebandReply | MessageType::Status
        )
    }
}

/// Payload encoding, stored in the two encoding flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    MsgPack = 0,
    Raw = 1,
}

impl Encoding {
    /// Extract the encoding from a flag word.
    pub fn from_flags(flags_word: u32) -> Self {
        match (flags_word & flags::ENCODING_MASK) >> flags::ENCODING_SHIFT {
            1 => Encoding::Raw,
            _ => Encoding::MsgPack,
        }
    }

    /// Render the encoding into its flag bits.
    #[inline]
    pub fn to_flag_bits(self) -> u32 {
        ((self as u32) << flags::ENCODING_SHIFT) & flags::ENCODING_MASK
    }
}

/// Decoded frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    /// Whole frame length, prefix included.
    pub total_length: u32,
    /// Header region length.
    pub head_length: u32,
}

impl Prefix {
    /// Create a new prefix.
    pub fn new(total_length: u32, head_length: u32) -> Self {
        Self {
            total_length,
            head_length,
        }
    }

    /// Encode to bytes (Big Endian).
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `PREFIX_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PREFIX_SIZE);
        buf[0..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.head_length.to_be_bytes());
    }

    /// Decode from bytes (Big Endian). Returns `None` if too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }
        Some(Self {
            total_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            head_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Validate against a frame size limit and internal consistency.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.total_length > max_frame_size {
            return Err(BusError::Protocol(format!(
                "frame size {} exceeds maximum {}",
                self.total_length, max_frame_size
            )));
        }
        if (self.total_length as usize) < PREFIX_SIZE + self.head_length as usize {
            return Err(BusError::Protocol(format!(
                "frame size {} cannot hold a {}-byte header",
                self.total_length, self.head_length
            )));
        }
        if self.head_length as usize > MAX_HEAD_SIZE {
            return Err(BusError::Protocol(format!(
                "header size {} exceeds maximum {}",
                self.head_length, MAX_HEAD_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_encode_decode_roundtrip() {
        let original = Prefix::new(120, 40);
        let encoded = original.encode();
        let decoded = Prefix::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_prefix_big_endian_byte_order() {
        let prefix = Prefix::new(0x0102_0304, 0x0506_0708);
        let bytes = prefix.encode();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[2], 0x03);
        assert_eq!(bytes[3], 0x04);
        assert_eq!(bytes[4], 0x05);
        assert_eq!(bytes[5], 0x06);
        assert_eq!(bytes[6], 0x07);
        assert_eq!(bytes[7], 0x08);
    }

    #[test]
    fn test_prefix_decode_too_short() {
        assert!(Prefix::decode(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_prefix_validate_oversized_frame() {
        let prefix = Prefix::new(1_000_000, 10);
        assert!(prefix.validate(100).is_err());
    }

    #[test]
    fn test_prefix_validate_header_larger_than_frame() {
        let prefix = Prefix::new(16, 100);
        assert!(prefix.validate(DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_message_type_ordinals_are_stable() {
        assert_eq!(MessageType::Unknown.to_wire(), 0);
        assert_eq!(MessageType::Request.to_wire(), 1);
        assert_eq!(MessageType::Reply.to_wire(), 2);
        assert_eq!(MessageType::SubscribeRequest.to_wire(), 3);
        assert_eq!(MessageType::Broadcast.to_wire(), 4);
        assert_eq!(MessageType::SidebandRequest.to_wire(), 5);
        assert_eq!(MessageType::SidebandReply.to_wire(), 6);
        assert_eq!(MessageType::Status.to_wire(), 7);
    }

    #[test]
    fn test_message_type_name_table() {
        assert_eq!(MessageType::from_wire(0).name(), "Unknown");
        assert_eq!(MessageType::from_wire(1).name(), "Request");
        assert_eq!(MessageType::from_wire(4).name(), "Broadcast");
        assert_eq!(MessageType::from_wire(7).name(), "Status");
    }

    #[test]
    fn test_message_type_unpublished_values_decode_as_unknown() {
        assert_eq!(MessageType::from_wire(8), MessageType::Unknown);
        assert_eq!(MessageType::from_wire(255), MessageType::Unknown);
    }

    #[test]
    fn test_encoding_flag_bits_roundtrip() {
        for enc in [Encoding::MsgPack, Encoding::Raw] {
            let word = enc.to_flag_bits();
            assert_eq!(Encoding::from_flags(word), enc);
            assert_eq!(word & !flags::ENCODING_MASK, 0);
        }
    }

    #[test]
    fn test_status_range_convention() {
        assert!(!status::is_error(status::ST_OK));
        assert!(!status::is_error(status::ST_AUTO_REPLY_OK));
        assert!(status::is_error(status::ST_TIMEOUT));
        assert!(status::is_error(status::ST_INVALID_ID));
        assert!(status::is_error(1));
    }

    #[test]
    fn test_global_mask_excludes_local_flags() {
        for local in [
            flags::HEAD_OK,
            flags::NOREPLY_EXPECTED,
            flags::AUTO_REPLY,
            flags::SYNC_REPLY,
            flags::REPLIED,
            flags::EXTERNAL_BUFFER,
            flags::ENDPOINT,
            flags::ENABLE_LOG,
            flags::MANUAL_UPDATE,
        ] {
            assert_eq!(local & flags::GLOBAL_MASK, 0);
        }
    }

    #[test]
    fn test_invalid_id_sentinel() {
        assert!(!is_valid_id(INVALID_ID));
        assert!(is_valid_id(0));
        assert!(is_valid_id(42));
    }
}
