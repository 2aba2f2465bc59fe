//! Raw codec: opaque byte passthrough.
//!
//! Used for payloads whose schema the bus does not interpret. The
//! receiving application decodes them with its own tooling.

/// Passthrough codec for raw byte payloads.
pub struct RawCodec;

impl RawCodec {
    /// "Encode" raw bytes (copies into an owned buffer).
    #[inline]
    pub fn encode(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    /// "Decode" raw bytes (borrowing view).
    #[inline]
    pub fn decode(bytes: &[u8]) -> &[u8] {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_passthrough() {
        let data = b"\x00\x01binary\xFF";
        let encoded = RawCodec::encode(data);
        assert_eq!(encoded, data);
        assert_eq!(RawCodec::decode(&encoded), data);
    }

    #[test]
    fn test_raw_empty() {
        assert!(RawCodec::encode(b"").is_empty());
    }
}
