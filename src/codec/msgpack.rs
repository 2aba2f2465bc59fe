//! MsgPack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps (with field names)
//! rather than positional arrays. The wire header relies on this: optional
//! header fields are simply absent keys, and decoders fill them with
//! defaults.
//!
//! # Example
//!
//! ```
//! use framebus::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Sample {
//!     id: u32,
//!     content: String,
//! }
//!
//! let sample = Sample { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&sample).unwrap();
//! let decoded: Sample = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, sample);
//! ```

use crate::error::Result;

/// MessagePack codec for structured headers and payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "probe".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_uses_map_format() {
        let value = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };
        let encoded = MsgPackCodec::encode(&value).unwrap();

        // Map format embeds field names; array format would not.
        let haystack = String::from_utf8_lossy(&encoded);
        assert!(haystack.contains("id"));
        assert!(haystack.contains("name"));
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
    struct Versioned {
        required: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        optional: Option<String>,
    }

    #[test]
    fn test_optional_fields_roundtrip() {
        let none = Versioned {
            required: 7,
            optional: None,
        };
        let encoded = MsgPackCodec::encode(&none).unwrap();
        let decoded: Versioned = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, none);

        let some = Versioned {
            required: 7,
            optional: Some("present".to_string()),
        };
        let encoded = MsgPackCodec::encode(&some).unwrap();
        let decoded: Versioned = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, some);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = [0xC1u8, 0xFF, 0x00];
        let result: Result<TestStruct> = MsgPackCodec::decode(&garbage);
        assert!(result.is_err());
    }

    #[test]
    fn test_primitives() {
        let encoded = MsgPackCodec::encode(&"ping").unwrap();
        let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, "ping");

        let encoded = MsgPackCodec::encode(&12345u64).unwrap();
        let decoded: u64 = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, 12345);
    }
}
