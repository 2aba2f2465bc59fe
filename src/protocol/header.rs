//! Structured wire header and the small payload records the bus itself
//! understands (status info, subscription lists).
//!
//! The header is a MsgPack map of `head_length` bytes sitting between the
//! fixed prefix and the payload. Optional fields are absent keys.

use serde::{Deserialize, Serialize};

use super::wire::{flags, MsgCode, MsgSerial, ObjectId, MAX_HEAD_SIZE};
use crate::codec::MsgPackCodec;
use crate::error::{BusError, Result};

/// The structured header record.
///
/// `flag` is masked to the global subset before serialization; local flag
/// bits never travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHead {
    /// Message type ordinal.
    #[serde(rename = "type")]
    pub msg_type: u8,
    pub serial_number: MsgSerial,
    pub code: MsgCode,
    pub flag: u32,
    pub object_id: ObjectId,
    pub payload_size: u32,
    /// Printable endpoint identity; filled from the session on encode
    /// when the message did not carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Broadcast only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_filter: Option<String>,
    /// Debug overlay: send stamp on requests, arrive stamp on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_or_arrive_time: Option<u64>,
    /// Debug overlay: reply stamp, replies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_time: Option<u64>,
}

impl MessageHead {
    /// Encode to MsgPack, masking `flag` to the wire subset.
    ///
    /// # Errors
    ///
    /// `HeadTooLong` if the encoded record exceeds [`MAX_HEAD_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut wire = self.clone();
        wire.flag &= flags::GLOBAL_MASK;
        let bytes = MsgPackCodec::encode(&wire)?;
        if bytes.len() > MAX_HEAD_SIZE {
            return Err(BusError::HeadTooLong { size: bytes.len() });
        }
        Ok(bytes)
    }

    /// Decode from the header region of a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }
}

/// Status payload: a code plus a printable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusInfo {
    pub code: i32,
    #[serde(default)]
    pub description: String,
}

/// One subscription: an application code narrowed by a filter string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeItem {
    pub code: MsgCode,
    #[serde(default)]
    pub filter: String,
}

/// Payload of a subscribe/unsubscribe/update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubscribeList {
    pub items: Vec<SubscribeItem>,
}

impl SubscribeList {
    /// Build a list from `(code, filter)` pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (MsgCode, &'a str)>,
    {
        Self {
            items: pairs
                .into_iter()
                .map(|(code, filter)| SubscribeItem {
                    code,
                    filter: filter.to_string(),
                })
                .collect(),
        }
    }
}
