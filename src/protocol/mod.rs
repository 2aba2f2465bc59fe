//! Wire protocol: prefix, flags, header record, frame decoding.

mod frame;
mod header;
mod wire;

pub use frame::{FrameDecoder, RawFrame};
pub use header::{MessageHead, StatusInfo, SubscribeItem, SubscribeList};
pub use wire::{
    flags, status, Encoding, MessageType, Prefix, DEFAULT_MAX_FRAME_SIZE, INVALID_ID,
    MAX_HEAD_SIZE, MAX_RESERVED_SIZE, PREFIX_SIZE,
};
pub use wire::{is_valid_id, EndpointId, MsgCode, MsgSerial, ObjectId, SessionId};
pub use wire::{CODE_SUBSCRIBE, CODE_UNSUBSCRIBE, CODE_UPDATE};
