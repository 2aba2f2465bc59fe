//! Incremental frame decoder for session read loops.
//!
//! Accumulates partial reads in a `BytesMut` and extracts whole frames
//! with a two-state machine:
//! - `WaitingForPrefix`: need the fixed 8-byte prefix
//! - `WaitingForRemainder`: prefix parsed, need `total_length - 8` more
//!
//! The extracted [`RawFrame`] keeps the prefix bytes in place so the
//! message layer can adopt the buffer verbatim (offset zero).

use bytes::{Bytes, BytesMut};

use super::wire::{Prefix, DEFAULT_MAX_FRAME_SIZE, PREFIX_SIZE};
use crate::error::Result;

/// A complete frame as read off the wire, prefix included.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Decoded prefix.
    pub prefix: Prefix,
    /// The whole frame: prefix ++ header ++ payload ++ extra.
    pub bytes: Bytes,
}

/// State machine for frame extraction.
#[derive(Debug, Clone)]
enum State {
    WaitingForPrefix,
    WaitingForRemainder { prefix: Prefix, remaining: usize },
}

/// Buffer accumulating incoming bytes and yielding complete frames.
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit.
    pub fn with_max_frame(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            max_frame_size,
        }
    }

    /// Push data and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on a prefix that fails validation (oversized frame,
    /// header larger than the frame).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<RawFrame>> {
        match &self.state {
            State::WaitingForPrefix => {
                if self.buffer.len() < PREFIX_SIZE {
                    return Ok(None);
                }

                let prefix =
                    Prefix::decode(&self.buffer[..PREFIX_SIZE]).expect("buffer has enough bytes");
                prefix.validate(self.max_frame_size)?;

                self.state = State::WaitingForRemainder {
                    prefix,
                    remaining: prefix.total_length as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForRemainder { prefix, remaining } => {
                let remaining = *remaining;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let bytes = self.buffer.split_to(remaining).freeze();
                let prefix = *prefix;
                self.state = State::WaitingForPrefix;

                Ok(Some(RawFrame { prefix, bytes }))
            }
        }
    }

    /// Number of buffered bytes not yet forming a frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForRemainder { .. } => "WaitingForRemainder",
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
