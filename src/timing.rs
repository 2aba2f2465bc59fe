//! Debug/timing overlay: four nanosecond stamps across the request/reply
//! edges and the durations derived from them.
//!
//! A stamp of zero means "unset"; any interval with an unset bound
//! collapses to zero. The clock is process-monotonic, so stamps taken in
//! the same process compare safely.

use std::sync::OnceLock;
use std::time::Instant;

use crate::protocol::{MessageHead, MessageType};

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
///
/// Never returns zero: zero is the unset sentinel in [`DebugStamps`].
pub fn now_ns() -> u64 {
    let base = *CLOCK_BASE.get_or_init(Instant::now);
    Instant::now().duration_since(base).as_nanos() as u64 + 1
}

/// Timestamp overlay captured when a message has debug enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugStamps {
    /// Client clock when the request left.
    pub send: u64,
    /// Server clock when the request arrived.
    pub arrive: u64,
    /// Server clock when the reply left.
    pub reply: u64,
    /// Client clock when the reply arrived.
    pub receive: u64,
}

/// Durations derived from the four stamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latency {
    pub client_to_server: u64,
    pub server_to_reply: u64,
    pub reply_to_client: u64,
    pub total: u64,
}

fn interval(start: u64, end: u64) -> u64 {
    if start == 0 || end == 0 {
        0
    } else {
        end.saturating_sub(start)
    }
}

impl DebugStamps {
    /// Stamp the header for an outgoing frame.
    ///
    /// Requests, subscribes, and broadcasts carry their send time; replies
    /// and statuses echo the receiver's arrive time and carry a fresh
    /// reply time.
    pub(crate) fn encode_into(&mut self, head: &mut MessageHead, msg_type: MessageType) {
        match msg_type {
            MessageType::Reply | MessageType::SidebandReply | MessageType::Status => {
                head.send_or_arrive_time = Some(self.arrive);
                self.reply = now_ns();
                head.reply_time = Some(self.reply);
            }
            MessageType::Request
            | MessageType::SidebandRequest
            | MessageType::SubscribeRequest
            | MessageType::Broadcast => {
                self.send = now_ns();
                head.send_or_arrive_time = Some(self.send);
            }
            _ => {}
        }
    }

    /// Absorb stamps from an incoming frame's header, adding the local
    /// clock for the edge just crossed.
    pub(crate) fn decode_from(&mut self, head: &MessageHead, msg_type: MessageType) {
        match msg_type {
            MessageType::Reply | MessageType::SidebandReply | MessageType::Status => {
                if let Some(t) = head.send_or_arrive_time {
                    self.arrive = t;
                }
                if let Some(t) = head.reply_time {
                    self.reply = t;
                }
                self.receive = now_ns();
            }
            MessageType::Request
            | MessageType::SidebandRequest
            | MessageType::SubscribeRequest
            | MessageType::Broadcast => {
                self.arrive = now_ns();
                if let Some(t) = head.send_or_arrive_time {
                    self.send = t;
                }
            }
            _ => {}
        }
    }

    /// Derived durations; each is zero when either bound is unset.
    pub fn latency(&self) -> Latency {
        Latency {
            client_to_server: interval(self.send, self.arrive),
            server_to_reply: interval(self.arrive, self.reply),
            reply_to_client: interval(self.reply, self.receive),
            total: interval(self.send, self.receive),
        }
    }
}
