//! Telemetry substrate: decides which payloads get mirrored as text and
//! where the rendered lines go.
//!
//! The bus never interprets payload text itself; rendering exists so a
//! telemetry tap can tunnel frames (see the log verbs on the message) or
//! a human can read the traffic.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::protocol::{EndpointId, MessageType, MsgCode};

/// Gate and sink for the telemetry path.
pub trait MessageLogger: Send + Sync {
    /// Whether this message's payload should be mirrored as text.
    fn enabled(&self, msg_type: MessageType, code: MsgCode, epid: EndpointId) -> bool;

    /// Consume one rendered payload line.
    fn emit(&self, msg_type: MessageType, code: MsgCode, line: &str);
}

/// Default logger forwarding rendered payloads to `tracing` at debug
/// level. Disabled until switched on.
#[derive(Default)]
pub struct TraceLogger {
    enabled: AtomicBool,
}

impl TraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }
}

impl MessageLogger for TraceLogger {
    fn enabled(&self, _msg_type: MessageType, _code: MsgCode, _epid: EndpointId) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn emit(&self, msg_type: MessageType, code: MsgCode, line: &str) {
        tracing::debug!(target: "framebus::payload", "{} code={}: {}", msg_type.name(), code, line);
    }
}

/// Render a structured payload to text for the telemetry path.
///
/// Returns `None` when the payload does not serialize; telemetry must
/// never fail the send it shadows.
pub fn render_payload<T: Serialize>(data: &T) -> Option<String> {
    serde_json::to_string(data).ok()
}
