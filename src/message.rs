//! The message object: per-message state, flags, buffer ownership, and the
//! public submit/reply verbs.
//!
//! A message owns one contiguous buffer laid out as
//! `[reserved headroom][payload][extra]`. Payload is written first; the
//! header and prefix are encoded backwards into the headroom so the frame
//! can be sent without moving payload bytes. Frames received off the wire
//! adopt their buffer verbatim (offset zero) and are marked external for
//! accounting; both provenances release through the same drop.
//!
//! Messages travel between workers as [`MsgRef`], a shared handle carrying
//! a completion primitive. Synchronous submitters block on it; everything
//! else completes through a callback or not at all.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;

use crate::codec::MsgPackCodec;
use crate::context::BusContext;
use crate::error::{BusError, Result};
use crate::logger::{render_payload, MessageLogger};
use crate::protocol::{
    flags, is_valid_id, status, Encoding, EndpointId, MessageHead, MessageType, MsgCode, MsgSerial,
    ObjectId, Prefix, RawFrame, SessionId, StatusInfo, CODE_SUBSCRIBE, CODE_UNSUBSCRIBE,
    CODE_UPDATE, INVALID_ID, MAX_RESERVED_SIZE, PREFIX_SIZE,
};
use crate::timer::MessageTimer;
use crate::timing::DebugStamps;

/// Submit mode: caller blocks on the completion primitive.
const TX_SYNC: u32 = 1 << 0;
/// Submit mode: fire-and-forget, no reply machinery.
const TX_NO_REPLY: u32 = 1 << 1;

/// Description used by receiver-side auto-replies.
pub(crate) const AUTO_REPLY_DESCRIPTION: &str = "Automatically reply to request.";

/// How the waiting side learns the outcome.
pub(crate) enum Completion {
    None,
    /// A blocked submitter waits on the handle's notify.
    Sync,
    /// Invoked once on the context worker with the completed message.
    Callback(Box<dyn FnOnce(&MsgRef) + Send>),
}

/// A single bus message.
pub struct Message {
    msg_type: MessageType,
    code: MsgCode,
    sn: MsgSerial,
    payload_size: usize,
    head_size: usize,
    offset: usize,
    extra_size: usize,
    sid: SessionId,
    epid: EndpointId,
    oid: ObjectId,
    buffer: Option<Vec<u8>>,
    flags: u32,
    pub(crate) timer: Option<MessageTimer>,
    sender_name: String,
    filter: String,
    log_data: Option<String>,
    stamps: Option<DebugStamps>,
    pub(crate) completion: Completion,
}

impl Message {
    /// Create an empty message of the given type and code.
    pub fn new(msg_type: MessageType, code: MsgCode) -> Self {
        Self {
            msg_type,
            code,
            sn: INVALID_ID,
            payload_size: 0,
            head_size: 0,
            offset: 0,
            extra_size: 0,
            sid: INVALID_ID,
            epid: INVALID_ID,
            oid: INVALID_ID,
            buffer: None,
            flags: Encoding::MsgPack.to_flag_bits(),
            timer: None,
            sender_name: String::new(),
            filter: String::new(),
            log_data: None,
            stamps: None,
            completion: Completion::None,
        }
    }

    /// Create a request message.
    pub fn request(code: MsgCode) -> Self {
        Self::new(MessageType::Request, code)
    }

    /// Arm the timing overlay; the header will carry timestamps.
    pub fn with_debug(mut self) -> Self {
        self.flags |= flags::DEBUG;
        self.stamps = Some(DebugStamps::default());
        self
    }

    /// Derive a broadcast from an existing message, sharing its serial,
    /// routing, sender identity, and debug/telemetry flags.
    pub(crate) fn derive_broadcast(code: MsgCode, filter: &str, src: &Message) -> Self {
        let mut msg = Self::new(MessageType::Broadcast, code);
        msg.sn = src.sn;
        msg.sid = src.sid;
        msg.oid = src.oid;
        msg.sender_name = src.sender_name.clone();
        msg.filter = filter.to_string();
        msg.flags |= src.flags & (flags::ENABLE_LOG | flags::MANUAL_UPDATE | flags::DEBUG);
        if flags::has(msg.flags, flags::DEBUG) {
            msg.stamps = Some(DebugStamps::default());
        }
        msg
    }

    /// Build an endpoint-wide broadcast routed lazily through the
    /// endpoint's subscription table.
    pub(crate) fn endpoint_broadcast(
        code: MsgCode,
        filter: &str,
        epid: EndpointId,
        oid: ObjectId,
    ) -> Self {
        let mut msg = Self::new(MessageType::Broadcast, code);
        msg.epid = epid;
        msg.oid = oid;
        msg.filter = filter.to_string();
        msg.flags |= flags::ENDPOINT;
        msg
    }

    /// Parse a frame read off the wire into a message owning the frame
    /// buffer, marked external.
    pub(crate) fn from_wire(frame: &RawFrame, sid: SessionId) -> Result<Self> {
        let head_len = frame.prefix.head_length as usize;
        if frame.bytes.len() < PREFIX_SIZE + head_len {
            return Err(BusError::Protocol(format!(
                "frame of {} bytes cannot hold a {}-byte header",
                frame.bytes.len(),
                head_len
            )));
        }
        let head = MessageHead::decode(&frame.bytes[PREFIX_SIZE..PREFIX_SIZE + head_len])?;
        Ok(Self::from_parts(head, frame.prefix, frame.bytes.to_vec(), sid))
    }

    fn from_parts(head: MessageHead, prefix: Prefix, buffer: Vec<u8>, sid: SessionId) -> Self {
        let msg_type = MessageType::from_wire(head.msg_type);
        let head_size = prefix.head_length as usize;
        let payload_size = head.payload_size as usize;

        let mut extra_size = prefix.total_length as i64
            - PREFIX_SIZE as i64
            - head_size as i64
            - payload_size as i64;
        if extra_size < 0 {
            tracing::warn!(
                "negative extra size clamped to zero: total={} head={} payload={}",
                prefix.total_length,
                head_size,
                payload_size
            );
            extra_size = 0;
        }

        let stamps = if flags::has(head.flag, flags::DEBUG) {
            let mut stamps = DebugStamps::default();
            stamps.decode_from(&head, msg_type);
            Some(stamps)
        } else {
            None
        };

        Self {
            msg_type,
            code: head.code,
            sn: head.serial_number,
            payload_size,
            head_size,
            offset: 0,
            extra_size: extra_size as usize,
            sid,
            epid: INVALID_ID,
            oid: head.object_id,
            buffer: Some(buffer),
            flags: (head.flag & flags::GLOBAL_MASK) | flags::EXTERNAL_BUFFER | flags::HEAD_OK,
            timer: None,
            sender_name: head.sender_name.unwrap_or_default(),
            filter: head.broadcast_filter.unwrap_or_default(),
            log_data: None,
            stamps,
            completion: Completion::None,
        }
    }

    // --- accessors -------------------------------------------------------

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub(crate) fn set_type(&mut self, msg_type: MessageType) {
        self.msg_type = msg_type;
    }

    pub fn code(&self) -> MsgCode {
        self.code
    }

    pub(crate) fn set_code(&mut self, code: MsgCode) {
        self.code = code;
    }

    pub fn sn(&self) -> MsgSerial {
        self.sn
    }

    pub(crate) fn set_sn(&mut self, sn: MsgSerial) {
        self.sn = sn;
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub(crate) fn set_sid(&mut self, sid: SessionId) {
        self.sid = sid;
    }

    pub fn epid(&self) -> EndpointId {
        self.epid
    }

    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        flags::has(self.flags, flag)
    }

    pub(crate) fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub(crate) fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::from_flags(self.flags)
    }

    fn set_encoding(&mut self, encoding: Encoding) {
        self.flags = (self.flags & !flags::ENCODING_MASK) | encoding.to_flag_bits();
    }

    pub fn is_error(&self) -> bool {
        self.has_flag(flags::ERROR)
    }

    pub fn is_status(&self) -> bool {
        self.has_flag(flags::STATUS)
    }

    /// True for a subscribe-request carrying the subscription code.
    pub fn is_subscribe(&self) -> bool {
        self.msg_type == MessageType::SubscribeRequest && self.code == CODE_SUBSCRIBE
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn set_sender_name(&mut self, name: &str) {
        self.sender_name = name.to_string();
    }

    /// Broadcast filter (empty for non-broadcasts).
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn log_data(&self) -> Option<&str> {
        self.log_data.as_deref()
    }

    /// Attach pre-rendered telemetry text and arm the telemetry flag.
    pub fn set_log_data(&mut self, log_data: &str) {
        self.log_data = Some(log_data.to_string());
        self.flags |= flags::ENABLE_LOG;
    }

    pub fn stamps(&self) -> Option<&DebugStamps> {
        self.stamps.as_ref()
    }

    pub(crate) fn stamps_mut(&mut self) -> Option<&mut DebugStamps> {
        self.stamps.as_mut()
    }

    pub(crate) fn take_timer(&mut self) -> Option<MessageTimer> {
        self.timer.take()
    }

    pub(crate) fn take_completion(&mut self) -> Completion {
        std::mem::replace(&mut self.completion, Completion::None)
    }

    // --- destination -----------------------------------------------------

    /// Resolve the routing target: an explicit alternative session wins,
    /// then the object's default session, and with neither known the
    /// message routes lazily through the endpoint's preferred peer.
    pub fn set_destination(
        &mut self,
        oid: ObjectId,
        epid: EndpointId,
        default_sid: SessionId,
        alt_sid: SessionId,
    ) {
        if is_valid_id(alt_sid) {
            self.sid = alt_sid;
            self.clear_flag(flags::ENDPOINT);
        } else if is_valid_id(default_sid) {
            self.sid = default_sid;
            self.clear_flag(flags::ENDPOINT);
        } else {
            self.epid = epid;
            self.set_flag(flags::ENDPOINT);
        }
        self.oid = oid;
    }

    // --- buffer & payload ------------------------------------------------

    fn payload_start(&self) -> usize {
        self.offset + PREFIX_SIZE + self.head_size
    }

    /// Payload bytes; empty before any payload has been set.
    pub fn payload(&self) -> &[u8] {
        match &self.buffer {
            Some(buf) => {
                let start = self.payload_start();
                &buf[start..start + self.payload_size]
            }
            None => &[],
        }
    }

    /// Sideband bytes trailing the payload.
    pub fn extra(&self) -> &[u8] {
        match &self.buffer {
            Some(buf) => {
                let start = self.payload_start() + self.payload_size;
                &buf[start..start + self.extra_size]
            }
            None => &[],
        }
    }

    fn extra_mut(&mut self) -> &mut [u8] {
        let start = self.payload_start() + self.payload_size;
        let extra_size = self.extra_size;
        match &mut self.buffer {
            Some(buf) => &mut buf[start..start + extra_size],
            None => &mut [],
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn extra_size(&self) -> usize {
        self.extra_size
    }

    pub(crate) fn set_extra_size(&mut self, extra_size: usize) {
        self.extra_size = extra_size;
    }

    /// Allocate a fresh owned buffer with headroom and install the payload.
    /// Invalidates any previously encoded header.
    fn alloc_buffer(&mut self, payload: &[u8]) {
        let total = MAX_RESERVED_SIZE + payload.len() + self.extra_size;
        let mut buffer = vec![0u8; total];
        buffer[MAX_RESERVED_SIZE..MAX_RESERVED_SIZE + payload.len()].copy_from_slice(payload);
        self.buffer = Some(buffer);
        self.payload_size = payload.len();
        self.head_size = 0;
        self.offset = MAX_RESERVED_SIZE - PREFIX_SIZE;
        self.clear_flag(flags::HEAD_OK);
    }

    /// Serialize a structured payload into a fresh owned buffer. When the
    /// telemetry gate opens, the payload is also rendered to text.
    pub fn set_payload<T: Serialize>(
        &mut self,
        data: &T,
        logger: Option<&dyn MessageLogger>,
    ) -> Result<()> {
        let bytes = MsgPackCodec::encode(data)?;
        self.set_encoding(Encoding::MsgPack);
        self.clear_flag(flags::EXTERNAL_BUFFER);
        self.alloc_buffer(&bytes);

        if let Some(logger) = logger {
            if !self.has_flag(flags::ENABLE_LOG)
                && logger.enabled(self.msg_type, self.code, self.epid)
            {
                self.set_flag(flags::ENABLE_LOG);
            }
        }
        if self.has_flag(flags::ENABLE_LOG) {
            self.log_data = render_payload(data);
        }
        Ok(())
    }

    /// Install an opaque byte payload, copied from the caller's buffer.
    pub fn set_payload_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_encoding(Encoding::Raw);
        self.alloc_buffer(bytes);
        self.set_flag(flags::EXTERNAL_BUFFER);
        Ok(())
    }

    /// Decode a structured payload.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        if self.buffer.is_none() {
            return Err(BusError::InvalidOp("message has no payload".into()));
        }
        if self.encoding() != Encoding::MsgPack {
            return Err(BusError::InvalidOp(
                "payload is not structured-encoded".into(),
            ));
        }
        MsgPackCodec::decode(self.payload())
    }

    /// Decode a status payload (code + description).
    pub fn decode_status(&self) -> Result<StatusInfo> {
        if !self.is_status() {
            return Err(BusError::InvalidOp("message is not a status".into()));
        }
        self.decode_payload()
    }

    /// Swap in a new backing buffer, releasing the old one.
    pub(crate) fn replace_buffer(
        &mut self,
        buffer: Vec<u8>,
        payload_size: usize,
        head_size: usize,
        offset: usize,
    ) {
        self.buffer = Some(buffer);
        self.payload_size = payload_size;
        self.head_size = head_size;
        self.offset = offset;
    }

    // --- framing ---------------------------------------------------------

    /// Encode prefix and header into the buffer headroom. Idempotent once
    /// it has succeeded.
    pub(crate) fn build_head(&mut self, endpoint_name: &str) -> Result<()> {
        if self.has_flag(flags::HEAD_OK) {
            return Ok(());
        }
        if self.buffer.is_none() {
            // A message sent without payload still needs a frame.
            self.alloc_buffer(&[]);
        }

        let mut head = MessageHead {
            msg_type: self.msg_type.to_wire(),
            serial_number: self.sn,
            code: self.code,
            flag: self.flags & flags::GLOBAL_MASK,
            object_id: self.oid,
            payload_size: self.payload_size as u32,
            sender_name: None,
            broadcast_filter: None,
            send_or_arrive_time: None,
            reply_time: None,
        };

        if let Some(stamps) = self.stamps.as_mut() {
            stamps.encode_into(&mut head, self.msg_type);
        }

        head.sender_name = Some(if self.sender_name.is_empty() {
            endpoint_name.to_string()
        } else {
            self.sender_name.clone()
        });

        if self.msg_type == MessageType::Broadcast && !self.filter.is_empty() {
            head.broadcast_filter = Some(self.filter.clone());
        }

        let encoded = head.encode()?;
        let head_size = encoded.len();
        let head_offset = MAX_RESERVED_SIZE - head_size;
        let prefix_offset = head_offset - PREFIX_SIZE;

        let total_length = (PREFIX_SIZE + head_size + self.payload_size + self.extra_size) as u32;
        let prefix = Prefix::new(total_length, head_size as u32);

        let buffer = match self.buffer.as_mut() {
            Some(buf) => buf,
            None => return Err(BusError::InvalidOp("message has no buffer".into())),
        };
        buffer[head_offset..MAX_RESERVED_SIZE].copy_from_slice(&encoded);
        prefix.encode_into(&mut buffer[prefix_offset..]);

        self.head_size = head_size;
        self.offset = prefix_offset;
        self.set_flag(flags::HEAD_OK);
        Ok(())
    }

    /// Encode this message into a standalone frame, as a telemetry tap
    /// would capture it. The sender name is used when the message carries
    /// none.
    pub fn encode_frame(&mut self, sender_name: &str) -> Result<Vec<u8>> {
        self.build_head(sender_name)?;
        Ok(self.frame_bytes().to_vec())
    }

    /// The encoded frame: prefix ++ header ++ payload ++ extra.
    ///
    /// Empty until `build_head` has run (or the buffer came off the wire).
    pub(crate) fn frame_bytes(&self) -> &[u8] {
        if !self.has_flag(flags::HEAD_OK) {
            return &[];
        }
        match &self.buffer {
            Some(buf) => {
                let total =
                    PREFIX_SIZE + self.head_size + self.payload_size + self.extra_size;
                &buf[self.offset..self.offset + total]
            }
            None => &[],
        }
    }

    // --- status & reply bookkeeping --------------------------------------

    /// Rewrite the message as a status carrier. Codes outside the
    /// informational range mark the error bit. Sets the replied flag.
    pub(crate) fn set_error_msg(
        &mut self,
        msg_type: Option<MessageType>,
        code: i32,
        description: &str,
    ) {
        if let Some(t) = msg_type {
            self.msg_type = t;
        }
        if status::is_error(code) {
            self.set_flag(flags::ERROR);
        }
        self.set_flag(flags::STATUS | flags::REPLIED);
        self.extra_size = 0;

        let info = StatusInfo {
            code,
            description: description.to_string(),
        };
        if let Err(e) = self.set_payload(&info, None) {
            tracing::error!("unable to encode status payload: {}", e);
        }
    }

    /// Absorb a matched reply into this waiting request: adopt its buffer,
    /// type, and wire flags, and merge the reply-side timestamps.
    pub(crate) fn absorb_reply(&mut self, mut incoming: Message) {
        self.msg_type = incoming.msg_type;
        self.flags = (self.flags & !flags::GLOBAL_MASK)
            | (incoming.flags & flags::GLOBAL_MASK)
            | flags::REPLIED
            | flags::EXTERNAL_BUFFER
            | flags::HEAD_OK;

        let buffer = incoming.buffer.take().unwrap_or_default();
        self.extra_size = incoming.extra_size;
        self.replace_buffer(
            buffer,
            incoming.payload_size,
            incoming.head_size,
            incoming.offset,
        );

        if !incoming.sender_name.is_empty() {
            self.sender_name = incoming.sender_name.clone();
        }
        if let (Some(mine), Some(theirs)) = (self.stamps.as_mut(), incoming.stamps.as_ref()) {
            mine.arrive = theirs.arrive;
            mine.reply = theirs.reply;
            mine.receive = theirs.receive;
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type.name())
            .field("code", &self.code)
            .field("sn", &self.sn)
            .field("sid", &self.sid)
            .field("oid", &self.oid)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("payload_size", &self.payload_size)
            .field("extra_size", &self.extra_size)
            .finish()
    }
}

/// Shared message handle: the message plus its completion primitive.
pub struct MsgHandle {
    inner: Mutex<Message>,
    done: Notify,
}

/// Refcounted message reference passed between workers.
pub type MsgRef = Arc<MsgHandle>;

impl MsgHandle {
    /// Wrap a message into a shared reference.
    pub fn new(msg: Message) -> MsgRef {
        Arc::new(Self {
            inner: Mutex::new(msg),
            done: Notify::new(),
        })
    }

    /// Lock the message state.
    pub fn lock(&self) -> MutexGuard<'_, Message> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake a blocked synchronous submitter.
    pub(crate) fn signal(&self) {
        self.done.notify_one();
    }

    /// Wait until the message completes (reply, status, or timeout).
    pub async fn wait(&self) {
        self.done.notified().await;
    }

    /// Run the message's completion path: wake the sync waiter or invoke
    /// the async callback.
    pub(crate) fn complete(msg_ref: &MsgRef) {
        let completion = msg_ref.lock().take_completion();
        match completion {
            Completion::Sync => msg_ref.signal(),
            Completion::Callback(f) => f(msg_ref),
            Completion::None => {}
        }
    }

    // --- submit ----------------------------------------------------------

    pub(crate) fn submit(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        tx_flags: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let sync = tx_flags & TX_SYNC != 0;
        if sync && ctx.is_self() {
            return Err(BusError::InvalidOp(
                "cannot submit synchronously from the context worker".into(),
            ));
        }

        {
            let mut m = msg_ref.lock();
            if tx_flags & TX_NO_REPLY != 0 {
                m.set_flag(flags::NOREPLY_EXPECTED);
            } else {
                m.set_flag(flags::AUTO_REPLY);
                if sync {
                    m.set_flag(flags::SYNC_REPLY);
                    m.completion = Completion::Sync;
                }
                if let Some(interval) = timeout {
                    m.timer = Some(MessageTimer::new(interval));
                }
            }
        }

        ctx.send_async(msg_ref.clone())
    }

    /// Send a request expecting a reply; completion is observed through
    /// `invoke_with`'s callback or by inspecting the message later.
    pub fn invoke(msg_ref: &MsgRef, ctx: &BusContext, timeout: Option<Duration>) -> Result<()> {
        msg_ref.lock().set_type(MessageType::Request);
        Self::submit(msg_ref, ctx, 0, timeout)
    }

    /// Send a request and block the caller until reply, status, or
    /// timeout. Refused with `InvalidOp` on the context worker.
    pub async fn invoke_sync(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        timeout: Option<Duration>,
    ) -> Result<()> {
        msg_ref.lock().set_type(MessageType::Request);
        Self::submit(msg_ref, ctx, TX_SYNC, timeout)?;
        msg_ref.wait().await;
        Ok(())
    }

    /// Send a request; the callback runs once on the context worker when
    /// the reply, status, or timeout lands.
    pub fn invoke_with(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        timeout: Option<Duration>,
        on_complete: impl FnOnce(&MsgRef) + Send + 'static,
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::Request);
            m.completion = Completion::Callback(Box::new(on_complete));
        }
        Self::submit(msg_ref, ctx, 0, timeout)
    }

    /// Fire-and-forget request: no serial, no timer, no reply ever.
    pub fn send(msg_ref: &MsgRef, ctx: &BusContext) -> Result<()> {
        msg_ref.lock().set_type(MessageType::Request);
        Self::submit(msg_ref, ctx, TX_NO_REPLY, None)
    }

    // --- sideband --------------------------------------------------------

    /// `invoke` on the control plane; application observers never see it.
    pub fn invoke_sideband(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        timeout: Option<Duration>,
    ) -> Result<()> {
        msg_ref.lock().set_type(MessageType::SidebandRequest);
        Self::submit(msg_ref, ctx, 0, timeout)
    }

    /// Blocking sideband invoke.
    pub async fn invoke_sideband_sync(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        timeout: Option<Duration>,
    ) -> Result<()> {
        msg_ref.lock().set_type(MessageType::SidebandRequest);
        Self::submit(msg_ref, ctx, TX_SYNC, timeout)?;
        msg_ref.wait().await;
        Ok(())
    }

    /// Fire-and-forget sideband request.
    pub fn send_sideband(msg_ref: &MsgRef, ctx: &BusContext) -> Result<()> {
        msg_ref.lock().set_type(MessageType::SidebandRequest);
        Self::submit(msg_ref, ctx, TX_NO_REPLY, None)
    }

    // --- reply & status --------------------------------------------------

    fn feedback<T: Serialize>(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        data: &T,
        msg_type: MessageType,
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            if m.has_flag(flags::NOREPLY_EXPECTED) {
                return Err(BusError::InvalidOp(
                    "reply to a message that expects none".into(),
                ));
            }
            if m.has_flag(flags::REPLIED) {
                return Err(BusError::InvalidOp("message already replied".into()));
            }
            m.set_payload(data, Some(ctx.logger().as_ref()))?;
            m.set_type(msg_type);
            m.set_flag(flags::REPLIED);
        }
        if !ctx.send_async_endeavor(msg_ref) {
            msg_ref.lock().clear_flag(flags::REPLIED);
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }

    /// Attach a payload and dispatch it as the reply to this request.
    pub fn reply<T: Serialize>(msg_ref: &MsgRef, ctx: &BusContext, data: &T) -> Result<()> {
        Self::feedback(msg_ref, ctx, data, MessageType::Reply)
    }

    /// Reply with opaque bytes, with optional pre-rendered telemetry text.
    pub fn reply_raw(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        data: &[u8],
        log_data: Option<&str>,
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            if m.has_flag(flags::NOREPLY_EXPECTED) {
                return Err(BusError::InvalidOp(
                    "reply to a message that expects none".into(),
                ));
            }
            if m.has_flag(flags::REPLIED) {
                return Err(BusError::InvalidOp("message already replied".into()));
            }
            m.set_payload_raw(data)?;
            if let Some(text) = log_data {
                m.set_log_data(text);
            }
            m.set_type(MessageType::Reply);
            m.set_flag(flags::REPLIED);
        }
        if !ctx.send_async_endeavor(msg_ref) {
            msg_ref.lock().clear_flag(flags::REPLIED);
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }

    /// Sideband reply: the reply arm of the control plane.
    pub fn reply_sideband<T: Serialize>(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        data: &T,
    ) -> Result<()> {
        Self::feedback(msg_ref, ctx, data, MessageType::SidebandReply)
    }

    /// Dispatch a status frame answering this request.
    pub fn status(msg_ref: &MsgRef, ctx: &BusContext, code: i32, description: &str) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            if m.has_flag(flags::NOREPLY_EXPECTED) {
                return Err(BusError::InvalidOp(
                    "status to a message that expects none".into(),
                ));
            }
            if m.has_flag(flags::REPLIED) {
                return Err(BusError::InvalidOp("message already replied".into()));
            }
            m.set_error_msg(Some(MessageType::Status), code, description);
        }
        if !ctx.send_async_endeavor(msg_ref) {
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }

    /// Last-holder-drop hook: when this is the only live reference to an
    /// unreplied auto-reply request, emit a terminal status.
    pub fn auto_reply(msg_ref: &MsgRef, ctx: &BusContext, code: i32, description: &str) {
        if Arc::strong_count(msg_ref) != 1 {
            return;
        }
        {
            let mut m = msg_ref.lock();
            if m.flags() & (flags::AUTO_REPLY | flags::REPLIED) != flags::AUTO_REPLY
                || m.has_flag(flags::NOREPLY_EXPECTED)
            {
                return;
            }
            m.set_error_msg(Some(MessageType::Status), code, description);
        }
        ctx.send_async_endeavor(msg_ref);
    }

    // --- broadcast -------------------------------------------------------

    /// Construct a broadcast derived from this message and dispatch it.
    /// Derived broadcasts keep the source serial and debug flags; from a
    /// just-received request this produces the session-scoped
    /// initial-response path.
    pub fn broadcast<T: Serialize>(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        code: MsgCode,
        filter: &str,
        data: &T,
    ) -> Result<()> {
        let mut msg = {
            let m = msg_ref.lock();
            Message::derive_broadcast(code, filter, &m)
        };
        msg.set_payload(data, Some(ctx.logger().as_ref()))?;
        let bref = MsgHandle::new(msg);
        if !ctx.send_async_endeavor(&bref) {
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }

    // --- subscription ----------------------------------------------------

    /// Register the subscription items carried in the payload.
    pub fn subscribe(msg_ref: &MsgRef, ctx: &BusContext, timeout: Option<Duration>) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::SubscribeRequest);
            m.set_code(CODE_SUBSCRIBE);
        }
        Self::submit(msg_ref, ctx, 0, timeout)
    }

    /// Blocking subscribe.
    pub async fn subscribe_sync(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        timeout: Option<Duration>,
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::SubscribeRequest);
            m.set_code(CODE_SUBSCRIBE);
        }
        Self::submit(msg_ref, ctx, TX_SYNC, timeout)?;
        msg_ref.wait().await;
        Ok(())
    }

    /// Drop the subscription items carried in the payload.
    pub fn unsubscribe(msg_ref: &MsgRef, ctx: &BusContext) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::SubscribeRequest);
            m.set_code(CODE_UNSUBSCRIBE);
        }
        Self::submit(msg_ref, ctx, TX_NO_REPLY, None)
    }

    /// Request a one-shot broadcast of the items in the payload without
    /// touching subscription state.
    pub fn update(msg_ref: &MsgRef, ctx: &BusContext, timeout: Option<Duration>) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::SubscribeRequest);
            m.set_code(CODE_UPDATE);
        }
        Self::submit(msg_ref, ctx, 0, timeout)
    }

    // --- log tunnel ------------------------------------------------------

    /// Forward a pre-encoded frame in the extra region to the telemetry
    /// tap, optionally clipping the embedded payload. Fire-and-forget.
    pub fn send_log<T: Serialize>(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        data: &T,
        log_frame: &[u8],
        clipped_size: i32,
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_flag(flags::NOREPLY_EXPECTED);
            m.clear_flag(flags::ENABLE_LOG);
            m.set_type(MessageType::Request);

            let extra = clip_log_frame(log_frame, clipped_size)?;
            m.set_extra_size(extra.len());
            m.set_payload(data, None)?;
            m.extra_mut().copy_from_slice(&extra);
        }
        ctx.send_async(msg_ref.clone())
    }

    /// Broadcast with a pre-encoded frame riding in the extra region.
    pub fn broadcast_log<T: Serialize>(
        msg_ref: &MsgRef,
        ctx: &BusContext,
        data: &T,
        log_frame: &[u8],
    ) -> Result<()> {
        {
            let mut m = msg_ref.lock();
            m.set_type(MessageType::Broadcast);
            m.clear_flag(flags::ENABLE_LOG);
            m.set_extra_size(log_frame.len());
            m.set_payload(data, None)?;
            m.extra_mut().copy_from_slice(log_frame);
        }
        if !ctx.send_async_endeavor(msg_ref) {
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Prepare the extra-region copy of an embedded frame, rewriting its
/// prefix when the payload is clipped.
///
/// `clipped_size < 0` keeps the frame whole; `0` keeps header only; a
/// positive value smaller than the embedded payload truncates it.
pub(crate) fn clip_log_frame(log_frame: &[u8], clipped_size: i32) -> Result<Vec<u8>> {
    let prefix = Prefix::decode(log_frame)
        .ok_or_else(|| BusError::Protocol("embedded log frame too short".into()))?;
    if clipped_size < 0 {
        return Ok(log_frame.to_vec());
    }

    let head_len = prefix.head_length as usize;
    let base = PREFIX_SIZE + head_len;
    let embedded_payload = (prefix.total_length as usize)
        .checked_sub(base)
        .ok_or_else(|| BusError::Protocol("embedded log frame prefix inconsistent".into()))?;

    let clipped = clipped_size as usize;
    if clipped >= embedded_payload {
        return Ok(log_frame.to_vec());
    }

    let new_total = base + clipped;
    let mut out = log_frame[..new_total.min(log_frame.len())].to_vec();
    Prefix::new(new_total as u32, prefix.head_length).encode_into(&mut out);
    Ok(out)
}

/// Parse a tunneled frame back into a message, clamping the payload when
/// the frame was clipped below its recorded payload size.
pub fn parse_log_frame(buffer: &[u8]) -> Result<Message> {
    let prefix = Prefix::decode(buffer)
        .ok_or_else(|| BusError::Protocol("log frame too short for prefix".into()))?;
    let total = prefix.total_length as usize;
    let head_len = prefix.head_length as usize;
    if buffer.len() < total || total < PREFIX_SIZE + head_len {
        return Err(BusError::Protocol("log frame prefix inconsistent".into()));
    }

    let mut head = MessageHead::decode(&buffer[PREFIX_SIZE..PREFIX_SIZE + head_len])?;

    let mut payload_size = head.payload_size as i64;
    let extra = total as i64 - PREFIX_SIZE as i64 - head_len as i64 - payload_size;
    if extra < 0 {
        payload_size += extra;
        if payload_size < 0 {
            return Err(BusError::Protocol(
                "log frame clipped below its header".into(),
            ));
        }
        head.payload_size = payload_size as u32;
    }

    Ok(Message::from_parts(
        head,
        prefix,
        buffer[..total].to_vec(),
        INVALID_ID,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameDecoder, MAX_HEAD_SIZE};

    fn encoded_request(code: MsgCode, payload: &str) -> Message {
        let mut msg = Message::request(code);
        msg.set_sn(9);
        msg.set_destination(1, INVALID_ID, 5, INVALID_ID);
        msg.set_payload(&payload, None).unwrap();
        msg.build_head("tester").unwrap();
        msg
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = encoded_request(100, "ping");
        let frame_bytes = msg.frame_bytes().to_vec();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&frame_bytes).unwrap();
        assert_eq!(frames.len(), 1);

        let decoded = Message::from_wire(&frames[0], 5).unwrap();
        assert_eq!(decoded.msg_type(), msg.msg_type());
        assert_eq!(decoded.code(), msg.code());
        assert_eq!(decoded.sn(), msg.sn());
        assert_eq!(decoded.oid(), msg.oid());
        assert_eq!(decoded.payload(), msg.payload());
        assert_eq!(decoded.sender_name(), "tester");
        assert_eq!(decoded.decode_payload::<String>().unwrap(), "ping");

        // Transient flags aside, the wire flags match.
        let transient = flags::HEAD_OK | flags::EXTERNAL_BUFFER;
        assert_eq!(
            decoded.flags() & !transient,
            msg.flags() & flags::GLOBAL_MASK
        );
    }

    #[test]
    fn test_prefix_total_equals_sum_of_regions() {
        let msg = encoded_request(1, "payload-bytes");
        let frame = msg.frame_bytes();
        let prefix = Prefix::decode(frame).unwrap();

        assert_eq!(prefix.total_length as usize, frame.len());
        assert_eq!(
            prefix.total_length as usize,
            PREFIX_SIZE + prefix.head_length as usize + msg.payload_size() + msg.extra_size()
        );
    }

    #[test]
    fn test_build_head_is_idempotent() {
        let mut msg = Message::request(7);
        msg.set_payload(&"x", None).unwrap();
        msg.build_head("first").unwrap();
        let frame1 = msg.frame_bytes().to_vec();

        // A second build must not re-encode with a different sender.
        msg.build_head("second").unwrap();
        assert_eq!(msg.frame_bytes(), &frame1[..]);
    }

    #[test]
    fn test_build_head_fills_sender_name_when_empty() {
        let mut msg = Message::request(7);
        msg.set_payload(&"x", None).unwrap();
        msg.build_head("session-endpoint").unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(msg.frame_bytes()).unwrap();
        let decoded = Message::from_wire(&frames[0], 0).unwrap();
        assert_eq!(decoded.sender_name(), "session-endpoint");

        let mut named = Message::request(7);
        named.set_sender_name("explicit");
        named.set_payload(&"x", None).unwrap();
        named.build_head("session-endpoint").unwrap();
        let frames = decoder.push(named.frame_bytes()).unwrap();
        let decoded = Message::from_wire(&frames[0], 0).unwrap();
        assert_eq!(decoded.sender_name(), "explicit");
    }

    #[test]
    fn test_head_too_long_fails_encode() {
        let mut msg = Message::request(7);
        msg.set_sender_name(&"x".repeat(MAX_HEAD_SIZE + 1));
        msg.set_payload(&"x", None).unwrap();
        let result = msg.build_head("tester");
        assert!(matches!(result, Err(BusError::HeadTooLong { .. })));
        assert!(!msg.has_flag(flags::HEAD_OK));
    }

    #[test]
    fn test_set_destination_resolution_order() {
        let mut msg = Message::request(1);

        // Alt session wins.
        msg.set_destination(10, 2, 5, 7);
        assert_eq!(msg.sid(), 7);
        assert!(!msg.has_flag(flags::ENDPOINT));

        // Default session next.
        let mut msg = Message::request(1);
        msg.set_destination(10, 2, 5, INVALID_ID);
        assert_eq!(msg.sid(), 5);
        assert!(!msg.has_flag(flags::ENDPOINT));

        // Lazy endpoint route when neither is known.
        let mut msg = Message::request(1);
        msg.set_destination(10, 2, INVALID_ID, INVALID_ID);
        assert_eq!(msg.epid(), 2);
        assert!(msg.has_flag(flags::ENDPOINT));
        assert_eq!(msg.oid(), 10);
    }

    #[test]
    fn test_set_error_msg_range_convention() {
        let mut msg = Message::request(1);
        msg.set_error_msg(Some(MessageType::Status), status::ST_AUTO_REPLY_OK, "done");
        assert!(msg.is_status());
        assert!(!msg.is_error());
        assert!(msg.has_flag(flags::REPLIED));
        let info = msg.decode_status().unwrap();
        assert_eq!(info.code, status::ST_AUTO_REPLY_OK);
        assert_eq!(info.description, "done");

        let mut msg = Message::request(1);
        msg.set_error_msg(Some(MessageType::Status), status::ST_TIMEOUT, "late");
        assert!(msg.is_error());
    }

    #[test]
    fn test_raw_payload_marks_provenance() {
        let mut msg = Message::request(1);
        msg.set_payload_raw(b"\x01\x02\x03").unwrap();
        assert_eq!(msg.encoding(), Encoding::Raw);
        assert!(msg.has_flag(flags::EXTERNAL_BUFFER));
        assert_eq!(msg.payload(), b"\x01\x02\x03");
        assert!(msg.decode_payload::<String>().is_err());
    }

    #[test]
    fn test_derive_broadcast_shares_serial_and_debug() {
        let mut src = Message::request(100).with_debug();
        src.set_sn(42);
        src.set_sid(3);
        src.set_flag(flags::MANUAL_UPDATE);

        let b = Message::derive_broadcast(400, "topic", &src);
        assert_eq!(b.msg_type(), MessageType::Broadcast);
        assert_eq!(b.sn(), 42);
        assert_eq!(b.sid(), 3);
        assert_eq!(b.filter(), "topic");
        assert!(b.has_flag(flags::DEBUG));
        assert!(b.has_flag(flags::MANUAL_UPDATE));
        assert!(b.stamps().is_some());
    }

    #[test]
    fn test_broadcast_filter_travels_in_header() {
        let mut msg = Message::endpoint_broadcast(400, "topic-a", 1, 2);
        msg.set_payload(&"hi", None).unwrap();
        msg.build_head("svc").unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(msg.frame_bytes()).unwrap();
        let decoded = Message::from_wire(&frames[0], 0).unwrap();
        assert_eq!(decoded.filter(), "topic-a");
        assert_eq!(decoded.msg_type(), MessageType::Broadcast);
    }

    #[test]
    fn test_absorb_reply_adopts_buffer_and_sets_replied() {
        let mut waiter = Message::request(100).with_debug();
        waiter.set_sn(5);
        waiter.stamps_mut().unwrap().send = 111;

        let mut reply = encoded_request(100, "pong");
        reply.set_type(MessageType::Reply);
        reply.stamps = Some(DebugStamps {
            send: 0,
            arrive: 222,
            reply: 333,
            receive: 444,
        });

        waiter.absorb_reply(reply);
        assert_eq!(waiter.msg_type(), MessageType::Reply);
        assert!(waiter.has_flag(flags::REPLIED));
        assert_eq!(waiter.decode_payload::<String>().unwrap(), "pong");

        let stamps = waiter.stamps().unwrap();
        assert_eq!(stamps.send, 111);
        assert_eq!(stamps.arrive, 222);
        assert_eq!(stamps.reply, 333);
        assert_eq!(stamps.receive, 444);
    }

    #[test]
    fn test_clip_log_frame_rewrites_embedded_prefix() {
        // Embedded frame with a known payload size.
        let mut inner = Message::request(200);
        inner.set_payload_raw(&vec![0xAB; 80]).unwrap();
        inner.build_head("tap").unwrap();
        let embedded = inner.frame_bytes().to_vec();
        let head_len = Prefix::decode(&embedded).unwrap().head_length;

        // Clip to 32 payload bytes.
        let clipped = clip_log_frame(&embedded, 32).unwrap();
        let prefix = Prefix::decode(&clipped).unwrap();
        assert_eq!(
            prefix.total_length as usize,
            PREFIX_SIZE + head_len as usize + 32
        );
        assert_eq!(clipped.len(), prefix.total_length as usize);

        // Clip to header only.
        let header_only = clip_log_frame(&embedded, 0).unwrap();
        let prefix = Prefix::decode(&header_only).unwrap();
        assert_eq!(
            prefix.total_length as usize,
            PREFIX_SIZE + head_len as usize
        );

        // Negative keeps the frame whole.
        let whole = clip_log_frame(&embedded, -1).unwrap();
        assert_eq!(whole, embedded);

        // Clip larger than the payload keeps the frame whole.
        let whole = clip_log_frame(&embedded, 10_000).unwrap();
        assert_eq!(whole, embedded);
    }

    #[test]
    fn test_parse_log_frame_clamps_clipped_payload() {
        let mut inner = Message::request(200);
        inner.set_payload_raw(&vec![0xCD; 64]).unwrap();
        inner.build_head("tap").unwrap();
        let embedded = inner.frame_bytes().to_vec();

        let clipped = clip_log_frame(&embedded, 16).unwrap();
        let parsed = parse_log_frame(&clipped).unwrap();
        assert_eq!(parsed.payload_size(), 16);
        assert_eq!(parsed.payload(), &vec![0xCD; 16][..]);
        assert_eq!(parsed.code(), 200);

        let whole = parse_log_frame(&embedded).unwrap();
        assert_eq!(whole.payload_size(), 64);
    }

    #[test]
    fn test_from_wire_clamps_negative_extra() {
        // Header claims more payload than the frame holds.
        let mut msg = Message::request(1);
        msg.set_payload_raw(b"abcd").unwrap();
        msg.build_head("x").unwrap();
        let mut bytes = msg.frame_bytes().to_vec();

        // Shrink total_length below prefix+head+payload.
        let prefix = Prefix::decode(&bytes).unwrap();
        let lying = Prefix::new(prefix.total_length - 2, prefix.head_length);
        lying.encode_into(&mut bytes);
        bytes.truncate(lying.total_length as usize);

        let frame = RawFrame {
            prefix: lying,
            bytes: bytes.into(),
        };
        let decoded = Message::from_wire(&frame, 0).unwrap();
        assert_eq!(decoded.extra_size(), 0);
    }

    #[test]
    fn test_type_name_is_ordinal_stable() {
        let msg = Message::new(MessageType::SidebandReply, 0);
        assert_eq!(msg.msg_type().name(), "SidebandReply");
    }
}
