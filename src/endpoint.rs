//! Endpoints, objects, and the broadcast selector.
//!
//! An endpoint is a named bus participant owning sessions and objects.
//! An object is a code-space partition: handlers for invokes, sideband
//! requests, subscriptions, and observed broadcasts are registered per
//! object through the builder. The endpoint also owns the subscription
//! table that routes broadcast fan-out: `(object, code, filter)` maps to
//! the sessions that asked for it, matched by exact filter string (the
//! empty filter matches only an explicitly empty subscription).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::context::BusContext;
use crate::error::{BusError, Result};
use crate::message::{Message, MsgHandle, MsgRef, AUTO_REPLY_DESCRIPTION};
use crate::protocol::{
    status, EndpointId, MsgCode, ObjectId, SessionId, SubscribeList, INVALID_ID,
};

/// Handler for an inbound request; the guard answers the peer.
pub type RequestHandler = Box<dyn FnMut(RequestGuard) + Send>;

/// Observer for an inbound broadcast.
pub type BroadcastHandler = Box<dyn FnMut(MsgRef) + Send>;

/// A code-space partition inside an endpoint.
pub(crate) struct Object {
    oid: ObjectId,
    invoke_handlers: HashMap<MsgCode, RequestHandler>,
    sideband_handlers: HashMap<MsgCode, RequestHandler>,
    subscribe_handler: Option<RequestHandler>,
    broadcast_handlers: HashMap<MsgCode, BroadcastHandler>,
}

impl Object {
    fn new(oid: ObjectId) -> Self {
        Self {
            oid,
            invoke_handlers: HashMap::new(),
            sideband_handlers: HashMap::new(),
            subscribe_handler: None,
            broadcast_handlers: HashMap::new(),
        }
    }

    pub(crate) fn oid(&self) -> ObjectId {
        self.oid
    }

    pub(crate) fn invoke_handler_mut(&mut self, code: MsgCode) -> Option<&mut RequestHandler> {
        self.invoke_handlers.get_mut(&code)
    }

    pub(crate) fn sideband_handler_mut(&mut self, code: MsgCode) -> Option<&mut RequestHandler> {
        self.sideband_handlers.get_mut(&code)
    }

    pub(crate) fn subscribe_handler_mut(&mut self) -> Option<&mut RequestHandler> {
        self.subscribe_handler.as_mut()
    }

    pub(crate) fn broadcast_handler_mut(&mut self, code: MsgCode) -> Option<&mut BroadcastHandler> {
        self.broadcast_handlers.get_mut(&code)
    }
}

/// Subscription table: `(object, code, filter)` to subscribed sessions.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<(ObjectId, MsgCode, String), BTreeSet<SessionId>>,
}

impl SubscriptionTable {
    fn subscribe(&mut self, oid: ObjectId, code: MsgCode, filter: &str, sid: SessionId) {
        self.entries
            .entry((oid, code, filter.to_string()))
            .or_default()
            .insert(sid);
    }

    fn unsubscribe(&mut self, oid: ObjectId, code: MsgCode, filter: &str, sid: SessionId) {
        let key = (oid, code, filter.to_string());
        if let Some(sessions) = self.entries.get_mut(&key) {
            sessions.remove(&sid);
            if sessions.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn remove_session(&mut self, sid: SessionId) {
        self.entries.retain(|_, sessions| {
            sessions.remove(&sid);
            !sessions.is_empty()
        });
    }

    /// Sessions registered for this code with an exactly matching filter.
    fn sessions_for(&self, oid: ObjectId, code: MsgCode, filter: &str) -> Vec<SessionId> {
        self.entries
            .get(&(oid, code, filter.to_string()))
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    fn contains(&self, oid: ObjectId, code: MsgCode, filter: &str, sid: SessionId) -> bool {
        self.entries
            .get(&(oid, code, filter.to_string()))
            .map(|sessions| sessions.contains(&sid))
            .unwrap_or(false)
    }
}

/// A named bus participant.
pub(crate) struct Endpoint {
    name: String,
    sessions: Vec<SessionId>,
    objects: HashMap<ObjectId, Object>,
    subscriptions: SubscriptionTable,
}

impl Endpoint {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn add_session(&mut self, sid: SessionId) {
        self.sessions.push(sid);
    }

    pub(crate) fn remove_session(&mut self, sid: SessionId) {
        self.sessions.retain(|&s| s != sid);
        self.subscriptions.remove_session(sid);
    }

    /// The session a lazy endpoint route materializes to.
    pub(crate) fn preferred_peer(&self) -> Option<SessionId> {
        self.sessions.first().copied()
    }

    pub(crate) fn object(&self, oid: ObjectId) -> Option<&Object> {
        self.objects.get(&oid)
    }

    pub(crate) fn object_mut(&mut self, oid: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&oid)
    }

    pub(crate) fn subscribe(&mut self, oid: ObjectId, code: MsgCode, filter: &str, sid: SessionId) {
        if self.objects.contains_key(&oid) {
            self.subscriptions.subscribe(oid, code, filter, sid);
        } else {
            tracing::warn!("subscription for unknown object {} ignored", oid);
        }
    }

    pub(crate) fn unsubscribe(
        &mut self,
        oid: ObjectId,
        code: MsgCode,
        filter: &str,
        sid: SessionId,
    ) {
        self.subscriptions.unsubscribe(oid, code, filter, sid);
    }

    pub(crate) fn subscribers(&self, oid: ObjectId, code: MsgCode, filter: &str) -> Vec<SessionId> {
        self.subscriptions.sessions_for(oid, code, filter)
    }

    pub(crate) fn is_subscribed(
        &self,
        oid: ObjectId,
        code: MsgCode,
        filter: &str,
        sid: SessionId,
    ) -> bool {
        self.subscriptions.contains(oid, code, filter, sid)
    }
}

/// Builder for an endpoint and its objects.
pub struct EndpointBuilder {
    name: String,
    objects: Vec<ObjectBuilder>,
}

impl EndpointBuilder {
    /// Start building an endpoint with a printable identity.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Vec::new(),
        }
    }

    /// Add an object with its handlers.
    pub fn object(mut self, object: ObjectBuilder) -> Self {
        self.objects.push(object);
        self
    }

    pub(crate) fn build(self) -> Endpoint {
        let mut objects = HashMap::new();
        for builder in self.objects {
            let object = builder.build();
            objects.insert(object.oid(), object);
        }
        Endpoint {
            name: self.name,
            sessions: Vec::new(),
            objects,
            subscriptions: SubscriptionTable::default(),
        }
    }
}

/// Builder for one object's handler registrations.
pub struct ObjectBuilder {
    oid: ObjectId,
    invoke_handlers: Vec<(MsgCode, RequestHandler)>,
    sideband_handlers: Vec<(MsgCode, RequestHandler)>,
    subscribe_handler: Option<RequestHandler>,
    broadcast_handlers: Vec<(MsgCode, BroadcastHandler)>,
}

impl ObjectBuilder {
    pub fn new(oid: ObjectId) -> Self {
        Self {
            oid,
            invoke_handlers: Vec::new(),
            sideband_handlers: Vec::new(),
            subscribe_handler: None,
            broadcast_handlers: Vec::new(),
        }
    }

    /// Handle requests carrying this code.
    pub fn on_invoke(
        mut self,
        code: MsgCode,
        handler: impl FnMut(RequestGuard) + Send + 'static,
    ) -> Self {
        self.invoke_handlers.push((code, Box::new(handler)));
        self
    }

    /// Handle sideband (control-plane) requests carrying this code.
    pub fn on_sideband(
        mut self,
        code: MsgCode,
        handler: impl FnMut(RequestGuard) + Send + 'static,
    ) -> Self {
        self.sideband_handlers.push((code, Box::new(handler)));
        self
    }

    /// Handle subscribe and update requests; typically emits the initial
    /// broadcasts via the guard.
    pub fn on_subscribe(mut self, handler: impl FnMut(RequestGuard) + Send + 'static) -> Self {
        self.subscribe_handler = Some(Box::new(handler));
        self
    }

    /// Observe broadcasts carrying this code.
    pub fn on_broadcast(
        mut self,
        code: MsgCode,
        handler: impl FnMut(MsgRef) + Send + 'static,
    ) -> Self {
        self.broadcast_handlers.push((code, Box::new(handler)));
        self
    }

    fn build(self) -> Object {
        let mut object = Object::new(self.oid);
        for (code, handler) in self.invoke_handlers {
            object.invoke_handlers.insert(code, handler);
        }
        for (code, handler) in self.sideband_handlers {
            object.sideband_handlers.insert(code, handler);
        }
        object.subscribe_handler = self.subscribe_handler;
        for (code, handler) in self.broadcast_handlers {
            object.broadcast_handlers.insert(code, handler);
        }
        object
    }
}

/// Guard wrapping an inbound request during handling.
///
/// Exposes the reply verbs and, when dropped as the last holder without a
/// reply, emits the auto-reply status — the receiver-side half of the
/// exactly-one-reply contract.
pub struct RequestGuard {
    msg: Option<MsgRef>,
    ctx: BusContext,
}

impl RequestGuard {
    pub(crate) fn new(msg: MsgRef, ctx: BusContext) -> Self {
        Self {
            msg: Some(msg),
            ctx,
        }
    }

    /// The wrapped message reference.
    pub fn msg_ref(&self) -> &MsgRef {
        self.msg.as_ref().expect("guard holds the message until drop")
    }

    /// Decode the request payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.msg_ref().lock().decode_payload()
    }

    /// Reply with a structured payload.
    pub fn reply<T: Serialize>(&self, data: &T) -> Result<()> {
        MsgHandle::reply(self.msg_ref(), &self.ctx, data)
    }

    /// Reply with opaque bytes.
    pub fn reply_raw(&self, data: &[u8], log_data: Option<&str>) -> Result<()> {
        MsgHandle::reply_raw(self.msg_ref(), &self.ctx, data, log_data)
    }

    /// Reply on the sideband plane.
    pub fn reply_sideband<T: Serialize>(&self, data: &T) -> Result<()> {
        MsgHandle::reply_sideband(self.msg_ref(), &self.ctx, data)
    }

    /// Answer with a status frame.
    pub fn status(&self, code: i32, description: &str) -> Result<()> {
        MsgHandle::status(self.msg_ref(), &self.ctx, code, description)
    }

    /// Emit a broadcast derived from this request (the initial-response
    /// path for subscriptions and updates).
    pub fn broadcast<T: Serialize>(&self, code: MsgCode, filter: &str, data: &T) -> Result<()> {
        MsgHandle::broadcast(self.msg_ref(), &self.ctx, code, filter, data)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            MsgHandle::auto_reply(&msg, &self.ctx, status::ST_AUTO_REPLY_OK, AUTO_REPLY_DESCRIPTION);
        }
    }
}

/// Client-side handle for building messages addressed to an object.
///
/// Tracks the object's default session; with none set, messages route
/// lazily through the endpoint's preferred peer.
#[derive(Clone)]
pub struct ObjectHandle {
    ctx: BusContext,
    epid: EndpointId,
    oid: ObjectId,
    default_sid: Arc<AtomicU32>,
}

impl ObjectHandle {
    pub(crate) fn new(ctx: BusContext, epid: EndpointId, oid: ObjectId) -> Self {
        Self {
            ctx,
            epid,
            oid,
            default_sid: Arc::new(AtomicU32::new(INVALID_ID)),
        }
    }

    pub fn epid(&self) -> EndpointId {
        self.epid
    }

    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    pub fn set_default_session(&self, sid: SessionId) {
        self.default_sid.store(sid, Ordering::Release);
    }

    pub fn default_session(&self) -> SessionId {
        self.default_sid.load(Ordering::Acquire)
    }

    /// New message addressed to this object.
    pub fn message(&self, code: MsgCode) -> MsgRef {
        self.message_to(code, INVALID_ID)
    }

    /// New message with an explicit receiver session override.
    pub fn message_to(&self, code: MsgCode, alt_sid: SessionId) -> MsgRef {
        let mut msg = Message::request(code);
        msg.set_destination(self.oid, self.epid, self.default_session(), alt_sid);
        MsgHandle::new(msg)
    }

    /// New message with the timing overlay armed.
    pub fn debug_message(&self, code: MsgCode) -> MsgRef {
        let mut msg = Message::request(code).with_debug();
        msg.set_destination(self.oid, self.epid, self.default_session(), INVALID_ID);
        MsgHandle::new(msg)
    }

    /// New request with its payload already attached.
    pub fn build_request<T: Serialize>(&self, code: MsgCode, data: &T) -> Result<MsgRef> {
        let msg_ref = self.message(code);
        msg_ref
            .lock()
            .set_payload(data, Some(self.ctx.logger().as_ref()))?;
        Ok(msg_ref)
    }

    /// New subscribe-request carrying `(code, filter)` items.
    pub fn build_subscribe<'a, I>(&self, pairs: I) -> Result<MsgRef>
    where
        I: IntoIterator<Item = (MsgCode, &'a str)>,
    {
        let msg_ref = self.message(0);
        msg_ref
            .lock()
            .set_payload(&SubscribeList::from_pairs(pairs), None)?;
        Ok(msg_ref)
    }

    /// Endpoint-wide broadcast to every session subscribed to this code
    /// and filter.
    pub fn broadcast<T: Serialize>(&self, code: MsgCode, filter: &str, data: &T) -> Result<()> {
        let mut msg = Message::endpoint_broadcast(code, filter, self.epid, self.oid);
        msg.set_payload(data, Some(self.ctx.logger().as_ref()))?;
        let msg_ref = MsgHandle::new(msg);
        if !self.ctx.send_async_endeavor(&msg_ref) {
            return Err(BusError::ConnectionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_table_exact_filter_match() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, 400, "x", 10);
        table.subscribe(1, 400, "y", 11);
        table.subscribe(1, 400, "", 12);

        assert_eq!(table.sessions_for(1, 400, "x"), vec![10]);
        assert_eq!(table.sessions_for(1, 400, "y"), vec![11]);
        // Empty filter matches only the explicit empty subscription.
        assert_eq!(table.sessions_for(1, 400, ""), vec![12]);
        assert!(table.sessions_for(1, 401, "x").is_empty());
        assert!(table.sessions_for(2, 400, "x").is_empty());
    }

    #[test]
    fn test_subscription_table_unsubscribe() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, 400, "x", 10);
        table.subscribe(1, 400, "x", 11);

        table.unsubscribe(1, 400, "x", 10);
        assert_eq!(table.sessions_for(1, 400, "x"), vec![11]);
        assert!(!table.contains(1, 400, "x", 10));
        assert!(table.contains(1, 400, "x", 11));
    }

    #[test]
    fn test_subscription_table_remove_session() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, 400, "x", 10);
        table.subscribe(1, 401, "y", 10);
        table.subscribe(1, 400, "x", 11);

        table.remove_session(10);
        assert_eq!(table.sessions_for(1, 400, "x"), vec![11]);
        assert!(table.sessions_for(1, 401, "y").is_empty());
    }

    #[test]
    fn test_endpoint_preferred_peer_is_first_session() {
        let endpoint = EndpointBuilder::new("svc").build();
        let mut endpoint = endpoint;
        assert_eq!(endpoint.preferred_peer(), None);

        endpoint.add_session(5);
        endpoint.add_session(6);
        assert_eq!(endpoint.preferred_peer(), Some(5));

        endpoint.remove_session(5);
        assert_eq!(endpoint.preferred_peer(), Some(6));
    }

    #[test]
    fn test_endpoint_builder_registers_objects_and_handlers() {
        let builder = EndpointBuilder::new("svc").object(
            ObjectBuilder::new(1)
                .on_invoke(100, |_guard| {})
                .on_sideband(500, |_guard| {})
                .on_subscribe(|_guard| {})
                .on_broadcast(400, |_msg| {}),
        );
        let mut endpoint = builder.build();

        assert_eq!(endpoint.name(), "svc");
        let object = endpoint.object_mut(1).unwrap();
        assert!(object.invoke_handler_mut(100).is_some());
        assert!(object.invoke_handler_mut(999).is_none());
        assert!(object.sideband_handler_mut(500).is_some());
        assert!(object.subscribe_handler_mut().is_some());
        assert!(object.broadcast_handler_mut(400).is_some());
    }

    #[test]
    fn test_endpoint_subscribe_requires_object() {
        let mut endpoint = EndpointBuilder::new("svc")
            .object(ObjectBuilder::new(1))
            .build();

        endpoint.subscribe(1, 400, "x", 10);
        endpoint.subscribe(99, 400, "x", 10);

        assert_eq!(endpoint.subscribers(1, 400, "x"), vec![10]);
        assert!(endpoint.subscribers(99, 400, "x").is_empty());
    }
}
