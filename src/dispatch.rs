//! State dispatcher: the single entry point run on the context worker for
//! every submitted message, plus the ingress switch for frames arriving
//! on sessions.
//!
//! Each outbound arm reports success or failure; failure rewrites the
//! message into a status and runs its completion path, so a blocked
//! submitter wakes with the error and an async submitter gets its
//! callback.

use crate::context::ContextState;
use crate::endpoint::RequestGuard;
use crate::message::{Message, MsgHandle, MsgRef};
use crate::protocol::{
    flags, is_valid_id, status, MessageType, RawFrame, SessionId, SubscribeList, CODE_SUBSCRIBE,
    CODE_UNSUBSCRIBE, CODE_UPDATE,
};

/// Dispatch a submitted message according to its type.
pub(crate) async fn run(state: &mut ContextState, msg_ref: MsgRef) {
    let (msg_type, code, sn) = {
        let m = msg_ref.lock();
        (m.msg_type(), m.code(), m.sn())
    };

    match msg_type {
        MessageType::Request | MessageType::SidebandRequest => do_request(state, &msg_ref).await,

        MessageType::Reply | MessageType::SidebandReply | MessageType::Status => {
            do_reply(state, &msg_ref).await
        }

        MessageType::Broadcast => do_broadcast(state, &msg_ref).await,

        MessageType::SubscribeRequest => match code {
            CODE_SUBSCRIBE | CODE_UPDATE | CODE_UNSUBSCRIBE => do_request(state, &msg_ref).await,
            _ => {
                tracing::error!("subscribe request {} carries unknown code {}", sn, code);
            }
        },

        MessageType::Unknown => {
            tracing::error!("message {}: unknown type, dropped", sn);
        }
    }
}

/// Resolve the target session, materializing a lazy endpoint route on
/// first use.
fn resolve_session(state: &mut ContextState, msg_ref: &MsgRef) -> Option<SessionId> {
    let mut m = msg_ref.lock();
    if m.has_flag(flags::ENDPOINT) {
        let ep = state.endpoints.get(&m.epid())?;
        let sid = ep.preferred_peer()?;
        m.clear_flag(flags::ENDPOINT);
        m.set_sid(sid);
        Some(sid)
    } else {
        let sid = m.sid();
        if is_valid_id(sid) && state.sessions.contains_key(&sid) {
            Some(sid)
        } else {
            None
        }
    }
}

/// Rewrite the message into a status and run its completion path.
fn fail_message(msg_ref: &MsgRef, code: i32, reason: &str) {
    msg_ref
        .lock()
        .set_error_msg(Some(MessageType::Status), code, reason);
    MsgHandle::complete(msg_ref);
}

async fn do_request(state: &mut ContextState, msg_ref: &MsgRef) {
    let mut failure: Option<&str> = None;

    match resolve_session(state, msg_ref) {
        None => failure = Some("no session or endpoint for message"),
        Some(sid) => {
            let noreply = msg_ref.lock().has_flag(flags::NOREPLY_EXPECTED);
            if let Some(session) = state.sessions.get_mut(&sid) {
                match session.send_message(msg_ref).await {
                    Ok(()) => {
                        if !noreply {
                            let (sn, timer) = {
                                let mut m = msg_ref.lock();
                                (m.sn(), m.take_timer())
                            };
                            let timer = timer.map(|mut t| {
                                t.attach(state.jobs.clone(), sid, sn);
                                t
                            });
                            session.pending_mut().insert(sn, msg_ref.clone(), timer);
                        }
                    }
                    Err(e) => {
                        tracing::error!("session {}: send failed: {}", sid, e);
                        // Fire-and-forget delivery failures are not
                        // synthesized back to the caller.
                        if !noreply {
                            failure = Some("error when sending message");
                        }
                    }
                }
            } else {
                failure = Some("no session for message");
            }
        }
    }

    if let Some(reason) = failure {
        fail_message(msg_ref, status::ST_INVALID_ID, reason);
    }
}

async fn do_reply(state: &mut ContextState, msg_ref: &MsgRef) {
    if msg_ref.lock().has_flag(flags::NOREPLY_EXPECTED) {
        return;
    }
    match resolve_session(state, msg_ref) {
        Some(sid) => {
            if let Some(session) = state.sessions.get_mut(&sid) {
                if let Err(e) = session.send_message(msg_ref).await {
                    tracing::error!("session {}: reply send failed: {}", sid, e);
                }
            }
        }
        None => tracing::error!("reply dropped: no session to carry it"),
    }
}

async fn do_broadcast(state: &mut ContextState, msg_ref: &MsgRef) {
    let mut failure: Option<&str> = None;

    if msg_ref.lock().has_flag(flags::ENDPOINT) {
        // Endpoint-wide: fan out to every subscribed session of the
        // target object.
        let (epid, oid, code, filter) = {
            let m = msg_ref.lock();
            (m.epid(), m.oid(), m.code(), m.filter().to_string())
        };

        let targets = match state.endpoints.get(&epid) {
            Some(ep) => {
                if ep.object(oid).is_some() {
                    Some(ep.subscribers(oid, code, &filter))
                } else {
                    failure = Some("invalid object id");
                    None
                }
            }
            None => {
                failure = Some("invalid endpoint id");
                None
            }
        };

        if let Some(sids) = targets {
            for sid in sids {
                if let Some(session) = state.sessions.get_mut(&sid) {
                    if let Err(e) = session.send_message(msg_ref).await {
                        tracing::error!("broadcast to session {} failed: {}", sid, e);
                    }
                }
            }
        }
    } else {
        // Session-scoped: the initial response to a fresh subscription
        // (or a manual update), delivered to that one session only.
        msg_ref.lock().set_flag(flags::INITIAL_RESPONSE);
        let (sid, oid, code, filter, manual) = {
            let m = msg_ref.lock();
            (
                m.sid(),
                m.oid(),
                m.code(),
                m.filter().to_string(),
                m.has_flag(flags::MANUAL_UPDATE),
            )
        };

        match state.sessions.get(&sid).map(|s| s.epid()) {
            None => failure = Some("invalid session id"),
            Some(epid) => {
                let deliverable = state
                    .endpoints
                    .get(&epid)
                    .map(|ep| {
                        ep.object(oid).is_some()
                            && (manual || ep.is_subscribed(oid, code, &filter, sid))
                    })
                    .unwrap_or(false);
                if deliverable {
                    if let Some(session) = state.sessions.get_mut(&sid) {
                        if session.send_message(msg_ref).await.is_err() {
                            failure = Some("fail to send broadcast");
                        }
                    }
                } else {
                    failure = Some("not subscribed or fail to send");
                }
            }
        }
    }

    if let Some(reason) = failure {
        fail_message(msg_ref, status::ST_INVALID_ID, reason);
    }
}

// --- ingress ------------------------------------------------------------

/// Route a frame that arrived on a session.
pub(crate) fn inbound(state: &mut ContextState, sid: SessionId, frame: RawFrame) {
    let msg = match Message::from_wire(&frame, sid) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!("session {}: frame decode failed: {}", sid, e);
            return;
        }
    };

    match msg.msg_type() {
        MessageType::Reply | MessageType::SidebandReply | MessageType::Status => {
            on_reply(state, sid, msg)
        }
        MessageType::Request | MessageType::SidebandRequest | MessageType::SubscribeRequest => {
            on_request(state, sid, msg)
        }
        MessageType::Broadcast => on_broadcast(state, sid, msg),
        MessageType::Unknown => {
            tracing::error!("session {}: unknown inbound message type, dropped", sid);
        }
    }
}

/// Match a reply/status against the pending table and complete the
/// waiter.
fn on_reply(state: &mut ContextState, sid: SessionId, msg: Message) {
    let serial = msg.sn();
    let Some(session) = state.sessions.get_mut(&sid) else {
        return;
    };
    let Some(entry) = session.pending_mut().remove(serial) else {
        tracing::warn!("session {}: no pending request for serial {}", sid, serial);
        return;
    };

    {
        let mut waiter = entry.msg.lock();
        // The serial keys the match; the object id is only sanity-checked.
        if is_valid_id(waiter.oid()) && is_valid_id(msg.oid()) && waiter.oid() != msg.oid() {
            tracing::warn!(
                "serial {}: reply object {} does not match request object {}",
                serial,
                msg.oid(),
                waiter.oid()
            );
        }
        waiter.absorb_reply(msg);
    }
    MsgHandle::complete(&entry.msg);
    // Entry drop destroys the timer atomically with the removal.
}

/// Deliver an inbound request to the owning object's handler, wrapped in
/// a guard that auto-replies when dropped unreplied.
fn on_request(state: &mut ContextState, sid: SessionId, mut msg: Message) {
    // Reply expectation travels through the serial: fire-and-forget
    // requests carry none.
    if is_valid_id(msg.sn()) {
        msg.set_flag(flags::AUTO_REPLY);
    } else {
        msg.set_flag(flags::NOREPLY_EXPECTED);
    }

    let msg_type = msg.msg_type();
    let code = msg.code();
    let oid = msg.oid();

    let Some(epid) = state.sessions.get(&sid).map(|s| s.epid()) else {
        return;
    };
    let ctx = state.ctx.clone();
    let Some(endpoint) = state.endpoints.get_mut(&epid) else {
        return;
    };

    let msg_ref = MsgHandle::new(msg);

    if msg_type == MessageType::SubscribeRequest {
        let list: SubscribeList = msg_ref.lock().decode_payload().unwrap_or_default();
        match code {
            CODE_SUBSCRIBE => {
                for item in &list.items {
                    endpoint.subscribe(oid, item.code, &item.filter, sid);
                }
            }
            CODE_UNSUBSCRIBE => {
                for item in &list.items {
                    endpoint.unsubscribe(oid, item.code, &item.filter, sid);
                }
            }
            // An update touches no subscription state; the flag rides
            // into broadcasts derived from this request.
            CODE_UPDATE => msg_ref.lock().set_flag(flags::MANUAL_UPDATE),
            _ => {}
        }

        let guard = RequestGuard::new(msg_ref, ctx);
        if code == CODE_SUBSCRIBE || code == CODE_UPDATE {
            if let Some(object) = endpoint.object_mut(oid) {
                if let Some(handler) = object.subscribe_handler_mut() {
                    handler(guard);
                    return;
                }
            }
        }
        // No handler ran: the guard drop answers the request.
        drop(guard);
        return;
    }

    let guard = RequestGuard::new(msg_ref, ctx);
    let handler = endpoint.object_mut(oid).and_then(|object| {
        if msg_type == MessageType::SidebandRequest {
            object.sideband_handler_mut(code)
        } else {
            object.invoke_handler_mut(code)
        }
    });

    match handler {
        Some(handler) => handler(guard),
        None => {
            tracing::warn!(
                "session {}: no handler for {} code {} on object {}",
                sid,
                msg_type.name(),
                code,
                oid
            );
            // Guard drop auto-replies so the caller is not left hanging.
            drop(guard);
        }
    }
}

/// Deliver an inbound broadcast to the registered observer for its code.
fn on_broadcast(state: &mut ContextState, sid: SessionId, msg: Message) {
    let code = msg.code();
    let oid = msg.oid();

    let Some(epid) = state.sessions.get(&sid).map(|s| s.epid()) else {
        return;
    };
    let Some(endpoint) = state.endpoints.get_mut(&epid) else {
        return;
    };
    let Some(object) = endpoint.object_mut(oid) else {
        tracing::warn!("session {}: broadcast for unknown object {}", sid, oid);
        return;
    };

    match object.broadcast_handler_mut(code) {
        Some(handler) => handler(MsgHandle::new(msg)),
        None => {
            tracing::debug!("session {}: unobserved broadcast code {}", sid, code);
        }
    }
}
