//! The bus context: one worker task owning every piece of dispatch state.
//!
//! Endpoints, sessions, pending tables, and subscription tables are all
//! affine to the worker; everything else talks to it through the job
//! queue, so none of that state needs locks. The public [`BusContext`]
//! handle is a cheap clone wrapping the queue sender.
//!
//! Only synchronous submit suspends the caller, and it must not run on
//! the worker itself — that would deadlock the loop, so it is detected
//! via a task-local marker and rejected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::dispatch;
use crate::endpoint::{Endpoint, EndpointBuilder, ObjectHandle};
use crate::error::{BusError, Result};
use crate::logger::{MessageLogger, TraceLogger};
use crate::message::{MsgHandle, MsgRef};
use crate::protocol::{status, EndpointId, MessageType, MsgSerial, ObjectId, RawFrame, SessionId};
use crate::session::{Session, SessionStream};

/// Description delivered to requests stranded by session teardown.
const PEER_VANISH_DESCRIPTION: &str = "Session is destroyed.";

/// Work items processed by the context worker.
pub(crate) enum Job {
    /// Dispatch a submitted message.
    Dispatch(MsgRef),
    /// A frame arrived on a session.
    Inbound { sid: SessionId, frame: RawFrame },
    /// A pending request's timer fired (or teardown wants it gone).
    TerminateMessage {
        sid: SessionId,
        serial: MsgSerial,
        code: i32,
        description: String,
    },
    RegisterEndpoint {
        builder: EndpointBuilder,
        reply: oneshot::Sender<EndpointId>,
    },
    OpenSession {
        epid: EndpointId,
        stream: Box<dyn SessionStream>,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    CloseSession {
        sid: SessionId,
        reply: oneshot::Sender<()>,
    },
    /// A session's read loop ended.
    SessionClosed { sid: SessionId },
    PendingCount {
        sid: SessionId,
        reply: oneshot::Sender<usize>,
    },
    /// Run a closure on the worker (tests and maintenance).
    Run(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Dispatch(_) => write!(f, "Dispatch"),
            Job::Inbound { sid, .. } => write!(f, "Inbound(sid={sid})"),
            Job::TerminateMessage {
                sid,
                serial,
                code,
                description,
            } => write!(
                f,
                "TerminateMessage(sid={sid}, serial={serial}, code={code}, description={description:?})"
            ),
            Job::RegisterEndpoint { .. } => write!(f, "RegisterEndpoint"),
            Job::OpenSession { epid, .. } => write!(f, "OpenSession(epid={epid})"),
            Job::CloseSession { sid, .. } => write!(f, "CloseSession(sid={sid})"),
            Job::SessionClosed { sid } => write!(f, "SessionClosed(sid={sid})"),
            Job::PendingCount { sid, .. } => write!(f, "PendingCount(sid={sid})"),
            Job::Run(_) => write!(f, "Run"),
        }
    }
}

tokio::task_local! {
    static CONTEXT_WORKER: ();
}

/// Handle to a running bus context.
#[derive(Clone)]
pub struct BusContext {
    jobs: mpsc::UnboundedSender<Job>,
    logger: Arc<dyn MessageLogger>,
}

impl BusContext {
    /// Spawn a context worker with the default telemetry logger.
    pub fn start() -> Self {
        Self::start_with_logger(Arc::new(TraceLogger::new()))
    }

    /// Spawn a context worker with a caller-provided telemetry logger.
    pub fn start_with_logger(logger: Arc<dyn MessageLogger>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            jobs: tx.clone(),
            logger,
        };
        let state = ContextState::new(tx, ctx.clone());
        tokio::spawn(CONTEXT_WORKER.scope((), worker_loop(state, rx)));
        ctx
    }

    /// Whether the current task is the context worker.
    pub fn is_self(&self) -> bool {
        CONTEXT_WORKER.try_with(|_| ()).is_ok()
    }

    /// Telemetry gate shared with the submit verbs.
    pub fn logger(&self) -> &Arc<dyn MessageLogger> {
        &self.logger
    }

    fn post(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| BusError::ConnectionClosed)
    }

    /// Enqueue a message for dispatch.
    pub(crate) fn send_async(&self, msg_ref: MsgRef) -> Result<()> {
        self.post(Job::Dispatch(msg_ref))
    }

    /// Best-effort enqueue; reports only whether the queue accepted it.
    pub(crate) fn send_async_endeavor(&self, msg_ref: &MsgRef) -> bool {
        self.jobs.send(Job::Dispatch(msg_ref.clone())).is_ok()
    }

    /// Register an endpoint with its objects and handlers.
    pub async fn register_endpoint(&self, builder: EndpointBuilder) -> Result<EndpointId> {
        let (tx, rx) = oneshot::channel();
        self.post(Job::RegisterEndpoint { builder, reply: tx })?;
        rx.await.map_err(|_| BusError::ConnectionClosed)
    }

    /// Attach a byte stream to an endpoint as a new session.
    pub async fn open_session<S: SessionStream>(
        &self,
        epid: EndpointId,
        stream: S,
    ) -> Result<SessionId> {
        let (tx, rx) = oneshot::channel();
        self.post(Job::OpenSession {
            epid,
            stream: Box::new(stream),
            reply: tx,
        })?;
        rx.await.map_err(|_| BusError::ConnectionClosed)?
    }

    /// Tear a session down, flushing its pending requests with a
    /// peer-vanish status.
    pub async fn close_session(&self, sid: SessionId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(Job::CloseSession { sid, reply: tx })?;
        rx.await.map_err(|_| BusError::ConnectionClosed)
    }

    /// Number of requests outstanding on a session (diagnostic).
    pub async fn pending_count(&self, sid: SessionId) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.post(Job::PendingCount { sid, reply: tx })?;
        rx.await.map_err(|_| BusError::ConnectionClosed)
    }

    /// Run a closure on the context worker.
    pub fn run_on_worker(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.post(Job::Run(Box::new(f)))
    }

    /// Handle for building messages addressed to an object.
    pub fn object(&self, epid: EndpointId, oid: ObjectId) -> ObjectHandle {
        ObjectHandle::new(self.clone(), epid, oid)
    }
}

/// Worker-owned dispatch state.
pub(crate) struct ContextState {
    pub(crate) jobs: mpsc::UnboundedSender<Job>,
    pub(crate) ctx: BusContext,
    pub(crate) sessions: HashMap<SessionId, Session>,
    pub(crate) endpoints: HashMap<EndpointId, Endpoint>,
    next_sid: u32,
    next_epid: u32,
}

impl ContextState {
    fn new(jobs: mpsc::UnboundedSender<Job>, ctx: BusContext) -> Self {
        Self {
            jobs,
            ctx,
            sessions: HashMap::new(),
            endpoints: HashMap::new(),
            next_sid: 1,
            next_epid: 1,
        }
    }

    fn alloc_sid(&mut self) -> SessionId {
        let sid = self.next_sid;
        self.next_sid += 1;
        sid
    }

    fn alloc_epid(&mut self) -> EndpointId {
        let epid = self.next_epid;
        self.next_epid += 1;
        epid
    }
}

async fn worker_loop(mut state: ContextState, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        handle_job(&mut state, job).await;
    }
}

async fn handle_job(state: &mut ContextState, job: Job) {
    match job {
        Job::Dispatch(msg_ref) => dispatch::run(state, msg_ref).await,

        Job::Inbound { sid, frame } => dispatch::inbound(state, sid, frame),

        Job::TerminateMessage {
            sid,
            serial,
            code,
            description,
        } => terminate_message(state, sid, serial, code, &description),

        Job::RegisterEndpoint { builder, reply } => {
            let epid = state.alloc_epid();
            state.endpoints.insert(epid, builder.build());
            let _ = reply.send(epid);
        }

        Job::OpenSession {
            epid,
            stream,
            reply,
        } => {
            let result = open_session(state, epid, stream);
            let _ = reply.send(result);
        }

        Job::CloseSession { sid, reply } => {
            close_session(state, sid);
            let _ = reply.send(());
        }

        Job::SessionClosed { sid } => close_session(state, sid),

        Job::PendingCount { sid, reply } => {
            let count = state
                .sessions
                .get(&sid)
                .map(|s| s.pending().len())
                .unwrap_or(0);
            let _ = reply.send(count);
        }

        Job::Run(f) => f(),
    }
}

fn open_session(
    state: &mut ContextState,
    epid: EndpointId,
    stream: Box<dyn SessionStream>,
) -> Result<SessionId> {
    let endpoint_name = match state.endpoints.get(&epid) {
        Some(ep) => ep.name().to_string(),
        None => {
            return Err(BusError::InvalidRoute(format!(
                "no endpoint {epid} to attach a session to"
            )))
        }
    };

    let sid = state.alloc_sid();
    let session = Session::spawn(sid, epid, endpoint_name, stream, state.jobs.clone());
    state.sessions.insert(sid, session);
    if let Some(ep) = state.endpoints.get_mut(&epid) {
        ep.add_session(sid);
    }
    Ok(sid)
}

/// Remove a pending request and complete it with the given status.
fn terminate_message(
    state: &mut ContextState,
    sid: SessionId,
    serial: MsgSerial,
    code: i32,
    description: &str,
) {
    let Some(session) = state.sessions.get_mut(&sid) else {
        return;
    };
    let Some(entry) = session.pending_mut().remove(serial) else {
        return;
    };
    entry
        .msg
        .lock()
        .set_error_msg(Some(MessageType::Status), code, description);
    MsgHandle::complete(&entry.msg);
    // Dropping the entry destroys its timer with the removal.
}

fn close_session(state: &mut ContextState, sid: SessionId) {
    let Some(mut session) = state.sessions.remove(&sid) else {
        return;
    };
    for (_, entry) in session.pending_mut().drain() {
        entry.msg.lock().set_error_msg(
            Some(MessageType::Status),
            status::ST_PEER_VANISH,
            PEER_VANISH_DESCRIPTION,
        );
        MsgHandle::complete(&entry.msg);
    }
    if let Some(ep) = state.endpoints.get_mut(&session.epid()) {
        ep.remove_session(sid);
    }
    tracing::debug!("session {} closed", session.sid());
}
