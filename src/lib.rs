//! # framebus
//!
//! Framed inter-process message bus engine. One message object carries a
//! request, reply, broadcast, or status across its entire life:
//! construction, wire framing, dispatch on a single context worker,
//! reply correlation with timeouts, and filtered broadcast fan-out.
//!
//! ## Architecture
//!
//! - **Context worker**: one task owns endpoints, sessions, pending
//!   tables, and subscriptions; everything reaches it through a job queue
//! - **Sessions**: framed byte streams (any `AsyncRead + AsyncWrite`)
//!   with a read loop and a batching writer task each
//! - **Messages**: shared handles with a completion primitive; verbs
//!   cover invoke/send/reply/status/broadcast/subscribe plus a sideband
//!   control plane and a telemetry log tunnel
//!
//! ## Example
//!
//! ```ignore
//! use framebus::{BusContext, EndpointBuilder, MsgHandle, ObjectBuilder};
//!
//! #[tokio::main]
//! async fn main() -> framebus::Result<()> {
//!     let ctx = BusContext::start();
//!
//!     let server = ctx
//!         .register_endpoint(EndpointBuilder::new("echo-service").object(
//!             ObjectBuilder::new(1).on_invoke(100, |guard| {
//!                 let text: String = guard.decode().unwrap();
//!                 guard.reply(&text).unwrap();
//!             }),
//!         ))
//!         .await?;
//!
//!     let client = ctx.register_endpoint(EndpointBuilder::new("client")).await?;
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!     ctx.open_session(server, a).await?;
//!     let sid = ctx.open_session(client, b).await?;
//!
//!     let obj = ctx.object(client, 1);
//!     obj.set_default_session(sid);
//!     let msg = obj.build_request(100, &"ping")?;
//!     MsgHandle::invoke_sync(&msg, &ctx, None).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod logger;
pub mod protocol;

mod context;
mod dispatch;
mod endpoint;
mod message;
mod pending;
mod session;
mod timer;
mod timing;

pub use context::BusContext;
pub use endpoint::{
    BroadcastHandler, EndpointBuilder, ObjectBuilder, ObjectHandle, RequestGuard, RequestHandler,
};
pub use error::{BusError, Result};
pub use logger::{MessageLogger, TraceLogger};
pub use message::{parse_log_frame, Message, MsgHandle, MsgRef};
pub use session::SessionStream;
pub use timing::{DebugStamps, Latency};
