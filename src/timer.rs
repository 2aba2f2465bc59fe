//! Scoped one-shot timer owned by a pending request.
//!
//! The timer is inert until [`MessageTimer::attach`] schedules it on the
//! context worker's clock. Firing posts a terminate job for the matching
//! serial; dropping the timer (reply matched, entry removed) aborts the
//! task, so release is guaranteed without explicit cancellation calls.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::Job;
use crate::protocol::{status, MsgSerial, SessionId};

/// Timeout description delivered with the synthesized status.
pub(crate) const TIMEOUT_DESCRIPTION: &str = "Message is destroyed due to timeout.";

/// One-shot timer bound to a pending request.
#[derive(Debug)]
pub(crate) struct MessageTimer {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl MessageTimer {
    /// Create an unscheduled timer holding its interval.
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    /// Schedule the timer. On expiry it asks the session to terminate the
    /// message with a timeout status.
    pub(crate) fn attach(
        &mut self,
        jobs: mpsc::UnboundedSender<Job>,
        sid: SessionId,
        serial: MsgSerial,
    ) {
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = jobs.send(Job::TerminateMessage {
                sid,
                serial,
                code: status::ST_TIMEOUT,
                description: TIMEOUT_DESCRIPTION.to_string(),
            });
        }));
    }

    #[cfg(test)]
    pub(crate) fn is_attached(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for MessageTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
