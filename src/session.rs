//! Sessions: the per-peer I/O endpoint carrying ordered framed bytes.
//!
//! Each session splits its stream into a read loop (frames in, posted to
//! the worker as jobs) and a dedicated writer task fed over a bounded
//! channel. Outbound frames are batched and written with scatter/gather
//! I/O so bursts coalesce into few syscalls. Sends on a given session go
//! out in the order the dispatcher processed them; nothing is promised
//! across sessions.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::Job;
use crate::error::{BusError, Result};
use crate::message::MsgRef;
use crate::pending::PendingTable;
use crate::protocol::{is_valid_id, EndpointId, FrameDecoder, MsgSerial, SessionId};

/// Streams a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SessionStream for T {}

/// Outbound queue depth per session.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames coalesced into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Sender side of a session's writer task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    pub(crate) async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| BusError::ConnectionClosed)
    }
}

/// Worker-owned session state.
pub(crate) struct Session {
    sid: SessionId,
    epid: EndpointId,
    endpoint_name: String,
    next_serial: MsgSerial,
    pending: PendingTable,
    writer: WriterHandle,
    read_task: JoinHandle<()>,
    _write_task: JoinHandle<()>,
}

impl Session {
    /// Split the stream and spawn the session's I/O tasks.
    pub(crate) fn spawn(
        sid: SessionId,
        epid: EndpointId,
        endpoint_name: String,
        stream: Box<dyn SessionStream>,
        jobs: mpsc::UnboundedSender<Job>,
    ) -> Self {
        let (reader, writer_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);

        let write_task = tokio::spawn(writer_loop(rx, writer_half));
        let read_task = tokio::spawn(read_loop(reader, sid, jobs));

        Self {
            sid,
            epid,
            endpoint_name,
            next_serial: 1,
            pending: PendingTable::new(),
            writer: WriterHandle { tx },
            read_task,
            _write_task: write_task,
        }
    }

    pub(crate) fn sid(&self) -> SessionId {
        self.sid
    }

    pub(crate) fn epid(&self) -> EndpointId {
        self.epid
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn pending_mut(&mut self) -> &mut PendingTable {
        &mut self.pending
    }

    /// Next serial, skipping the sentinel on wrap.
    fn alloc_serial(&mut self) -> MsgSerial {
        let sn = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if !is_valid_id(self.next_serial) {
            self.next_serial = 1;
        }
        sn
    }

    /// Encode and queue a message on this session.
    ///
    /// Requests expecting a reply get their serial assigned here on first
    /// send; fire-and-forget requests deliberately carry none, which is
    /// how the receiver knows not to answer.
    pub(crate) async fn send_message(&mut self, msg_ref: &MsgRef) -> Result<()> {
        let frame = {
            let mut m = msg_ref.lock();
            if m.msg_type().is_request()
                && !is_valid_id(m.sn())
                && !m.has_flag(crate::protocol::flags::NOREPLY_EXPECTED)
            {
                let sn = self.alloc_serial();
                m.set_sn(sn);
            }
            m.build_head(&self.endpoint_name)?;
            Bytes::copy_from_slice(m.frame_bytes())
        };
        if frame.is_empty() {
            return Err(BusError::Transport("message has no encoded frame".into()));
        }
        self.writer.send(frame).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.read_task.abort();
        // The writer task drains and exits once its channel closes.
    }
}

/// Read loop: accumulate bytes, post complete frames to the worker, and
/// report teardown when the peer goes away.
async fn read_loop<R>(mut reader: R, sid: SessionId, jobs: mpsc::UnboundedSender<Job>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::error!("session {}: read failed: {}", sid, e);
                break;
            }
        };

        match decoder.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    if jobs.send(Job::Inbound { sid, frame }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("session {}: framing error: {}", sid, e);
                break;
            }
        }
    }

    let _ = jobs.send(Job::SessionClosed { sid });
}

/// Writer loop: batch queued frames and push them out with vectored
/// writes.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => return,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("session writer failed: {}", e);
            return;
        }
    }
}

async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total: usize = batch.iter().map(|b| b.len()).sum();
    let slices: Vec<IoSlice<'_>> = batch.iter().map(|b| IoSlice::new(b)).collect();

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 && total > 0 {
        return Err(BusError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    while written < total {
        let remaining = remaining_slices(batch, written);
        let n = writer.write_vectored(&remaining).await?;
        if n == 0 {
            return Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Rebuild the slice list after a partial vectored write.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut passed = 0;

    for frame in batch {
        let end = passed + frame.len();
        if skip < end {
            let start = skip.saturating_sub(passed);
            slices.push(IoSlice::new(&frame[start..]));
        }
        passed = end;
    }
    slices
}
