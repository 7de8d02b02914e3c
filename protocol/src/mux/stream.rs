//! One multiplexed byte stream.
//!
//! [`MuxStream`] behaves like a socket: `AsyncRead` + `AsyncWrite`, with
//! `poll_shutdown` acting as a half-close. The scheduler task owns the other
//! end of the per-stream state; the two communicate through atomics, an
//! event channel and the shared outbound frame queue.

use super::frame::Frame;
use super::{Command, DEFAULT_WINDOW};
use bytes::Bytes;
use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Receive-side credit is granted back to the peer once this many consumed
/// bytes have accumulated.
const CREDIT_THRESHOLD: usize = DEFAULT_WINDOW / 2;

/// State shared between a [`MuxStream`] and the scheduler.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    /// Bytes we may still send before the peer must grant more credit.
    pub(crate) send_window: AtomicUsize,
    pub(crate) send_waker: AtomicWaker,
    /// Set on peer reset or connection loss; reads and writes start failing.
    pub(crate) reset: AtomicBool,
    /// We half-closed: an EOF frame went out and writes are rejected.
    pub(crate) write_closed: AtomicBool,
    /// The peer half-closed: reads return 0 once buffered data drains.
    pub(crate) read_eof: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            send_window: AtomicUsize::new(DEFAULT_WINDOW),
            send_waker: AtomicWaker::new(),
            reset: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            read_eof: AtomicBool::new(false),
        })
    }

    /// True when both directions shut down cleanly; a drop then needs no
    /// RESET frame.
    pub(crate) fn fully_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire) && self.read_eof.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Eof,
}

/// One logical bidirectional byte channel inside a multiplexed connection.
pub struct MuxStream {
    shared: Arc<StreamShared>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    pending: Bytes,
    uncredited: usize,
    max_frame: usize,
}

impl MuxStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        frame_tx: mpsc::UnboundedSender<Frame>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        event_rx: mpsc::UnboundedReceiver<StreamEvent>,
        max_frame: usize,
    ) -> Self {
        Self {
            shared,
            frame_tx,
            cmd_tx,
            event_rx,
            pending: Bytes::new(),
            uncredited: 0,
            max_frame,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    fn credit_consumed(&mut self, n: usize) {
        self.uncredited += n;
        if self.uncredited >= CREDIT_THRESHOLD {
            let _ = self.frame_tx.send(Frame::Window {
                id: self.shared.id,
                credit: self.uncredited as u32,
            });
            self.uncredited = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                this.credit_consumed(n);
                return Poll::Ready(Ok(()));
            }
            if this.shared.read_eof.load(Ordering::Acquire) {
                return Poll::Ready(Ok(()));
            }
            match this.event_rx.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(bytes))) => this.pending = bytes,
                Poll::Ready(Some(StreamEvent::Eof)) => {
                    this.shared.read_eof.store(true, Ordering::Release);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => {
                    if this.shared.reset.load(Ordering::Acquire) {
                        return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                    }
                    this.shared.read_eof.store(true, Ordering::Release);
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.shared.reset.load(Ordering::Acquire)
            || this.shared.write_closed.load(Ordering::Acquire)
        {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let mut window = this.shared.send_window.load(Ordering::Acquire);
        if window == 0 {
            // Register before re-checking so a concurrent credit grant
            // cannot slip between the load and the park.
            this.shared.send_waker.register(cx.waker());
            if this.shared.reset.load(Ordering::Acquire) {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            window = this.shared.send_window.load(Ordering::Acquire);
            if window == 0 {
                return Poll::Pending;
            }
        }

        let n = buf.len().min(window).min(this.max_frame);
        this.shared.send_window.fetch_sub(n, Ordering::AcqRel);
        let frame = Frame::Data {
            id: this.shared.id,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        if this.frame_tx.send(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued to the dedicated sender task; there is no
        // stream-local buffer to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.shared.write_closed.swap(true, Ordering::AcqRel) {
            let _ = this.frame_tx.send(Frame::Eof { id: this.shared.id });
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        // The scheduler resets the stream on the wire unless both
        // directions already closed cleanly.
        let _ = self.cmd_tx.send(Command::StreamDropped { id: self.shared.id });
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.shared.id).finish()
    }
}
