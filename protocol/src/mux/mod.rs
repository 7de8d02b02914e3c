//! # Stream Multiplexer
//!
//! Carries many independent bidirectional byte streams over one underlying
//! connection, with per-stream credit-based flow control and connection
//! keepalive.
//!
//! ## Task layout
//!
//! ```text
//!            ┌────────────┐  frames   ┌─────────────┐
//!  streams ─►│ frame queue├──────────►│ sender task │──► connection write
//!            └────────────┘           └─────────────┘
//!  connection read ──► scheduler task ──► per-stream event channels
//! ```
//!
//! The scheduler owns all per-stream state and never blocks inside its
//! select arms; streams talk to it through an unbounded command channel.
//! Either peer may open streams: the opener's role only decides id parity
//! (client odd, server even).

mod frame;
mod stream;

use self::frame::{Frame, FrameCodec};
pub use self::stream::MuxStream;
use self::stream::{StreamEvent, StreamShared};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Initial per-stream window both peers assume at open time. Larger
/// configured receive windows are advertised with an immediate credit grant.
pub(crate) const DEFAULT_WINDOW: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer is closed")]
    Closed,
    #[error("timed out opening a stream")]
    OpenTimeout,
}

/// Which side of the connection this endpoint is. Decides stream id parity
/// so simultaneous opens never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Ping interval; a ping unanswered by the next tick marks the
    /// connection dead.
    pub keepalive_interval: Duration,
    /// Upper bound on `open_stream`.
    pub open_timeout: Duration,
    /// Upper bound on waiting for the scheduler to acknowledge `close`.
    pub close_timeout: Duration,
    /// Per-stream receive window advertised to the peer.
    pub receive_window: usize,
    /// Data frame chunk size.
    pub max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(300),
            receive_window: DEFAULT_WINDOW,
            max_frame_size: 16 * 1024,
        }
    }
}

pub(crate) enum Command {
    Open {
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
    StreamDropped {
        id: u32,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a multiplexed connection. Cheap to share behind an `Arc`; the
/// I/O itself lives in two background tasks that exit when the connection
/// dies or [`Multiplexer::close`] is called.
pub struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: Arc<AtomicBool>,
    cfg: MuxConfig,
}

impl Multiplexer {
    pub fn new<T>(io: T, role: Role, cfg: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(sender_task(FramedWrite::new(write_half, FrameCodec), frame_rx));
        tokio::spawn(scheduler_task(
            FramedRead::new(read_half, FrameCodec),
            cmd_rx,
            cmd_tx.clone(),
            frame_tx,
            accept_tx,
            Arc::clone(&closed),
            role,
            cfg.clone(),
        ));

        Self {
            cmd_tx,
            accept_rx: Mutex::new(accept_rx),
            closed,
            cfg,
        }
    }

    /// Opens a new outbound stream, bounded by the configured open timeout.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open { reply: reply_tx })
            .map_err(|_| MuxError::Closed)?;
        match tokio::time::timeout(self.cfg.open_timeout, reply_rx).await {
            Err(_) => Err(MuxError::OpenTimeout),
            Ok(Err(_)) => Err(MuxError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    /// Waits for the peer to open a stream. Returns [`MuxError::Closed`]
    /// once the connection is gone and the backlog is drained.
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await.ok_or(MuxError::Closed)
    }

    /// Orderly shutdown: sends GOAWAY, resets every live stream and stops
    /// both background tasks. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { ack: ack_tx }).is_ok() {
            let _ = tokio::time::timeout(self.cfg.close_timeout, ack_rx).await;
        }
    }

    /// True once the connection is known dead: peer went away, keepalive
    /// missed, or `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn sender_task<W>(
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Send + 'static,
{
    while let Some(frame) = frame_rx.recv().await {
        trace!(?frame, "send mux frame");
        if sink.feed(frame).await.is_err() {
            break;
        }
        if sink.flush().await.is_err() {
            break;
        }
    }
    let _ = sink.into_inner().shutdown().await;
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

#[allow(clippy::too_many_arguments)]
async fn scheduler_task<R>(
    mut frames: FramedRead<ReadHalf<R>, FrameCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    closed: Arc<AtomicBool>,
    role: Role,
    cfg: MuxConfig,
) where
    R: AsyncRead + Send + 'static,
{
    let mut streams: HashMap<u32, StreamEntry> = HashMap::new();
    let mut accept_tx = Some(accept_tx);
    let mut next_id: u32 = match role {
        Role::Client => 1,
        Role::Server => 2,
    };
    let mut keepalive = tokio::time::interval(cfg.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut outstanding_ping: Option<u64> = None;
    let mut next_nonce: u64 = 0;

    // No `await` outside the select arms: the scheduler must keep serving
    // all sources or streams stall.
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Open { reply }) => {
                    let id = next_id;
                    next_id = next_id.wrapping_add(2);
                    if frame_tx.send(Frame::Open { id }).is_err() {
                        let _ = reply.send(Err(MuxError::Closed));
                        break;
                    }
                    let stream = create_stream(id, &mut streams, &frame_tx, &cmd_tx, &cfg);
                    trace!(stream_id = id, "opened stream");
                    let _ = reply.send(Ok(stream));
                }
                Some(Command::StreamDropped { id }) => {
                    if let Some(entry) = streams.remove(&id) {
                        if !entry.shared.fully_closed() {
                            let _ = frame_tx.send(Frame::Reset { id });
                        }
                    }
                }
                Some(Command::Close { ack }) => {
                    let _ = frame_tx.send(Frame::GoAway);
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    let _ = ack.send(());
                    break;
                }
                // Handle and every stream dropped: nothing left to serve.
                None => {
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    break;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if handle_frame(
                        frame,
                        &mut streams,
                        &mut accept_tx,
                        &frame_tx,
                        &cmd_tx,
                        &mut outstanding_ping,
                        role,
                        &cfg,
                    ) {
                        shutdown(&mut streams, &closed, &mut accept_tx);
                        break;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "mux read failed");
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    break;
                }
                None => {
                    debug!("mux connection closed by peer");
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    break;
                }
            },
            _ = keepalive.tick() => {
                if outstanding_ping.is_some() {
                    warn!("keepalive ping unanswered, dropping connection");
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    break;
                }
                let nonce = next_nonce;
                next_nonce = next_nonce.wrapping_add(1);
                outstanding_ping = Some(nonce);
                if frame_tx.send(Frame::Ping { nonce }).is_err() {
                    shutdown(&mut streams, &closed, &mut accept_tx);
                    break;
                }
            }
        }
    }
}

/// Returns true when the connection must shut down.
#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: Frame,
    streams: &mut HashMap<u32, StreamEntry>,
    accept_tx: &mut Option<mpsc::UnboundedSender<MuxStream>>,
    frame_tx: &mpsc::UnboundedSender<Frame>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    outstanding_ping: &mut Option<u64>,
    role: Role,
    cfg: &MuxConfig,
) -> bool {
    match frame {
        Frame::Open { id } => {
            let our_parity = match role {
                Role::Client => 1,
                Role::Server => 0,
            };
            if id % 2 == our_parity || streams.contains_key(&id) {
                warn!(stream_id = id, "peer opened stream with a bad id");
                let _ = frame_tx.send(Frame::Reset { id });
                return false;
            }
            let stream = create_stream(id, streams, frame_tx, cmd_tx, cfg);
            trace!(stream_id = id, "accepted stream");
            let delivered = accept_tx
                .as_ref()
                .map(|tx| tx.send(stream).is_ok())
                .unwrap_or(false);
            if !delivered {
                streams.remove(&id);
                let _ = frame_tx.send(Frame::Reset { id });
            }
        }
        Frame::Data { id, payload } => {
            if let Some(entry) = streams.get(&id) {
                // A failed send means the stream object is already dropped;
                // its StreamDropped command will reset the wire side.
                let _ = entry.event_tx.send(StreamEvent::Data(payload));
            }
        }
        Frame::Window { id, credit } => {
            if let Some(entry) = streams.get(&id) {
                entry
                    .shared
                    .send_window
                    .fetch_add(credit as usize, Ordering::AcqRel);
                entry.shared.send_waker.wake();
            }
        }
        Frame::Eof { id } => {
            if let Some(entry) = streams.get(&id) {
                let _ = entry.event_tx.send(StreamEvent::Eof);
            }
        }
        Frame::Reset { id } => {
            if let Some(entry) = streams.remove(&id) {
                entry.shared.reset.store(true, Ordering::Release);
                entry.shared.send_waker.wake();
            }
        }
        Frame::Ping { nonce } => {
            let _ = frame_tx.send(Frame::Pong { nonce });
        }
        Frame::Pong { nonce } => {
            if *outstanding_ping == Some(nonce) {
                *outstanding_ping = None;
            }
        }
        Frame::GoAway => {
            debug!("peer sent GOAWAY");
            return true;
        }
    }
    false
}

fn create_stream(
    id: u32,
    streams: &mut HashMap<u32, StreamEntry>,
    frame_tx: &mpsc::UnboundedSender<Frame>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    cfg: &MuxConfig,
) -> MuxStream {
    let shared = StreamShared::new(id);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    streams.insert(
        id,
        StreamEntry {
            shared: Arc::clone(&shared),
            event_tx,
        },
    );
    if cfg.receive_window > DEFAULT_WINDOW {
        let _ = frame_tx.send(Frame::Window {
            id,
            credit: (cfg.receive_window - DEFAULT_WINDOW) as u32,
        });
    }
    MuxStream::new(
        shared,
        frame_tx.clone(),
        cmd_tx.clone(),
        event_rx,
        cfg.max_frame_size,
    )
}

fn shutdown(
    streams: &mut HashMap<u32, StreamEntry>,
    closed: &AtomicBool,
    accept_tx: &mut Option<mpsc::UnboundedSender<MuxStream>>,
) {
    closed.store(true, Ordering::Release);
    accept_tx.take();
    for (_, entry) in streams.drain() {
        entry.shared.reset.store(true, Ordering::Release);
        entry.shared.send_waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{sleep, timeout};

    fn pair(cfg: MuxConfig) -> (Multiplexer, Multiplexer) {
        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let client = Multiplexer::new(client_io, Role::Client, cfg.clone());
        let server = Multiplexer::new(server_io, Role::Server, cfg);
        (client, server)
    }

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let (client, server) = pair(MuxConfig::default());

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"hello").await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn either_peer_may_open() {
        let (client, server) = pair(MuxConfig::default());

        let mut from_server = server.open_stream().await.unwrap();
        from_server.write_all(b"srv").await.unwrap();
        let mut at_client = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 3];
        at_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"srv");
    }

    #[tokio::test]
    async fn hundreds_of_concurrent_streams() {
        let (client, server) = pair(MuxConfig::default());
        let server = Arc::new(server);

        let echo_server = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                while let Ok(mut stream) = server.accept_stream().await {
                    tokio::spawn(async move {
                        let mut data = Vec::new();
                        stream.read_to_end(&mut data).await.unwrap();
                        stream.write_all(&data).await.unwrap();
                        stream.shutdown().await.unwrap();
                    });
                }
            })
        };

        let mut workers = Vec::new();
        let client = Arc::new(client);
        for i in 0..200u32 {
            let client = Arc::clone(&client);
            workers.push(tokio::spawn(async move {
                let payload = format!("stream-{i}").into_bytes();
                let mut stream = client.open_stream().await.unwrap();
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        echo_server.abort();
    }

    #[tokio::test]
    async fn flow_control_parks_the_writer_without_stalling_siblings() {
        let (client, server) = pair(MuxConfig::default());

        let mut blocked = client.open_stream().await.unwrap();
        let mut sink = server.accept_stream().await.unwrap();

        // Exhaust the receive window of the unread sibling...
        blocked.write_all(&vec![7u8; DEFAULT_WINDOW]).await.unwrap();
        let one_more = timeout(Duration::from_millis(100), blocked.write_all(&[7u8])).await;
        assert!(one_more.is_err(), "writer must park at a zero window");

        // ...while a second stream on the same connection keeps flowing.
        let mut side = client.open_stream().await.unwrap();
        side.write_all(b"ping").await.unwrap();
        let mut side_in = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        side_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Draining the slow stream replenishes the window and unparks.
        let mut drained = vec![0u8; DEFAULT_WINDOW];
        sink.read_exact(&mut drained).await.unwrap();
        timeout(Duration::from_secs(1), blocked.write_all(&[7u8]))
            .await
            .expect("window credit must wake the writer")
            .unwrap();
    }

    #[tokio::test]
    async fn keepalive_marks_unresponsive_peer_closed() {
        let (io, peer_io) = tokio::io::duplex(64 * 1024);
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            ..MuxConfig::default()
        };
        let mux = Multiplexer::new(io, Role::Client, cfg);
        // The peer end stays silent: never answers pings, never closes.
        let _held_open = peer_io;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !mux.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "keepalive should have tripped"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn close_cascades_to_streams_and_peer() {
        let (client, server) = pair(MuxConfig::default());

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        let _inbound = server.accept_stream().await.unwrap();

        client.close().await;
        assert!(client.is_closed());
        assert!(client.open_stream().await.is_err());

        // GOAWAY reaches the peer; its accept loop unblocks with an error.
        assert!(server.accept_stream().await.is_err());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !server.is_closed() {
            assert!(tokio::time::Instant::now() < deadline);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dropping_a_stream_resets_the_peer_side() {
        let (client, server) = pair(MuxConfig::default());

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        drop(stream);

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        let err = inbound.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn half_close_delivers_eof_but_keeps_the_return_path() {
        let (client, server) = pair(MuxConfig::default());

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"request").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        inbound.write_all(b"response").await.unwrap();
        inbound.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");
    }
}
