//! # Transport Helpers
//!
//! The session and multiplexer are transport-oblivious: both the plain TCP
//! connection and the WebSocket-wrapped variant come out of [`connect`] as
//! one boxed duplex byte stream. Only the connect helper differs.

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Connects to the server. `ws://` / `wss://` addresses take the WebSocket
/// upgrade path; anything else (with an optional `tcp://` prefix) is a
/// plain TCP dial.
pub async fn connect(server_addr: &str, dial_timeout: Duration) -> anyhow::Result<BoxedTransport> {
    if server_addr.starts_with("ws://") || server_addr.starts_with("wss://") {
        let (ws, response) = tokio::time::timeout(dial_timeout, connect_async(server_addr))
            .await
            .map_err(|_| anyhow::anyhow!("websocket connect to {server_addr} timed out"))??;
        debug!(status = %response.status(), "websocket transport established");
        return Ok(Box::new(WsTransport::new(ws)));
    }

    let addr = server_addr.strip_prefix("tcp://").unwrap_or(server_addr);
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))??;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// Binary-frame WebSocket as a duplex byte stream.
pub struct WsTransport<S> {
    inner: S,
    pending: Bytes,
    read_closed: bool,
}

impl<S> WsTransport<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            read_closed: false,
        }
    }
}

impl<S> AsyncRead for WsTransport<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
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
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(bytes))) => this.pending = bytes,
                Some(Ok(Message::Text(text))) => {
                    this.pending = Bytes::copy_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Some(Err(error)) => return Poll::Ready(Err(io::Error::other(error))),
            }
        }
    }
}

impl<S> AsyncWrite for WsTransport<S>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(_) => Poll::Ready(Ok(())),
        }
    }
}
