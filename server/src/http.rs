//! # HTTP Bridge
//!
//! Serialises an inbound public request onto a tunnel stream as raw
//! HTTP/1.1 bytes, parses the HTTP/1.1 response coming back and streams it
//! to the caller. WebSocket upgrades hijack the caller's connection and
//! degrade to a blind bidirectional copy.

use crate::session::Session;
use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, Response as HttpResponse, StatusCode, Version};
use axum::response::Response;
use burrow_protocol::MuxStream;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Case-insensitive `Connection: upgrade` + `Upgrade: websocket` check.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

/// First non-empty of: head of an existing `X-Forwarded-For`, `X-Real-IP`,
/// the peer address.
pub(crate) fn forwarded_for(headers: &HeaderMap, peer_ip: &str) -> String {
    if let Some(existing) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let head = existing.split(',').next().unwrap_or("").trim();
        if !head.is_empty() {
            return head.to_owned();
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.trim().is_empty() {
            return real_ip.trim().to_owned();
        }
    }
    peer_ip.to_owned()
}

/// Existing `X-Forwarded-Proto` wins, then the listener's scheme.
pub(crate) fn forwarded_proto(headers: &HeaderMap, tls: bool) -> String {
    if let Some(existing) = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        if !existing.trim().is_empty() {
            return existing.trim().to_owned();
        }
    }
    if tls { "https".into() } else { "http".into() }
}

/// Writes `METHOD request-URI HTTP/ver`, the original headers (minus the
/// forwarding headers we derive ourselves), a synthesised `Host` when the
/// original had none, and the blank-line terminator.
pub(crate) async fn write_request_head(
    stream: &mut MuxStream,
    parts: &Parts,
    fallback_host: &str,
    peer_ip: &str,
    tls: bool,
) -> io::Result<u64> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let version = match parts.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let mut head: Vec<u8> = Vec::with_capacity(512);
    head.extend_from_slice(format!("{} {} {}\r\n", parts.method, path, version).as_bytes());

    let mut has_host = false;
    for (name, value) in parts.headers.iter() {
        match name.as_str() {
            "x-forwarded-for" | "x-forwarded-proto" => continue,
            "host" => has_host = true,
            _ => {}
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !has_host {
        head.extend_from_slice(format!("host: {fallback_host}\r\n").as_bytes());
    }
    head.extend_from_slice(
        format!("x-forwarded-for: {}\r\n", forwarded_for(&parts.headers, peer_ip)).as_bytes(),
    );
    head.extend_from_slice(
        format!("x-forwarded-proto: {}\r\n", forwarded_proto(&parts.headers, tls)).as_bytes(),
    );
    head.extend_from_slice(b"\r\n");

    stream.write_all(&head).await?;
    Ok(head.len() as u64)
}

pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, Vec<u8>)>,
    /// Body bytes already pulled off the stream while hunting for the
    /// header terminator.
    pub(crate) leftover: Bytes,
}

/// Reads and parses the upstream HTTP/1.1 response head.
pub(crate) async fn read_response_head(stream: &mut MuxStream) -> anyhow::Result<ResponseHead> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head_len = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            anyhow::bail!("response headers exceed {MAX_RESPONSE_HEAD} bytes");
        }
        if stream.read_buf(&mut buf).await? == 0 {
            anyhow::bail!("upstream closed before sending response headers");
        }
    };

    let (status, headers) = {
        let mut header_storage = [httparse::EMPTY_HEADER; 100];
        let mut response = httparse::Response::new(&mut header_storage);
        match response.parse(&buf[..head_len]) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => anyhow::bail!("truncated response head"),
            Err(error) => anyhow::bail!("malformed response head: {error}"),
        }
        let status = response.code.ok_or_else(|| anyhow::anyhow!("response without status"))?;
        let headers: Vec<(String, Vec<u8>)> = response
            .headers
            .iter()
            .map(|h| (h.name.to_owned(), h.value.to_vec()))
            .collect();
        (status, headers)
    };

    let leftover = buf.split_off(head_len).freeze();
    Ok(ResponseHead { status, headers, leftover })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decodes a `Transfer-Encoding: chunked` body into plain bytes so the
/// caller-side connection can re-frame it. Trailers are consumed and
/// discarded.
pub(crate) struct ChunkedReader<R> {
    inner: R,
    buf: BytesMut,
    state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

impl<R> ChunkedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            state: ChunkState::Size,
        }
    }
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut chunk = [0u8; 8 * 1024];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        self.buf.extend_from_slice(read_buf.filled());
        Poll::Ready(Ok(n))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Size => {
                    if let Some(pos) = find_subsequence(&this.buf, b"\r\n") {
                        let line = this.buf.split_to(pos + 2);
                        let line = std::str::from_utf8(&line[..pos])
                            .map_err(|_| io::Error::other("non-ascii chunk size"))?;
                        let size_part = line.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_part, 16)
                            .map_err(|_| io::Error::other("bad chunk size"))?;
                        this.state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                        continue;
                    }
                    if ready!(this.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ChunkState::Data { remaining } => {
                    if !this.buf.is_empty() {
                        let take = (remaining.min(this.buf.len() as u64) as usize)
                            .min(out.remaining());
                        out.put_slice(&this.buf.split_to(take));
                        let left = remaining - take as u64;
                        this.state = if left == 0 {
                            ChunkState::DataEnd
                        } else {
                            ChunkState::Data { remaining: left }
                        };
                        return Poll::Ready(Ok(()));
                    }
                    if ready!(this.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ChunkState::DataEnd => {
                    if this.buf.len() >= 2 {
                        let _ = this.buf.split_to(2);
                        this.state = ChunkState::Size;
                        continue;
                    }
                    if ready!(this.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ChunkState::Trailers => {
                    if let Some(pos) = find_subsequence(&this.buf, b"\r\n") {
                        let line = this.buf.split_to(pos + 2);
                        if line.len() == 2 {
                            this.state = ChunkState::Done;
                        }
                        continue;
                    }
                    // Tolerate peers that end the stream right after the
                    // zero chunk without a trailer terminator.
                    if ready!(this.poll_fill(cx))? == 0 {
                        this.state = ChunkState::Done;
                        return Poll::Ready(Ok(()));
                    }
                }
            }
        }
    }
}

/// Bumps the session's closed-stream counter exactly once, wherever the
/// tunnel stream ends up dying (handler error path or body-stream drop).
pub(crate) struct StreamCloseGuard(pub(crate) Arc<Session>);

impl Drop for StreamCloseGuard {
    fn drop(&mut self) {
        self.0
            .metrics()
            .streams_closed
            .fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn status_response(status: StatusCode, message: &str) -> Response {
    HttpResponse::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_owned()))
        .expect("static response")
}

/// Builds the caller-facing response from a parsed upstream head, streaming
/// the rest of the tunnel stream as the body. Late body errors (resets,
/// broken pipes after the headers went out) end the stream silently.
pub(crate) fn streamed_response(
    head: ResponseHead,
    stream: MuxStream,
    session: Arc<Session>,
    request_id: String,
    close_guard: StreamCloseGuard,
) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::builder().status(status);

    let mut chunked = false;
    let mut content_length: Option<u64> = None;
    for (name, value) in &head.headers {
        match name.to_ascii_lowercase().as_str() {
            "transfer-encoding" => {
                chunked = std::str::from_utf8(value)
                    .map(|v| v.to_ascii_lowercase().contains("chunked"))
                    .unwrap_or(false);
                continue;
            }
            "connection" | "keep-alive" | "proxy-connection" | "upgrade" => continue,
            "content-length" => {
                content_length = std::str::from_utf8(value).ok().and_then(|v| v.trim().parse().ok());
            }
            _ => {}
        }
        builder = builder.header(name.as_str(), value.as_slice());
    }

    let raw = Cursor::new(head.leftover).chain(stream);
    let reader: Box<dyn AsyncRead + Send + Unpin> = if chunked {
        Box::new(ChunkedReader::new(raw))
    } else if let Some(length) = content_length {
        Box::new(raw.take(length))
    } else {
        Box::new(raw)
    };

    let body_stream = ReaderStream::new(reader)
        .map(move |chunk| {
            let _alive_until_body_ends = &close_guard;
            match &chunk {
                Ok(bytes) => {
                    session
                        .metrics()
                        .bytes_in
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Err(error) => {
                    debug!(%request_id, %error, "response body ended early");
                }
            }
            chunk
        })
        .take_while(|chunk| futures::future::ready(chunk.is_ok()));

    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY, "bad upstream response"))
}

/// Plain request/response exchange over the tunnel stream.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn bridge_http(
    req: axum::extract::Request,
    mut stream: MuxStream,
    fallback_host: String,
    peer_ip: String,
    tls: bool,
    session: Arc<Session>,
    request_id: String,
    request_timeout: Duration,
) -> Response {
    let close_guard = StreamCloseGuard(Arc::clone(&session));
    let (parts, body) = req.into_parts();

    match write_request_head(&mut stream, &parts, &fallback_host, &peer_ip, tls).await {
        Ok(written) => {
            session.metrics().bytes_out.fetch_add(written, Ordering::Relaxed);
        }
        Err(error) => {
            warn!(%request_id, %error, "writing request to tunnel failed");
            session.metrics().errors.fetch_add(1, Ordering::Relaxed);
            return status_response(StatusCode::BAD_GATEWAY, "tunnel write failed");
        }
    }

    let content_length: u64 = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    if content_length != 0 {
        let mut body_stream = body.into_data_stream();
        while let Some(chunk) = body_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        session.metrics().errors.fetch_add(1, Ordering::Relaxed);
                        return status_response(StatusCode::BAD_GATEWAY, "tunnel write failed");
                    }
                    session
                        .metrics()
                        .bytes_out
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Err(error) => {
                    debug!(%request_id, %error, "request body aborted by caller");
                    break;
                }
            }
        }
    }
    // Half-close toward the client; its worker propagates the EOF to the
    // local service so read-to-end responses terminate.
    let _ = stream.shutdown().await;

    let head = match tokio::time::timeout(request_timeout, read_response_head(&mut stream)).await {
        Ok(Ok(head)) => head,
        Ok(Err(error)) => {
            warn!(%request_id, %error, "bad upstream response");
            session.metrics().errors.fetch_add(1, Ordering::Relaxed);
            return status_response(StatusCode::BAD_GATEWAY, "bad upstream response");
        }
        Err(_) => {
            warn!(%request_id, "upstream response timed out");
            session.metrics().errors.fetch_add(1, Ordering::Relaxed);
            return status_response(StatusCode::BAD_GATEWAY, "upstream timeout");
        }
    };

    streamed_response(head, stream, session, request_id, close_guard)
}

/// WebSocket upgrade: forward the upgrade request, relay the 101 and then
/// run blind byte copies in both directions until either side closes.
pub(crate) async fn bridge_websocket(
    mut req: axum::extract::Request,
    mut stream: MuxStream,
    fallback_host: String,
    peer_ip: String,
    tls: bool,
    session: Arc<Session>,
    request_id: String,
) -> Response {
    let close_guard = StreamCloseGuard(Arc::clone(&session));
    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();

    if let Err(error) = write_request_head(&mut stream, &parts, &fallback_host, &peer_ip, tls).await {
        warn!(%request_id, %error, "writing upgrade request to tunnel failed");
        session.metrics().errors.fetch_add(1, Ordering::Relaxed);
        return status_response(StatusCode::BAD_GATEWAY, "tunnel write failed");
    }

    let head = match read_response_head(&mut stream).await {
        Ok(head) => head,
        Err(error) => {
            warn!(%request_id, %error, "bad upstream upgrade response");
            session.metrics().errors.fetch_add(1, Ordering::Relaxed);
            return status_response(StatusCode::BAD_GATEWAY, "bad upstream response");
        }
    };

    // The local service refused the upgrade: relay its answer as a plain
    // response instead of hijacking.
    if head.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        debug!(%request_id, status = head.status, "upstream declined websocket upgrade");
        return streamed_response(head, stream, session, request_id, close_guard);
    }

    let mut builder = HttpResponse::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &head.headers {
        builder = builder.header(name.as_str(), value.as_slice());
    }
    let response = match builder.body(Body::empty()) {
        Ok(response) => response,
        Err(_) => return status_response(StatusCode::BAD_GATEWAY, "bad upstream response"),
    };

    let leftover = head.leftover;
    tokio::spawn(async move {
        let _close_guard = close_guard;
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                debug!(%request_id, %error, "caller upgrade failed");
                return;
            }
        };
        let mut caller = TokioIo::new(upgraded);
        if !leftover.is_empty() && caller.write_all(&leftover).await.is_err() {
            return;
        }
        match tokio::io::copy_bidirectional(&mut caller, &mut stream).await {
            Ok((to_tunnel, from_tunnel)) => {
                session.metrics().bytes_out.fetch_add(to_tunnel, Ordering::Relaxed);
                session.metrics().bytes_in.fetch_add(from_tunnel, Ordering::Relaxed);
                debug!(%request_id, to_tunnel, from_tunnel, "websocket closed");
            }
            Err(error) => {
                debug!(%request_id, %error, "websocket relay ended");
            }
        }
    });
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn websocket_detection_is_case_insensitive() {
        assert!(is_websocket_upgrade(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "WebSocket"),
        ])));
        assert!(!is_websocket_upgrade(&headers(&[("connection", "upgrade")])));
        assert!(!is_websocket_upgrade(&headers(&[("upgrade", "websocket")])));
    }

    #[test]
    fn forwarded_for_precedence() {
        let peer = "198.51.100.7";
        assert_eq!(
            forwarded_for(&headers(&[("x-forwarded-for", "203.0.113.1, 10.0.0.1")]), peer),
            "203.0.113.1"
        );
        assert_eq!(
            forwarded_for(&headers(&[("x-real-ip", "203.0.113.2")]), peer),
            "203.0.113.2"
        );
        assert_eq!(forwarded_for(&headers(&[]), peer), peer);
    }

    #[test]
    fn forwarded_proto_prefers_existing_header() {
        assert_eq!(forwarded_proto(&headers(&[("x-forwarded-proto", "https")]), false), "https");
        assert_eq!(forwarded_proto(&headers(&[]), true), "https");
        assert_eq!(forwarded_proto(&headers(&[]), false), "http");
    }

    #[tokio::test]
    async fn chunked_reader_decodes_and_discards_trailers() {
        let encoded = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nx-done: 1\r\n\r\n";
        let mut reader = ChunkedReader::new(&encoded[..]);
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, b"Wikipedia");
    }

    #[tokio::test]
    async fn chunked_reader_rejects_garbage_sizes() {
        let encoded = b"zz\r\ndata\r\n";
        let mut reader = ChunkedReader::new(&encoded[..]);
        let mut decoded = Vec::new();
        assert!(reader.read_to_end(&mut decoded).await.is_err());
    }
}
