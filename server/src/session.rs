//! # Session
//!
//! The server-side handle to one connected client: it owns the multiplexed
//! connection, the tunnels registered over it and a set of monotonic
//! counters. State moves strictly forward (`connecting → active → closing
//! → closed`) through compare-and-swap transitions, so `close()` is safe to
//! call from any task and only the first caller drives the teardown.

use burrow_protocol::codec;
use burrow_protocol::{MuxError, MuxStream, Multiplexer, ProtocolError, StreamHeader, TunnelConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Monotonically increasing per-session counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub requests_handled: AtomicU64,
    pub errors: AtomicU64,
}

pub struct Session {
    id: String,
    client_id: String,
    token: String,
    remote_addr: String,
    created_at: SystemTime,
    mux: Arc<Multiplexer>,
    tunnels: Mutex<HashMap<String, TunnelConfig>>,
    state: AtomicU8,
    /// Nanoseconds since `epoch`, bumped on every stream open/accept.
    last_activity: AtomicU64,
    epoch: Instant,
    metrics: SessionMetrics,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        client_id: String,
        token: String,
        remote_addr: String,
        mux: Arc<Multiplexer>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            client_id,
            token,
            remote_addr,
            created_at: SystemTime::now(),
            mux,
            tunnels: Mutex::new(HashMap::new()),
            state: AtomicU8::new(SessionState::Connecting as u8),
            last_activity: AtomicU64::new(0),
            epoch: Instant::now(),
            metrics: SessionMetrics::default(),
            cancel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomic forward-only transition.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `connecting → active`, flipped once the handshake response went out.
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Active)
    }

    pub fn is_connection_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn touch(&self) {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        self.last_activity.store(nanos, Ordering::Release);
    }

    pub fn idle_duration(&self) -> Duration {
        let last = Duration::from_nanos(self.last_activity.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Opens a fresh stream toward the client. Requires `active`.
    pub async fn open_stream(&self) -> Result<MuxStream, SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let stream = self.mux.open_stream().await?;
        self.touch();
        self.metrics.streams_opened.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Opens a stream and writes the stream header frame. The stream is
    /// closed before returning on any error, so a failed open never leaks a
    /// half-initialised stream to the client.
    pub async fn open_stream_with_header(
        &self,
        header: &StreamHeader,
    ) -> Result<MuxStream, SessionError> {
        header.validate()?;
        let mut stream = self.open_stream().await?;
        if let Err(e) = codec::write_stream_header(&mut stream, header).await {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            self.metrics.streams_closed.fetch_add(1, Ordering::Relaxed);
            let _ = stream.shutdown().await;
            return Err(e.into());
        }
        Ok(stream)
    }

    /// Waits for a client-opened stream (control messages ride on these).
    pub async fn accept_stream(&self) -> Result<MuxStream, SessionError> {
        let stream = self.mux.accept_stream().await?;
        self.touch();
        Ok(stream)
    }

    pub fn register_tunnel(&self, config: TunnelConfig) {
        let mut tunnels = self.tunnels.lock().expect("session tunnel lock");
        tunnels.insert(config.subdomain.clone(), config);
    }

    pub fn unregister_tunnel(&self, subdomain: &str) -> bool {
        let mut tunnels = self.tunnels.lock().expect("session tunnel lock");
        tunnels.remove(subdomain).is_some()
    }

    pub fn get_tunnel(&self, subdomain: &str) -> Option<TunnelConfig> {
        let tunnels = self.tunnels.lock().expect("session tunnel lock");
        tunnels.get(subdomain).cloned()
    }

    pub fn tunnels(&self) -> Vec<TunnelConfig> {
        let tunnels = self.tunnels.lock().expect("session tunnel lock");
        tunnels.values().cloned().collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().expect("session tunnel lock").len()
    }

    /// Idempotent teardown: the first caller moves the state to `closing`,
    /// closes the multiplexer (which resets every live stream) and settles
    /// on `closed`. Later callers return immediately.
    pub async fn close(&self) {
        loop {
            let current = self.state();
            if matches!(current, SessionState::Closing | SessionState::Closed) {
                return;
            }
            if self.transition(current, SessionState::Closing) {
                break;
            }
        }
        self.cancel.cancel();
        self.mux.close().await;
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{MuxConfig, Role};

    fn test_session() -> (Arc<Session>, Multiplexer) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let mux = Arc::new(Multiplexer::new(server_io, Role::Server, MuxConfig::default()));
        let peer = Multiplexer::new(client_io, Role::Client, MuxConfig::default());
        let session = Session::new(
            "dev".into(),
            "secret".into(),
            "127.0.0.1:9".into(),
            mux,
            CancellationToken::new(),
        );
        (session, peer)
    }

    #[tokio::test]
    async fn state_moves_forward_only() {
        let (session, _peer) = test_session();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.activate());
        assert!(!session.activate(), "second activation must fail the CAS");
        assert_eq!(session.state(), SessionState::Active);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        // close is idempotent
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn open_stream_requires_active() {
        let (session, _peer) = test_session();
        assert!(matches!(
            session.open_stream().await,
            Err(SessionError::NotActive)
        ));
        session.activate();
        let _stream = session.open_stream().await.unwrap();
        assert_eq!(session.metrics().streams_opened.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn header_stream_reaches_the_peer() {
        use burrow_protocol::{StreamHeader, StreamKind};
        let (session, peer) = test_session();
        session.activate();

        let header = StreamHeader {
            kind: StreamKind::Http,
            local_port: 3000,
            local_host: "127.0.0.1".into(),
            request_id: "r-1".into(),
            subdomain: "api".into(),
            remote_addr: None,
            host: None,
            method: None,
            path: None,
        };
        let _stream = session.open_stream_with_header(&header).await.unwrap();

        let mut inbound = peer.accept_stream().await.unwrap();
        let received = codec::read_stream_header(&mut inbound).await.unwrap();
        assert_eq!(received.request_id, "r-1");
    }

    #[tokio::test]
    async fn tunnel_map_round_trip() {
        let (session, _peer) = test_session();
        session.register_tunnel(TunnelConfig {
            subdomain: "api".into(),
            local_port: 3000,
            local_host: "127.0.0.1".into(),
            protocol: "http".into(),
        });
        assert!(session.get_tunnel("api").is_some());
        assert_eq!(session.tunnel_count(), 1);
        assert!(session.unregister_tunnel("api"));
        assert!(!session.unregister_tunnel("api"));
    }
}
