//! # Control Plane
//!
//! Accepts client connections (raw TCP or the `/_tunnel` upgrade), performs
//! the handshake, owns the resulting sessions and supervises them until the
//! connection dies, the idle timeout fires or the server shuts down.

use crate::auth::Authenticator;
use crate::config::{Limits, Timeouts};
use crate::registry::{Registry, TunnelEntry};
use crate::session::{Session, SessionError};
use burrow_protocol::codec::FramedCodec;
use burrow_protocol::{
    AddTunnel, Envelope, ErrorCode, ErrorMessage, HandshakeRequest, HandshakeResponse,
    MessageType, MuxConfig, MuxStream, Multiplexer, RemoveTunnel, Role, Shutdown, StreamHeader,
    TunnelState, TunnelStatus, TunnelUpdate, PROTOCOL_VERSION,
};
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervision tick: idle checks and connection-liveness probes.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(30);

pub struct ControlPlane {
    registry: Arc<Registry>,
    auth: Arc<dyn Authenticator>,
    sessions: DashMap<String, Arc<Session>>,
    limits: Limits,
    timeouts: Timeouts,
    cancel: CancellationToken,
    /// Sessions hang off their own root so the ordered shutdown can close
    /// listeners and broadcast notifications before tearing sessions down.
    session_cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<dyn Authenticator>,
        limits: Limits,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth,
            sessions: DashMap::new(),
            limits,
            timeouts,
            cancel,
            session_cancel: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Accept loop for the raw TCP control listener. Exits when the server
    /// token is cancelled or the listener fails persistently.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        const MAX_CONSECUTIVE_ACCEPT_FAILURES: u32 = 5;
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("control listener closing");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        consecutive_failures = 0;
                        let _ = socket.set_nodelay(true);
                        let control = Arc::clone(&self);
                        tokio::spawn(async move {
                            control.handle_connection(socket, peer.to_string()).await;
                        });
                    }
                    Err(error) => {
                        consecutive_failures += 1;
                        error!(%error, "control accept failed");
                        if consecutive_failures >= MAX_CONSECUTIVE_ACCEPT_FAILURES {
                            error!("control listener giving up");
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Drives one client connection from handshake to teardown. Generic
    /// over the transport so the raw TCP listener and the WebSocket upgrade
    /// endpoint share the whole lifecycle.
    pub async fn handle_connection<T>(self: Arc<Self>, io: T, remote_addr: String)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!(%remote_addr, "client connected");
        let mux = Arc::new(Multiplexer::new(io, Role::Server, MuxConfig::default()));

        let handshake = tokio::time::timeout(
            self.timeouts.handshake(),
            self.do_handshake(&mux, &remote_addr),
        )
        .await;
        let session = match handshake {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => {
                debug!(%remote_addr, %error, "handshake failed");
                mux.close().await;
                return;
            }
            Err(_) => {
                warn!(%remote_addr, "handshake deadline exceeded");
                mux.close().await;
                return;
            }
        };

        self.supervise(session).await;
    }

    /// Handshake steps: accept the first stream, read one `handshake`
    /// envelope, validate, authenticate, enforce limits, register tunnels,
    /// answer, and only then activate the session. No error path here ever
    /// leaves residue in the registry.
    async fn do_handshake(
        &self,
        mux: &Arc<Multiplexer>,
        remote_addr: &str,
    ) -> anyhow::Result<Arc<Session>> {
        let stream = mux
            .accept_stream()
            .await
            .map_err(|e| anyhow::anyhow!("no handshake stream: {e}"))?;
        let codec = FramedCodec::from_stream(stream);

        let envelope = codec.read_message().await?;
        let request_id = envelope.request_id.clone();
        if envelope.kind != MessageType::Handshake {
            return Err(self
                .reject(&codec, &request_id, ErrorCode::ProtocolError, "expected a handshake message")
                .await);
        }

        let request: HandshakeRequest = match envelope.payload_as() {
            Ok(request) => request,
            Err(error) => {
                return Err(self
                    .reject(&codec, &request_id, ErrorCode::ProtocolError, &error.to_string())
                    .await);
            }
        };
        if let Err(error) = request.validate() {
            return Err(self
                .reject(&codec, &request_id, ErrorCode::ProtocolError, &error.to_string())
                .await);
        }
        if !burrow_protocol::is_version_supported(request.version) {
            let detail = format!(
                "protocol version {} unsupported (server speaks {})",
                request.version, PROTOCOL_VERSION
            );
            return Err(self
                .reject(&codec, &request_id, ErrorCode::ProtocolError, &detail)
                .await);
        }

        match self.auth.validate(&request.token).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self
                    .reject(&codec, &request_id, ErrorCode::Unauthorized, "invalid token")
                    .await);
            }
            Err(error) => {
                warn!(%remote_addr, %error, "authenticator failure");
                return Err(self
                    .reject(&codec, &request_id, ErrorCode::Unauthorized, "authentication unavailable")
                    .await);
            }
        }

        if request.tunnels.len() > self.limits.max_tunnels_per_connection {
            let detail = format!(
                "at most {} tunnels per connection",
                self.limits.max_tunnels_per_connection
            );
            return Err(self
                .reject(&codec, &request_id, ErrorCode::TunnelLimitReached, &detail)
                .await);
        }
        if self.limits.max_connections_per_user > 0 {
            let existing = self
                .sessions
                .iter()
                .filter(|entry| entry.value().token() == request.token)
                .count();
            if existing >= self.limits.max_connections_per_user {
                return Err(self
                    .reject(&codec, &request_id, ErrorCode::ConnectionLimit, "connection limit reached")
                    .await);
            }
        }

        let session = Session::new(
            request.client_id.clone(),
            request.token.clone(),
            remote_addr.to_owned(),
            Arc::clone(mux),
            self.session_cancel.child_token(),
        );
        let statuses = self.registry.register(&session, &request.tunnels).await;
        let active = statuses
            .iter()
            .filter(|s| s.status == TunnelState::Active)
            .count();

        if active == 0 {
            // The failed registration must not linger.
            self.registry.unregister(session.id()).await;
            let response = HandshakeResponse {
                success: false,
                session_id: String::new(),
                tunnels: statuses,
                server_version: PROTOCOL_VERSION,
                error: Some("no tunnels could be registered".into()),
                error_code: None,
            };
            let _ = self
                .send_handshake_response(&codec, &request_id, &response)
                .await;
            anyhow::bail!("no tunnels registered");
        }

        let response = HandshakeResponse {
            success: true,
            session_id: session.id().to_owned(),
            tunnels: statuses,
            server_version: PROTOCOL_VERSION,
            error: None,
            error_code: None,
        };
        if let Err(error) = self
            .send_handshake_response(&codec, &request_id, &response)
            .await
        {
            self.registry.unregister(session.id()).await;
            anyhow::bail!("handshake response failed: {error}");
        }
        let _ = codec.shutdown().await;

        session.activate();
        self.sessions
            .insert(session.id().to_owned(), Arc::clone(&session));
        info!(
            session_id = %session.id(),
            client_id = %session.client_id(),
            %remote_addr,
            tunnels = active,
            "session established"
        );
        Ok(session)
    }

    async fn send_handshake_response<R, W>(
        &self,
        codec: &FramedCodec<R, W>,
        request_id: &str,
        response: &HandshakeResponse,
    ) -> Result<(), burrow_protocol::ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let envelope = Envelope::with_payload(MessageType::HandshakeResponse, response)?
            .with_request_id(request_id);
        codec.write_message(&envelope).await
    }

    /// Best-effort handshake failure reply; returns the error to bubble up.
    async fn reject<R, W>(
        &self,
        codec: &FramedCodec<R, W>,
        request_id: &str,
        code: ErrorCode,
        detail: &str,
    ) -> anyhow::Error
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let response = HandshakeResponse {
            success: false,
            session_id: String::new(),
            tunnels: Vec::new(),
            server_version: PROTOCOL_VERSION,
            error: Some(detail.to_owned()),
            error_code: Some(code),
        };
        let _ = self
            .send_handshake_response(codec, request_id, &response)
            .await;
        let _ = codec.shutdown().await;
        anyhow::anyhow!("{code}: {detail}")
    }

    /// Per-session supervision: serves client-opened control streams,
    /// enforces the idle timeout and notices connection loss.
    async fn supervise(self: Arc<Self>, session: Arc<Session>) {
        let mut tick = tokio::time::interval(SUPERVISION_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = tick.tick() => {
                    if session.is_connection_closed() {
                        debug!(session_id = %session.id(), "connection gone");
                        break;
                    }
                    if let Some(idle_timeout) = self.timeouts.idle() {
                        let idle = session.idle_duration();
                        if idle >= idle_timeout {
                            info!(session_id = %session.id(), idle_secs = idle.as_secs(), "idle timeout");
                            break;
                        }
                    }
                }
                accepted = session.accept_stream() => match accepted {
                    Ok(stream) => {
                        let control = Arc::clone(&self);
                        let session = Arc::clone(&session);
                        tokio::spawn(async move {
                            control.serve_control_stream(session, stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        }

        self.remove_session(&session).await;
    }

    async fn remove_session(&self, session: &Arc<Session>) {
        info!(session_id = %session.id(), "session closing");
        self.registry.unregister(session.id()).await;
        self.sessions.remove(session.id());
        session.close().await;
    }

    /// One client-opened stream carrying a single control exchange.
    async fn serve_control_stream(self: Arc<Self>, session: Arc<Session>, stream: MuxStream) {
        let codec = FramedCodec::from_stream(stream);
        let envelope = match codec.read_message().await {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(session_id = %session.id(), %error, "bad control stream");
                session.metrics().errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let request_id = envelope.request_id.clone();

        let reply = match envelope.kind {
            MessageType::Ping => Ok(Envelope::new(MessageType::Pong)),
            MessageType::AddTunnel => self.handle_add_tunnel(&session, &envelope).await,
            MessageType::RemoveTunnel => self.handle_remove_tunnel(&session, &envelope).await,
            MessageType::Shutdown => {
                info!(session_id = %session.id(), "client requested shutdown");
                self.remove_session(&session).await;
                return;
            }
            other => {
                debug!(session_id = %session.id(), kind = ?other, "unexpected control message");
                Err((ErrorCode::ProtocolError, format!("unexpected {other:?}")))
            }
        };

        let envelope = match reply {
            Ok(envelope) => envelope,
            Err((code, message)) => {
                session.metrics().errors.fetch_add(1, Ordering::Relaxed);
                match Envelope::with_payload(MessageType::Error, &ErrorMessage { code, message }) {
                    Ok(envelope) => envelope,
                    Err(_) => return,
                }
            }
        };
        let _ = codec.write_message(&envelope.with_request_id(request_id)).await;
        let _ = codec.shutdown().await;
    }

    async fn handle_add_tunnel(
        &self,
        session: &Arc<Session>,
        envelope: &Envelope,
    ) -> Result<Envelope, (ErrorCode, String)> {
        let request: AddTunnel = envelope
            .payload_as()
            .map_err(|e| (ErrorCode::ProtocolError, e.to_string()))?;
        for tunnel in &request.tunnels {
            tunnel
                .validate()
                .map_err(|e| (ErrorCode::ProtocolError, e.to_string()))?;
        }
        if session.tunnel_count() + request.tunnels.len() > self.limits.max_tunnels_per_connection {
            return Err((
                ErrorCode::TunnelLimitReached,
                format!(
                    "at most {} tunnels per connection",
                    self.limits.max_tunnels_per_connection
                ),
            ));
        }
        let statuses = self.registry.register(session, &request.tunnels).await;
        Envelope::with_payload(MessageType::TunnelUpdate, &TunnelUpdate { tunnels: statuses })
            .map_err(|e| (ErrorCode::InternalError, e.to_string()))
    }

    async fn handle_remove_tunnel(
        &self,
        session: &Arc<Session>,
        envelope: &Envelope,
    ) -> Result<Envelope, (ErrorCode, String)> {
        let request: RemoveTunnel = envelope
            .payload_as()
            .map_err(|e| (ErrorCode::ProtocolError, e.to_string()))?;
        self.registry
            .unregister_tunnel(session.id(), &request.subdomain)
            .await
            .map_err(|e| (e.code(), e.to_string()))?;
        let remaining = session
            .tunnels()
            .into_iter()
            .map(|config| TunnelStatus {
                public_url: self
                    .registry
                    .build_url(&config.subdomain, config.protocol_or_default()),
                subdomain: config.subdomain,
                local_port: config.local_port,
                status: TunnelState::Active,
                error: None,
            })
            .collect();
        Envelope::with_payload(MessageType::TunnelUpdate, &TunnelUpdate { tunnels: remaining })
            .map_err(|e| (ErrorCode::InternalError, e.to_string()))
    }

    /// Opens a tunnel stream for one inbound public request and hands it to
    /// the HTTP proxy.
    pub async fn proxy_request(
        &self,
        entry: &TunnelEntry,
        header: StreamHeader,
    ) -> Result<MuxStream, SessionError> {
        let stream = entry.session.open_stream_with_header(&header).await?;
        entry
            .session
            .metrics()
            .requests_handled
            .fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Best-effort shutdown notification: one fresh control stream per
    /// active session, in parallel; failures are swallowed.
    pub async fn broadcast_shutdown(&self, reason: &str, grace_period_ms: u64) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(count = sessions.len(), %reason, "broadcasting shutdown");

        let notifications = sessions.into_iter().map(|session| {
            let reason = reason.to_owned();
            async move {
                let Ok(stream) = session.open_stream().await else {
                    return;
                };
                let codec = FramedCodec::from_stream(stream);
                let Ok(envelope) = Envelope::with_payload(
                    MessageType::Shutdown,
                    &Shutdown { reason, grace_period_ms },
                ) else {
                    return;
                };
                let _ = codec.write_message(&envelope).await;
                let _ = codec.shutdown().await;
            }
        });
        futures::future::join_all(notifications).await;
    }

    /// Ordered teardown: stop accepting, notify every client, then cancel
    /// the session root and wait out the grace period for the supervision
    /// loops to drain.
    pub async fn shutdown(&self, reason: &str, grace: Duration) {
        self.cancel.cancel();
        self.broadcast_shutdown(reason, grace.as_millis() as u64).await;
        self.session_cancel.cancel();

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let closing = futures::future::join_all(sessions.iter().map(|session| async move {
            self.registry.unregister(session.id()).await;
            session.close().await;
        }));
        if tokio::time::timeout(grace, closing).await.is_err() {
            warn!("graceful shutdown window elapsed with sessions remaining");
        }
        self.sessions.clear();
    }
}
