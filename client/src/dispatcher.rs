//! # Dispatcher
//!
//! Owns the client side of the tunnel: connects (TCP or WebSocket),
//! handshakes on the first stream, then accepts server-opened streams
//! forever. Every accepted stream starts with one frame — a stream header
//! for proxied requests, or a control envelope (e.g. `shutdown`) — and each
//! request stream is piped to a pooled local connection.

use crate::config::ClientConfig;
use crate::observer::{ClientState, Observers, RequestEvent, RequestInfo};
use crate::pool::PoolMap;
use crate::reconnect::Reconnector;
use crate::transport;
use burrow_protocol::codec::{self, FirstFrame, FramedCodec};
use burrow_protocol::{
    AddTunnel, Envelope, ErrorMessage, HandshakeRequest, HandshakeResponse, MessageType,
    MuxConfig, Multiplexer, RemoveTunnel, Role, Shutdown, StreamHeader, TunnelConfig, TunnelState,
    TunnelStatus, TunnelUpdate, PROTOCOL_VERSION,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct TunnelClient {
    config: ClientConfig,
    pools: PoolMap,
    observers: Observers,
    reconnector: Reconnector,
    state: Mutex<ClientState>,
    session_id: Mutex<Option<String>>,
    mux: tokio::sync::Mutex<Option<Arc<Multiplexer>>>,
    cancel: CancellationToken,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            pools: PoolMap::new(config.pool.clone()),
            observers: Observers::new(),
            reconnector: Reconnector::new(config.reconnect.clone()),
            state: Mutex::new(ClientState::Disconnected),
            session_id: Mutex::new(None),
            mux: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("state lock")
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session id lock").clone()
    }

    fn set_state(&self, state: ClientState) {
        {
            let mut current = self.state.lock().expect("state lock");
            if *current == state {
                return;
            }
            debug!(from = current.as_str(), to = state.as_str(), "state transition");
            *current = state;
        }
        self.observers.notify_state(state);
    }

    /// Connect, serve, reconnect — forever, or until the attempt budget is
    /// spent or [`TunnelClient::shutdown`] is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.set_state(ClientState::Connecting);
            if let Err(error) = Arc::clone(&self).connect_once().await {
                warn!(%error, "connection attempt failed");
            }
            self.set_state(ClientState::Disconnected);

            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if !self.config.reconnect.enabled {
                return Ok(());
            }
            let Some(delay) = self.reconnector.next_delay() else {
                anyhow::bail!(
                    "giving up after {} reconnect attempts",
                    self.config.reconnect.max_attempts
                );
            };
            info!(
                attempt = self.reconnector.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn connect_once(self: Arc<Self>) -> anyhow::Result<()> {
        info!(server = %self.config.server_addr, "connecting");
        let io = transport::connect(&self.config.server_addr, self.config.pool.dial_timeout())
            .await?;
        let mux = Arc::new(Multiplexer::new(io, Role::Client, MuxConfig::default()));

        let session_id = match self.handshake(&mux).await {
            Ok(session_id) => session_id,
            Err(error) => {
                mux.close().await;
                return Err(error);
            }
        };
        *self.session_id.lock().expect("session id lock") = Some(session_id.clone());
        *self.mux.lock().await = Some(Arc::clone(&mux));
        self.reconnector.reset();
        self.set_state(ClientState::Connected);
        info!(%session_id, "session established");

        // Single driver loop: every accepted stream gets its own worker.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = mux.accept_stream() => match accepted {
                    Ok(stream) => {
                        let client = Arc::clone(&self);
                        tokio::spawn(async move {
                            client.serve_stream(stream).await;
                        });
                    }
                    Err(_) => {
                        warn!("server connection lost");
                        break;
                    }
                }
            }
        }

        *self.mux.lock().await = None;
        mux.close().await;
        Ok(())
    }

    /// Opens the first stream, sends `handshake`, reads `handshake_response`
    /// and registers a pool for every tunnel that came up.
    async fn handshake(&self, mux: &Arc<Multiplexer>) -> anyhow::Result<String> {
        let stream = mux
            .open_stream()
            .await
            .map_err(|e| anyhow::anyhow!("opening handshake stream: {e}"))?;
        let framed = FramedCodec::from_stream(stream);

        let request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            token: self.config.token.clone(),
            client_id: self.config.client_id.clone(),
            tunnels: self.config.tunnels.clone(),
            capabilities: vec!["http".into(), "websocket".into()],
        };
        request.validate()?;
        let envelope = Envelope::with_payload(MessageType::Handshake, &request)?
            .with_request_id(Uuid::new_v4().to_string());
        let reply = framed
            .round_trip(&envelope, MessageType::HandshakeResponse)
            .await?;
        let _ = framed.shutdown().await;

        let response: HandshakeResponse = reply.payload_as()?;
        if !response.success {
            let code = response
                .error_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "ERROR".into());
            anyhow::bail!(
                "handshake rejected ({code}): {}",
                response.error.unwrap_or_default()
            );
        }

        // success=true only guarantees that *some* tunnel registered;
        // always inspect the per-tunnel statuses.
        for status in &response.tunnels {
            match status.status {
                TunnelState::Active => {
                    info!(subdomain = %status.subdomain, url = %status.public_url, "tunnel active");
                }
                _ => {
                    warn!(
                        subdomain = %status.subdomain,
                        error = status.error.as_deref().unwrap_or("unknown"),
                        "tunnel rejected"
                    );
                }
            }
        }
        for (tunnel, status) in self.config.tunnels.iter().zip(&response.tunnels) {
            if status.status == TunnelState::Active {
                self.pools
                    .register(tunnel.local_host_or_default(), tunnel.local_port)
                    .await;
            }
        }

        anyhow::ensure!(
            !response.session_id.is_empty(),
            "server did not assign a session id"
        );
        Ok(response.session_id)
    }

    async fn serve_stream(self: Arc<Self>, mut stream: burrow_protocol::MuxStream) {
        let first = match codec::read_first_frame(&mut stream).await {
            Ok(first) => first,
            Err(error) => {
                debug!(%error, "bad first frame on server-opened stream");
                return;
            }
        };
        match first {
            FirstFrame::Control(envelope) => self.handle_control(envelope, stream).await,
            FirstFrame::Header(header) => self.serve_request(header, stream).await,
        }
    }

    async fn handle_control(&self, envelope: Envelope, stream: burrow_protocol::MuxStream) {
        match envelope.kind {
            MessageType::Shutdown => {
                match envelope.payload_as::<Shutdown>() {
                    Ok(shutdown) => warn!(
                        reason = %shutdown.reason,
                        grace_ms = shutdown.grace_period_ms,
                        "server is shutting down"
                    ),
                    Err(_) => warn!("server is shutting down"),
                }
                // Nothing else to do: the reconnect loop takes over once
                // the connection actually drops.
            }
            MessageType::Ping => {
                let framed = FramedCodec::from_stream(stream);
                let pong = Envelope::new(MessageType::Pong).with_request_id(envelope.request_id);
                let _ = framed.write_message(&pong).await;
                let _ = framed.shutdown().await;
            }
            MessageType::Error => {
                if let Ok(message) = envelope.payload_as::<ErrorMessage>() {
                    error!(code = %message.code, message = %message.message, "server reported an error");
                }
            }
            other => debug!(kind = ?other, "ignoring control message"),
        }
    }

    /// One proxied request: pooled (or direct) local connection, blind
    /// bidirectional copy, half-closes propagated in both directions.
    async fn serve_request(&self, header: StreamHeader, mut stream: burrow_protocol::MuxStream) {
        if let Err(error) = header.validate() {
            debug!(%error, "invalid stream header");
            return;
        }
        let request_id = header.request_id.clone();
        debug!(
            %request_id,
            subdomain = %header.subdomain,
            port = header.local_port,
            "request stream accepted"
        );
        self.observers.notify_request(&RequestEvent::Started(RequestInfo {
            id: request_id.clone(),
            subdomain: header.subdomain.clone(),
            local_port: header.local_port,
            method: header.method.clone(),
            path: header.path.clone(),
            timestamp: unix_millis(),
        }));

        let host = if header.local_host.is_empty() {
            "127.0.0.1"
        } else {
            header.local_host.as_str()
        };
        match self.pools.get(host, header.local_port).await {
            Some(pool) => match pool.get().await {
                Ok(mut entry) => match copy_bidirectional(&mut stream, &mut entry.conn).await {
                    Ok((from_server, to_server)) => {
                        debug!(%request_id, from_server, to_server, "request finished");
                        pool.put(entry).await;
                    }
                    Err(error) => {
                        debug!(%request_id, %error, "request relay failed");
                        pool.discard(entry).await;
                    }
                },
                Err(error) => {
                    warn!(%request_id, %host, port = header.local_port, %error, "local service unavailable");
                }
            },
            None => {
                let addr = format!("{host}:{}", header.local_port);
                match tokio::time::timeout(
                    self.config.pool.dial_timeout(),
                    TcpStream::connect(&addr),
                )
                .await
                {
                    Ok(Ok(mut conn)) => {
                        let _ = conn.set_nodelay(true);
                        if let Err(error) = copy_bidirectional(&mut stream, &mut conn).await {
                            debug!(%request_id, %error, "request relay failed");
                        }
                    }
                    Ok(Err(error)) => warn!(%request_id, %addr, %error, "local dial failed"),
                    Err(_) => warn!(%request_id, %addr, "local dial timed out"),
                }
            }
        }

        let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
        self.observers
            .notify_request(&RequestEvent::Finished { id: request_id });
    }

    async fn current_mux(&self) -> anyhow::Result<Arc<Multiplexer>> {
        self.mux
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected"))
    }

    async fn control_round_trip(&self, envelope: Envelope) -> anyhow::Result<Envelope> {
        let mux = self.current_mux().await?;
        let stream = mux
            .open_stream()
            .await
            .map_err(|e| anyhow::anyhow!("opening control stream: {e}"))?;
        let framed = FramedCodec::from_stream(stream);
        framed.write_message(&envelope).await?;
        let reply = framed.read_message().await?;
        let _ = framed.shutdown().await;
        if reply.kind == MessageType::Error {
            let message: ErrorMessage = reply.payload_as()?;
            anyhow::bail!("{}: {}", message.code, message.message);
        }
        Ok(reply)
    }

    /// Registers an extra tunnel on the live session.
    pub async fn add_tunnel(&self, tunnel: TunnelConfig) -> anyhow::Result<Vec<TunnelStatus>> {
        tunnel.validate()?;
        let envelope = Envelope::with_payload(
            MessageType::AddTunnel,
            &AddTunnel { tunnels: vec![tunnel.clone()] },
        )?
        .with_request_id(Uuid::new_v4().to_string());
        let reply = self.control_round_trip(envelope).await?;
        anyhow::ensure!(
            reply.kind == MessageType::TunnelUpdate,
            "unexpected {:?} reply",
            reply.kind
        );
        let update: TunnelUpdate = reply.payload_as()?;
        let normalized = tunnel.normalized();
        let came_up = update
            .tunnels
            .iter()
            .any(|s| s.subdomain == normalized.subdomain && s.status == TunnelState::Active);
        if came_up {
            self.pools
                .register(tunnel.local_host_or_default(), tunnel.local_port)
                .await;
        }
        Ok(update.tunnels)
    }

    /// Removes a tunnel from the live session.
    pub async fn remove_tunnel(&self, subdomain: &str) -> anyhow::Result<Vec<TunnelStatus>> {
        let envelope = Envelope::with_payload(
            MessageType::RemoveTunnel,
            &RemoveTunnel { subdomain: subdomain.to_owned() },
        )?
        .with_request_id(Uuid::new_v4().to_string());
        let reply = self.control_round_trip(envelope).await?;
        anyhow::ensure!(
            reply.kind == MessageType::TunnelUpdate,
            "unexpected {:?} reply",
            reply.kind
        );
        let update: TunnelUpdate = reply.payload_as()?;
        Ok(update.tunnels)
    }

    /// Round-trip latency to the server over a fresh control stream.
    pub async fn ping(&self) -> anyhow::Result<Duration> {
        let started = Instant::now();
        let envelope = Envelope::new(MessageType::Ping).with_request_id(Uuid::new_v4().to_string());
        let reply = self.control_round_trip(envelope).await?;
        anyhow::ensure!(
            reply.kind == MessageType::Pong,
            "unexpected {:?} reply",
            reply.kind
        );
        Ok(started.elapsed())
    }

    /// Stops the run loop, tells the server goodbye and closes everything.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(mux) = self.mux.lock().await.take() {
            if let Ok(stream) = mux.open_stream().await {
                let framed = FramedCodec::from_stream(stream);
                if let Ok(envelope) = Envelope::with_payload(
                    MessageType::Shutdown,
                    &Shutdown {
                        reason: "client shutting down".into(),
                        grace_period_ms: 0,
                    },
                ) {
                    let _ = framed.write_message(&envelope).await;
                }
                let _ = framed.shutdown().await;
            }
            mux.close().await;
        }
        self.pools.close_all().await;
        self.set_state(ClientState::Disconnected);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
