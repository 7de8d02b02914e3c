//! Control-plane handshake scenarios over an in-memory connection: the
//! client side here is a bare multiplexer plus codec, so every wire detail
//! is visible to the assertions.

use burrow_protocol::codec::FramedCodec;
use burrow_protocol::{
    Envelope, ErrorCode, HandshakeRequest, HandshakeResponse, MessageType, MuxConfig, Multiplexer,
    Role, Shutdown, TunnelConfig, TunnelState, PROTOCOL_VERSION,
};
use burrow_server::auth::StaticTokenAuth;
use burrow_server::config::{Limits, Timeouts};
use burrow_server::control::ControlPlane;
use burrow_server::registry::Registry;
use burrow_server::session::SessionState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn control_plane(reserved: Vec<String>) -> Arc<ControlPlane> {
    let registry = Arc::new(Registry::new("example.test", reserved, false));
    ControlPlane::new(
        registry,
        Arc::new(StaticTokenAuth::new(vec!["token-a".into(), "token-b".into()])),
        Limits {
            max_tunnels_per_connection: 4,
            ..Limits::default()
        },
        Timeouts::default(),
        CancellationToken::new(),
    )
}

/// Connects an in-memory client to the control plane and returns its
/// multiplexer.
fn connect(control: &Arc<ControlPlane>) -> Arc<Multiplexer> {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let control = Arc::clone(control);
    tokio::spawn(async move {
        control.handle_connection(server_io, "203.0.113.5:40000".to_owned()).await;
    });
    Arc::new(Multiplexer::new(client_io, Role::Client, MuxConfig::default()))
}

fn tunnel(subdomain: &str, port: u16) -> TunnelConfig {
    TunnelConfig {
        subdomain: subdomain.into(),
        local_port: port,
        local_host: String::new(),
        protocol: String::new(),
    }
}

fn handshake_request(token: &str, tunnels: Vec<TunnelConfig>) -> HandshakeRequest {
    HandshakeRequest {
        version: PROTOCOL_VERSION,
        token: token.into(),
        client_id: "test".into(),
        tunnels,
        capabilities: vec![],
    }
}

async fn exchange(mux: &Multiplexer, envelope: &Envelope) -> HandshakeResponse {
    let stream = mux.open_stream().await.expect("handshake stream");
    let framed = FramedCodec::from_stream(stream);
    let reply = framed
        .round_trip(envelope, MessageType::HandshakeResponse)
        .await
        .expect("handshake response");
    let _ = framed.shutdown().await;
    reply.payload_as().expect("response payload")
}

async fn handshake(mux: &Multiplexer, token: &str, tunnels: Vec<TunnelConfig>) -> HandshakeResponse {
    let envelope = Envelope::with_payload(
        MessageType::Handshake,
        &handshake_request(token, tunnels),
    )
    .unwrap()
    .with_request_id("hs-1");
    exchange(mux, &envelope).await
}

async fn wait_for_session(control: &Arc<ControlPlane>, session_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while control.get_session(session_id).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "session never appeared");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn happy_path_establishes_an_active_session() {
    let control = control_plane(vec![]);
    let mux = connect(&control);

    let response = handshake(&mux, "token-a", vec![tunnel("api", 3000)]).await;
    assert!(response.success);
    assert!(!response.session_id.is_empty());
    assert_eq!(response.server_version, PROTOCOL_VERSION);
    assert_eq!(response.tunnels.len(), 1);
    assert_eq!(response.tunnels[0].status, TunnelState::Active);
    assert_eq!(response.tunnels[0].public_url, "http://api.example.test");

    wait_for_session(&control, &response.session_id).await;
    let session = control.get_session(&response.session_id).unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert!(control.registry().lookup("api").await.is_some());
    let (sessions, tunnels) = control.registry().counts().await;
    assert_eq!((sessions, tunnels), (1, 1));
}

#[tokio::test]
async fn invalid_token_is_unauthorized_and_leaves_no_trace() {
    let control = control_plane(vec![]);
    let mux = connect(&control);

    let response = handshake(&mux, "wrong", vec![tunnel("api", 3000)]).await;
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::Unauthorized));

    let (sessions, tunnels) = control.registry().counts().await;
    assert_eq!((sessions, tunnels), (0, 0));
    assert_eq!(control.session_count(), 0);
}

#[tokio::test]
async fn first_message_must_be_a_handshake() {
    let control = control_plane(vec![]);
    let mux = connect(&control);

    let envelope = Envelope::new(MessageType::Ping).with_request_id("p-1");
    let response = exchange(&mux, &envelope).await;
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::ProtocolError));
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let control = control_plane(vec![]);
    let mux = connect(&control);

    let mut request = handshake_request("token-a", vec![tunnel("api", 3000)]);
    request.version = PROTOCOL_VERSION + 10;
    let envelope = Envelope::with_payload(MessageType::Handshake, &request).unwrap();
    let response = exchange(&mux, &envelope).await;
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::ProtocolError));
}

#[tokio::test]
async fn tunnel_limit_is_enforced() {
    let control = control_plane(vec![]);
    let mux = connect(&control);

    let tunnels = (0..5).map(|i| tunnel(&format!("app-{i}"), 3000 + i)).collect();
    let response = handshake(&mux, "token-a", tunnels).await;
    assert!(!response.success);
    assert_eq!(response.error_code, Some(ErrorCode::TunnelLimitReached));
}

#[tokio::test]
async fn collision_marks_only_the_taken_tunnel() {
    let control = control_plane(vec![]);

    let first = connect(&control);
    let response = handshake(&first, "token-a", vec![tunnel("web", 3000)]).await;
    assert!(response.success);
    let first_session = response.session_id;

    let second = connect(&control);
    let response = handshake(
        &second,
        "token-b",
        vec![tunnel("web", 4000), tunnel("docs", 4001)],
    )
    .await;

    // Top-level success with a per-tunnel error: callers must read the
    // status list, positionally aligned with the request.
    assert!(response.success);
    assert_eq!(response.tunnels.len(), 2);
    assert_eq!(response.tunnels[0].subdomain, "web");
    assert_eq!(response.tunnels[0].status, TunnelState::Error);
    assert_eq!(response.tunnels[0].error.as_deref(), Some("SUBDOMAIN_TAKEN"));
    assert_eq!(response.tunnels[1].subdomain, "docs");
    assert_eq!(response.tunnels[1].status, TunnelState::Active);
    assert_eq!(response.tunnels[1].public_url, "http://docs.example.test");

    let entry = control.registry().lookup("web").await.unwrap();
    assert_eq!(entry.session.id(), first_session);
}

#[tokio::test]
async fn reserved_only_handshake_fails_without_registering() {
    let control = control_plane(vec!["admin".into()]);
    let mux = connect(&control);

    let response = handshake(&mux, "token-a", vec![tunnel("admin", 8080)]).await;
    assert!(!response.success);
    assert_eq!(response.tunnels.len(), 1);
    assert_eq!(response.tunnels[0].status, TunnelState::Error);
    assert_eq!(response.tunnels[0].error.as_deref(), Some("SUBDOMAIN_RESERVED"));

    let (sessions, tunnels) = control.registry().counts().await;
    assert_eq!((sessions, tunnels), (0, 0));
}

#[tokio::test]
async fn add_and_remove_tunnel_on_a_live_session() {
    use burrow_protocol::{AddTunnel, RemoveTunnel, TunnelUpdate};

    let control = control_plane(vec![]);
    let mux = connect(&control);
    let response = handshake(&mux, "token-a", vec![tunnel("app", 3000)]).await;
    assert!(response.success);
    wait_for_session(&control, &response.session_id).await;

    // add_tunnel on a fresh client-opened stream
    let stream = mux.open_stream().await.unwrap();
    let framed = FramedCodec::from_stream(stream);
    let envelope = Envelope::with_payload(
        MessageType::AddTunnel,
        &AddTunnel { tunnels: vec![tunnel("extra", 3001)] },
    )
    .unwrap()
    .with_request_id("add-1");
    let reply = framed.round_trip(&envelope, MessageType::TunnelUpdate).await.unwrap();
    assert_eq!(reply.request_id, "add-1");
    let update: TunnelUpdate = reply.payload_as().unwrap();
    assert_eq!(update.tunnels.len(), 1);
    assert_eq!(update.tunnels[0].status, TunnelState::Active);
    assert!(control.registry().lookup("extra").await.is_some());

    // remove_tunnel
    let stream = mux.open_stream().await.unwrap();
    let framed = FramedCodec::from_stream(stream);
    let envelope = Envelope::with_payload(
        MessageType::RemoveTunnel,
        &RemoveTunnel { subdomain: "extra".into() },
    )
    .unwrap()
    .with_request_id("rm-1");
    let reply = framed.round_trip(&envelope, MessageType::TunnelUpdate).await.unwrap();
    let update: TunnelUpdate = reply.payload_as().unwrap();
    assert_eq!(update.tunnels.len(), 1, "only the original tunnel remains");
    assert!(control.registry().lookup("extra").await.is_none());
    assert!(control.registry().lookup("app").await.is_some());
}

#[tokio::test]
async fn broadcast_shutdown_reaches_every_session_first() {
    let control = control_plane(vec![]);

    let mut clients = Vec::new();
    for i in 0..3 {
        let mux = connect(&control);
        let response = handshake(&mux, "token-a", vec![tunnel(&format!("app-{i}"), 3000 + i)]).await;
        assert!(response.success);
        wait_for_session(&control, &response.session_id).await;
        clients.push(mux);
    }

    control.broadcast_shutdown("stop", 5000).await;

    for mux in &clients {
        let mut stream = tokio::time::timeout(Duration::from_secs(2), mux.accept_stream())
            .await
            .expect("shutdown stream must arrive")
            .expect("stream");
        let frame = burrow_protocol::codec::read_first_frame(&mut stream).await.unwrap();
        match frame {
            burrow_protocol::codec::FirstFrame::Control(envelope) => {
                assert_eq!(envelope.kind, MessageType::Shutdown);
                let shutdown: Shutdown = envelope.payload_as().unwrap();
                assert_eq!(shutdown.reason, "stop");
                assert_eq!(shutdown.grace_period_ms, 5000);
            }
            other => panic!("expected a shutdown envelope, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn connection_loss_unregisters_the_session() {
    let control = control_plane(vec![]);
    let mux = connect(&control);
    let response = handshake(&mux, "token-a", vec![tunnel("gone", 3000)]).await;
    assert!(response.success);
    wait_for_session(&control, &response.session_id).await;

    // Client goes away; the supervision loop notices the closed
    // multiplexer and cleans up registry and session map.
    mux.close().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let (sessions, tunnels) = control.registry().counts().await;
        if sessions == 0 && tunnels == 0 && control.session_count() == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never cleaned up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
