//! Dispatcher behavior against a scripted server: handshake, request
//! streams piped to local services, direct dials for unpooled targets, and
//! control envelopes on server-opened streams.

use burrow_client::config::ClientConfig;
use burrow_client::dispatcher::TunnelClient;
use burrow_client::observer::{ClientState, RequestEvent};
use burrow_protocol::codec::{self, FramedCodec};
use burrow_protocol::{
    Envelope, HandshakeRequest, HandshakeResponse, MessageType, MuxConfig, Multiplexer, Role,
    Shutdown, StreamHeader, StreamKind, TunnelConfig, TunnelState, TunnelStatus, PROTOCOL_VERSION,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A minimal scripted server: accepts one mux connection at a time,
/// answers the handshake with all-active statuses and hands the live
/// multiplexer to the test body.
async fn mock_server() -> (String, mpsc::UnboundedReceiver<Arc<Multiplexer>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("tcp://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else { break };
            let mux = Arc::new(Multiplexer::new(conn, Role::Server, MuxConfig::default()));
            let stream = match mux.accept_stream().await {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            let framed = FramedCodec::from_stream(stream);
            let Ok(envelope) = framed.read_message().await else { continue };
            let Ok(request) = envelope.payload_as::<HandshakeRequest>() else { continue };
            let statuses = request
                .tunnels
                .iter()
                .map(|t| TunnelStatus {
                    subdomain: t.subdomain.clone(),
                    local_port: t.local_port,
                    public_url: format!("http://{}.example.test", t.subdomain),
                    status: TunnelState::Active,
                    error: None,
                })
                .collect();
            let response = HandshakeResponse {
                success: true,
                session_id: "mock-session-1".into(),
                tunnels: statuses,
                server_version: PROTOCOL_VERSION,
                error: None,
                error_code: None,
            };
            let reply = Envelope::with_payload(MessageType::HandshakeResponse, &response)
                .unwrap()
                .with_request_id(envelope.request_id);
            let _ = framed.write_message(&reply).await;
            let _ = framed.shutdown().await;
            let _ = tx.send(mux);
        }
    });
    (addr, rx)
}

/// Local TCP service answering `ping` with `pong`, then closing.
async fn ping_pong_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                    let _ = conn.write_all(b"pong").await;
                }
            });
        }
    });
    port
}

async fn wait_for(mut predicate: impl FnMut() -> bool, message: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(tokio::time::Instant::now() < deadline, "{message}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn client_for(addr: &str, subdomain: &str, local_port: u16) -> Arc<TunnelClient> {
    TunnelClient::new(ClientConfig {
        server_addr: addr.to_owned(),
        token: "t".into(),
        client_id: "test".into(),
        tunnels: vec![TunnelConfig {
            subdomain: subdomain.into(),
            local_port,
            local_host: String::new(),
            protocol: String::new(),
        }],
        ..ClientConfig::default()
    })
}

fn header(subdomain: &str, local_port: u16, request_id: &str) -> StreamHeader {
    StreamHeader {
        kind: StreamKind::Http,
        local_port,
        local_host: String::new(),
        request_id: request_id.into(),
        subdomain: subdomain.into(),
        remote_addr: Some("203.0.113.1:5000".into()),
        host: None,
        method: Some("GET".into()),
        path: Some("/".into()),
    }
}

#[tokio::test]
async fn request_streams_are_piped_to_the_local_service() {
    let (addr, mut servers) = mock_server().await;
    let port = ping_pong_service().await;
    let client = client_for(&addr, "svc", port);

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        client.observers().on_request(Arc::new(move |event| {
            let line = match event {
                RequestEvent::Started(info) => format!("start:{}", info.id),
                RequestEvent::Finished { id } => format!("done:{id}"),
            };
            events.lock().unwrap().push(line);
        }));
    }

    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = client.run().await;
        });
    }
    wait_for(|| client.state() == ClientState::Connected, "never connected").await;
    assert_eq!(client.session_id().as_deref(), Some("mock-session-1"));

    let server_mux = servers.recv().await.unwrap();
    let mut stream = server_mux.open_stream().await.unwrap();
    codec::write_stream_header(&mut stream, &header("svc", port, "req-1"))
        .await
        .unwrap();
    stream.write_all(b"ping").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong");

    wait_for(
        || events.lock().unwrap().len() == 2,
        "request observers never fired",
    )
    .await;
    assert_eq!(
        *events.lock().unwrap(),
        vec!["start:req-1".to_owned(), "done:req-1".to_owned()]
    );

    client.shutdown().await;
}

#[tokio::test]
async fn unpooled_targets_are_dialed_directly() {
    let (addr, mut servers) = mock_server().await;
    let pooled_port = ping_pong_service().await;
    // A second service the client never registered a tunnel for.
    let direct_port = ping_pong_service().await;
    let client = client_for(&addr, "svc", pooled_port);

    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = client.run().await;
        });
    }
    wait_for(|| client.state() == ClientState::Connected, "never connected").await;

    let server_mux = servers.recv().await.unwrap();
    let mut stream = server_mux.open_stream().await.unwrap();
    codec::write_stream_header(&mut stream, &header("other", direct_port, "req-2"))
        .await
        .unwrap();
    stream.write_all(b"ping").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong");

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_envelope_is_informational() {
    let (addr, mut servers) = mock_server().await;
    let port = ping_pong_service().await;
    let client = client_for(&addr, "svc", port);
    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = client.run().await;
        });
    }
    wait_for(|| client.state() == ClientState::Connected, "never connected").await;

    // A server-opened control stream whose first frame is an envelope, not
    // a stream header.
    let server_mux = servers.recv().await.unwrap();
    let stream = server_mux.open_stream().await.unwrap();
    let framed = FramedCodec::from_stream(stream);
    let envelope = Envelope::with_payload(
        MessageType::Shutdown,
        &Shutdown { reason: "maintenance".into(), grace_period_ms: 5000 },
    )
    .unwrap();
    framed.write_message(&envelope).await.unwrap();
    let _ = framed.shutdown().await;

    // The notice alone must not tear the session down; reconnection waits
    // for the connection to actually drop.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ClientState::Connected);

    client.shutdown().await;
}
