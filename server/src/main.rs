//! Server entry point.
//!
//! Initializes logging, loads the configuration, starts the control-plane
//! listener and the public HTTP proxy, and drives a graceful shutdown on
//! ctrl-c: cancel listeners, broadcast `shutdown` to every client, close
//! sessions within the grace period.

use anyhow::Context as _;
use burrow_server::auth::{Authenticator, NoAuth, StaticTokenAuth};
use burrow_server::config::{AuthConfig, ServerConfig};
use burrow_server::control::ControlPlane;
use burrow_server::proxy::{self, ProxyState};
use burrow_server::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load(std::env::args().nth(1)).context("loading configuration")?;

    // Default log level comes from the config; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("burrow_server={}", config.log_level).into()),
        )
        .init();

    let registry = Arc::new(Registry::new(
        config.domain.clone(),
        config.reserved_subdomains.clone(),
        config.tls.enabled,
    ));
    let auth = build_authenticator(&config.auth)?;
    let cancel = CancellationToken::new();
    let control = ControlPlane::new(
        Arc::clone(&registry),
        auth,
        config.limits.clone(),
        config.timeouts.clone(),
        cancel.child_token(),
    );

    let control_listener = TcpListener::bind(&config.control_addr)
        .await
        .with_context(|| format!("binding control listener on {}", config.control_addr))?;
    info!("control plane listening on {}", config.control_addr);
    {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            control.run(control_listener).await;
        });
    }

    if config.tls.enabled {
        warn!("TLS termination is delegated to a fronting proxy; serving plain HTTP locally");
    }
    let proxy_state = Arc::new(ProxyState {
        control: Arc::clone(&control),
        registry: Arc::clone(&registry),
        limits: config.limits.clone(),
        timeouts: config.timeouts.clone(),
        tls: config.tls.enabled,
    });
    let app = proxy::router(proxy_state);
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding http listener on {}", config.http_addr))?;
    info!("http proxy listening on {} for *.{}", config.http_addr, config.domain);

    let http_cancel = cancel.clone();
    let http_server = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = async move { http_cancel.cancelled().await };
        if let Err(error) = axum::serve(http_listener, service)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(%error, "http server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    control
        .shutdown("server shutting down", Duration::from_millis(5000))
        .await;
    let _ = http_server.await;
    Ok(())
}

fn build_authenticator(config: &AuthConfig) -> anyhow::Result<Arc<dyn Authenticator>> {
    match config.mode.as_str() {
        "" | "none" => Ok(Arc::new(NoAuth)),
        // The JWT verifier is an external collaborator; both modes resolve
        // onto the token-file seam here.
        "token" | "jwt" => {
            anyhow::ensure!(
                !config.token_file.is_empty(),
                "auth.mode {:?} requires auth.token_file",
                config.mode
            );
            let auth = StaticTokenAuth::from_file(&config.token_file)
                .with_context(|| format!("reading token file {}", config.token_file))?;
            Ok(Arc::new(auth))
        }
        other => anyhow::bail!("unknown auth.mode {other:?}"),
    }
}
