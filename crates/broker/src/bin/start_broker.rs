//! Broker daemon
//!
//! Starts the downstream pool, binds the rendezvous Unix socket, and serves
//! sessions until a termination signal arrives. Exits non-zero when the
//! config or JWT key material cannot be loaded; a clean signal-driven
//! shutdown exits zero.
//!
//! Usage:
//!   start_broker
//!   MCP_CONFIG_PATH=/etc/mcp/config.json start_broker

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcp_broker::mcp::{ClientManager, SupervisorSettings, ToolAggregator};
use mcp_broker::server::{run_session, BrokerServer};
use mcp_broker::{BrokerConfig, JwtVerifier};

#[tokio::main]
async fn main() -> ExitCode {
    // Sessions own stdout; all diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match BrokerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        servers = config.servers.len(),
        require_auth = config.require_auth,
        "starting broker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let verifier = {
        let key_path = config.jwt_public_key_path_or_default();
        match JwtVerifier::from_pem_file(&key_path) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) if config.require_auth => {
                tracing::error!(path = %key_path.display(), error = %e, "failed to load JWT public key");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                tracing::warn!(
                    path = %key_path.display(),
                    error = %e,
                    "no JWT public key, authentication unavailable"
                );
                None
            }
        }
    };

    let manager = ClientManager::new(config.servers.clone(), SupervisorSettings::default());
    manager.clone().start_all().await;
    tracing::info!(live = manager.live_servers().await.len(), "downstream pool started");

    let aggregator = Arc::new(ToolAggregator::new(manager.clone()));
    let server = Arc::new(BrokerServer::new(
        aggregator,
        verifier,
        config.require_auth,
    ));

    let socket_path = config.socket_path_or_default();
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(path = %socket_path.display(), error = %e, "failed to bind socket");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(path = %socket_path.display(), "listening for sessions");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            run_session(server, reader, writer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    // Sessions die with the listener; the pool is torn down last.
    drop(listener);
    manager.shutdown_all().await;
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("broker stopped");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
