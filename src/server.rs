use std::net::SocketAddr;

use anyhow::{Context, Result};
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::stdio;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::service::DocsService;

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// In stdio mode stdout carries protocol frames, so logs go to stderr
/// without colors.
pub fn init_tracing(default_level: &str, stdio_mode: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if stdio_mode {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// serve MCP over SSE until ctrl-c
pub async fn start_sse_server(service: &DocsService, addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{addr}'"))?;
    let server = service.mcp_server();
    let ct = SseServer::serve(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?
        .with_service(move || server.clone());
    tracing::info!("MCP SSE server listening on http://{addr}/sse");

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");
    ct.cancel();
    Ok(())
}

// serve MCP over stdio until the client disconnects or ctrl-c
pub async fn start_stdio_server(service: &DocsService) -> Result<()> {
    tracing::info!("starting MCP stdio server");

    let running = service
        .mcp_server()
        .serve(stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("serving error: {:?}", e);
        })?;

    tokio::select! {
        quit = running.waiting() => {
            let reason = quit?;
            tracing::info!("MCP session ended: {reason:?}");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
        }
    }
    Ok(())
}
