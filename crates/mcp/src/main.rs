use std::sync::{Arc, Mutex};

use aurum_core::portal::{PortalConfig, Session};
use aurum_mcp::AurumServer;
use rmcp::ServiceExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Create Session outside the tokio runtime: reqwest::blocking::Client has
    // its own internal runtime that panics if dropped inside another tokio
    // context.
    let config = PortalConfig::default();
    let session = Session::with_config(config)?;
    let session = Arc::new(Mutex::new(session));

    let server = AurumServer::with_session(session.clone());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let service = server.serve(rmcp::transport::stdio()).await?;
            service.waiting().await?;
            Ok::<(), Box<dyn std::error::Error>>(())
        })?;

    // Session's Arc drops here, outside tokio, where reqwest::blocking is safe
    drop(session);
    Ok(())
}
