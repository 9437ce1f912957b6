use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fixg_acceptor::{Acceptor, Application, RetryPolicy, SessionId, SessionSettings};

struct LoggingApp;

#[async_trait]
impl Application for LoggingApp {
    async fn on_logon(&self, session_id: &SessionId) {
        info!(session = %session_id, "logon");
    }

    async fn on_logout(&self, session_id: &SessionId) {
        info!(session = %session_id, "logout");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: acceptor <settings.json>")?;
    let settings = SessionSettings::from_path(&path)?;

    let acceptor = Acceptor::new(Arc::new(LoggingApp), &settings).await?;
    acceptor.start_with_retry(RetryPolicy::default()).await?;
    for addr in acceptor.local_addrs() {
        info!(endpoint = %addr, "accepting");
    }

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, logging out counterparties");
    acceptor.stop(false).await?;
    acceptor.dispose().await?;
    Ok(())
}
