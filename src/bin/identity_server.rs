//! Identity reconciliation HTTP server
//!
//! Serves `POST /identify` over a persistent or in-memory contact store.

use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use identity_reconciler::config::{Command, ServerConfig, USAGE};
use identity_reconciler::storage::{open_database, ContactStore, InMemoryContactStore};
use identity_reconciler::transport::router;
use identity_reconciler::IdentityResolver;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match ServerConfig::load() {
        Ok(Command::Run(config)) => config,
        Ok(Command::Help) => {
            print!("{USAGE}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting identity-server");

    // The persistent store holds an exclusive directory lock for the process lifetime.
    let store: Arc<dyn ContactStore> = match &config.data_dir {
        Some(dir) => {
            tracing::info!(data_dir = %dir.display(), "opening contact database");
            Arc::new(open_database(dir, Some(config.persistent_config()))?)
        }
        None => {
            tracing::warn!("no data directory configured; contacts are kept in memory only");
            Arc::new(InMemoryContactStore::new())
        }
    };

    let resolver = Arc::new(IdentityResolver::with_config(
        Arc::clone(&store),
        config.resolver_config(),
    )?);
    let app = router(resolver);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    store.flush()?;
    tracing::info!("contact store flushed; shut down");
    Ok(())
}
