// Print server: prints uploaded PDFs, downloaded PDFs and rendered web pages.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use print_server::cli::Args;
use print_server::{
    platform_backend, ChromeRenderer, PageRenderer, PrintService, ServerManager, ServerState,
};

// Upper bound on draining in-flight requests at exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Shutdown Handling
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Resolves with the error once the listener fails.
async fn server_failure(mut states: watch::Receiver<ServerState>) -> String {
    loop {
        if let ServerState::Failed(reason) = &*states.borrow_and_update() {
            return reason.clone();
        }
        if states.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

fn io_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    error!("{}: {}", context, e);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = args
        .resolve_config()
        .map_err(|e| io_error("Configuration error", e))?;
    let yaml = serde_yaml::to_string(&config).map_err(|e| io_error("Configuration error", e))?;
    println!("{}", yaml);

    let renderer = Arc::new(ChromeRenderer::new(args.chrome_path.clone()));
    let service = PrintService::new(platform_backend(), renderer.clone());
    let manager = ServerManager::new(service);
    let states = manager.subscribe();

    let addr = manager
        .start(&config)
        .await
        .map_err(|e| io_error("Failed to start server", e))?;
    info!("Print server ready at {}://{}", config.scheme(), addr);

    let failure = tokio::select! {
        _ = shutdown_signal() => None,
        reason = server_failure(states) => Some(reason),
    };

    info!("Initiating graceful shutdown...");
    manager.shutdown(SHUTDOWN_GRACE).await;
    renderer.close();

    match failure {
        Some(reason) => Err(io_error("Server failed", reason)),
        None => {
            info!("Graceful shutdown complete");
            Ok(())
        }
    }
}
