//! # `callstream-server`
//!
//! Serves the call orchestrator over HTTP and Server-Sent Events.
//!
//! ```bash
//! cargo run --bin callstream-server --release
//! ```

use callstream_server::server::{
    config::{CliArgs, ServerConfig},
    service::{handler::CallService, router},
    telemetry::init_telemetry,
};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry(config.log_json)?;

    let service = CallService::new(&config)?;
    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, &config);

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting call service on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting call service on {} (default tool '{}', max {} in-flight calls)",
            _addr,
            _config.default_tool,
            _config.orchestrator.max_inflight_calls
        );
    }
}

/// Resolves once a termination signal arrived and the orchestrator finished
/// its shutdown. Open SSE streams end with their calls' terminal events, which
/// lets the HTTP server drain its connections.
async fn shutdown_signal(service: CallService) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    service.shutdown().await;
}
