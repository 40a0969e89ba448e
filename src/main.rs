//! Process entry point. Configuration is env-driven (see `config.rs`);
//! there is no subcommand surface — one process, one archive directory,
//! one HTTP listener.

use std::net::SocketAddr;

use tracing::{error, info};
use zimi::config::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let auto_update = config.auto_update;
    let auto_update_freq = config.auto_update_freq;
    let port = config.port;

    let ctx = match zimi::build_app(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "failed to initialize application state");
            std::process::exit(1);
        }
    };

    if auto_update {
        ctx.downloads.clone().spawn_auto_update_scheduler(auto_update_freq.as_duration());
    }

    let app = zimi::http::build_router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(%addr, "zimi listening");
    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server exited with error");
    }
}

/// Waits for either SIGINT (Ctrl-C) or SIGTERM (container/orchestrator
/// stop) so in-flight requests and background workers get a chance to
/// finish their current unit of work before the process exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
