//! Client-side session management for MCP tool servers.
//!
//! A [`Registry`](mcp_client::Registry) owns named
//! [`Session`](mcp_client::Session)s, each wrapping one subprocess or
//! event-stream connection. Sessions connect lazily, share a single in-flight
//! connect between concurrent callers, and can disconnect themselves after an
//! idle window. The registry flattens every connected session's tools into
//! one `session::tool` namespace and reconciles against a desired config set.

pub mod logging;
pub mod mcp_client;

pub use logging::{data_dir, init_tracing, LogFormat, LogOptions};

/// Resolve when the process receives Ctrl-C (or SIGTERM on Unix).
///
/// Hosts await this and then call `Registry::shutdown()` so child processes
/// are not orphaned. Nothing in this crate installs signal handlers itself.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
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
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}
