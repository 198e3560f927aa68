use std::net::SocketAddr;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::error::{Error, Result};

/// Window assignment, the watermark and the accumulator together turn an at-least-once stream of
/// log lines into exactly one compressed artifact per window batch:
/// - Read messages from the queue, attaching an ack handle to each
/// - Assign each message to its fixed window and buffer it in the window's book
/// - Close windows on the watermark, max open duration or lag bound, after a grace period
/// - Compress and write closed batches, then ack their messages
mod error;

mod config;

mod compression;
mod message;
mod window;

/// Decides when windows close.
mod watermark;

mod accumulator;
mod sinker;
mod source;

mod pipeline;

mod metrics;

/// Loads the settings from the environment and runs the pipeline until SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    let settings = config::Settings::load()?;
    let cln_token = CancellationToken::new();

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_https_server(metrics_addr).await {
            error!(?e, "Metrics server failed");
        }
    });

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = pipeline::start_pipeline(&settings, cln_token).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    match &result {
        Ok(()) => info!("Gracefully Exiting..."),
        Err(e) => error!(?e, "Pipeline failed"),
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
