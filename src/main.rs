//! Solo Mining Client - Main Application
//!
//! Runs the orchestrator as a daemon with a logging listener in place of a
//! mining-thread manager.

use clap::Parser;
use solo_mining_client::{
    BlockTemplate, Config, ConnectionState, JobListener, Result, SoloClient, SubmitOutcome,
    APP_NAME, APP_VERSION,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Listener that logs job and submission activity.
///
/// A mining-thread manager embedding this crate implements `JobListener`
/// itself to hand jobs to its workers.
struct LogListener;

impl JobListener for LogListener {
    fn on_job(&self, template: Arc<BlockTemplate>) {
        info!(
            "{} (bits {:08x}, {} transactions)",
            template,
            template.header_bits,
            template.transactions.len() + 1
        );
    }

    fn on_submit_result(&self, request_id: u64, outcome: SubmitOutcome) {
        if outcome.accepted {
            info!("submission {request_id}: {outcome}");
        } else {
            warn!("submission {request_id}: {outcome}");
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        info!("connection state changed: {state}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    config.validate()?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: node={}, notify_port={}, poll_interval={}ms",
        config.node,
        config
            .notify_port
            .map_or_else(|| "disabled".to_string(), |p| p.to_string()),
        config.poll_interval_ms
    );

    let (client, handle) = SoloClient::new(config, Arc::new(LogListener))?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            handle.disconnect();
        }
    });

    client.run().await
}
