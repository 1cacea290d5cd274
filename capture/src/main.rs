//! plantcam – plant-monitoring camera appliance.
//!
//! This binary:
//! 1. Reads configuration from `plantcam.conf`
//! 2. Starts the notification thread and the run supervisor
//! 3. Serves the control API; runs (live stream + periodic soil checks)
//!    are started and stopped through it

mod camera;
mod control;
mod error;
mod frame;
mod lifecycle;
mod notify;
mod pages;
mod relay;
mod scoring;
mod sink;
mod state;
mod supervisor;
mod viewers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::camera::RpiCameraDriver;
use crate::lifecycle::Pipeline;
use crate::notify::NotifyQueue;
use crate::scoring::CommandScorer;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| plantcam_common::config::Config::default_path().to_string());
    let config = plantcam_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "plantcam starting ({}x{} @ {} fps, pages on {}, stream on {}, control on {})",
        config.width,
        config.height,
        config.framerate,
        config.http_addr(),
        config.ws_addr(),
        config.control_listen_addr
    );

    std::fs::create_dir_all(&config.picture_dir).context("Cannot create picture directory")?;

    // ── collaborators ────────────────────────────────────────────────
    let scorer = CommandScorer::from_config(&config)?;
    let queue = NotifyQueue::start(notify::from_config(&config)?)?;

    let pipeline = Arc::new(Pipeline::new(config, tokio::runtime::Handle::current()));
    let supervisor = Arc::new(Supervisor::new(
        pipeline.clone(),
        Arc::new(RpiCameraDriver),
        Box::new(scorer),
        queue.handle(),
    ));

    // ── ctrl-c / SIGTERM ─────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let state = pipeline.state().clone();
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            state.set_running(false);
            shutdown.cancel();
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── control API (runs until shutdown) ────────────────────────────
    let control_addr = pipeline.config().control_listen_addr.clone();
    if let Err(e) = control::run(supervisor.clone(), &control_addr, shutdown.clone()).await {
        error!("Control API error: {e:#}");
        shutdown.cancel();
    }

    // ── wind down the active run, then the notification queue ───────
    let _ = supervisor.stop();
    tokio::task::spawn_blocking(move || {
        supervisor.wait();
        drop(supervisor);
        queue.shutdown();
    })
    .await
    .context("Shutdown task failed")?;

    info!("plantcam stopped");
    Ok(())
}
