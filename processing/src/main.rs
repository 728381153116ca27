//! Vigil edge pipeline – pulls frames from every configured camera,
//! classifies them in batches and turns repeated detections into alarms,
//! recordings and uploads.

mod dispatcher;
mod evaluator;
mod model;
mod pipeline;
mod server;
mod telemetry;
mod uploader;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vigil_common::config::Config;

use crate::model::Classifier;
use crate::pipeline::{Backends, Pipeline, JOIN_TIMEOUT};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        vigil_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Vigil starting (device={}, streams={}, status={})",
        config.device_id(),
        config.streams.len(),
        config.device.status_listen_addr
    );

    // ── load classifier ──────────────────────────────────────────────
    // tract can panic on unsupported operators.
    let load_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        model::load_classifier(&config.inference)
    }));
    let classifier: Option<Box<dyn Classifier>> = match load_result {
        Ok(Ok(Some(c))) => Some(Box::new(c)),
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            warn!("Cannot load classifier: {e:#}");
            None
        }
        Err(_) => {
            tracing::error!("Classifier panicked during loading – check the model file format");
            None
        }
    };

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        signal.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start pipeline ───────────────────────────────────────────────
    let backends = Backends::ffmpeg(&config, classifier);
    let pipeline = Pipeline::start(&config, backends, shutdown)?;

    // ── mDNS registration ────────────────────────────────────────────
    // Setting VIGIL_DISABLE_MDNS=1 skips mDNS where multicast is not
    // available (bridge networking, CI).
    let discovery = if !config.device.mdns || std::env::var("VIGIL_DISABLE_MDNS").is_ok() {
        info!("mDNS advertisement disabled");
        None
    } else {
        let port = config
            .device
            .status_listen_addr
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .unwrap_or(0);
        match vigil_common::discovery::register(port, &config.device_id()) {
            Ok(h) => {
                info!("mDNS: registered as {}", h.instance_name());
                Some(h)
            }
            Err(e) => {
                warn!("mDNS registration failed (non-fatal): {e:#}");
                None
            }
        }
    };

    pipeline.wait();
    let stats = pipeline.stats().clone();
    pipeline.stop(JOIN_TIMEOUT);
    info!("Final counters: {:?}", stats.snapshot());

    if let Some(dh) = discovery {
        dh.shutdown();
    }

    info!("Vigil stopped");
    Ok(())
}
