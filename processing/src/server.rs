//! Read-only status server polled by the device registry.
//!
//! Routes:
//!   GET /health                 → health check
//!   GET /api/v1/client/config   → live configuration
//!   GET /api/v1/client/device   → identity, configuration and telemetry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use vigil_common::config::Config;
use vigil_common::protocol::{DeviceInfo, DeviceReport, HealthResponse};
use vigil_common::runtime::PipelineStats;

use crate::telemetry::HostProbe;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    device_id: String,
    config: Arc<serde_json::Value>,
    stats: Arc<PipelineStats>,
    host: Arc<HostProbe>,
    start_time: Instant,
}

impl AppState {
    pub fn new(config: &Config, stats: Arc<PipelineStats>) -> Self {
        Self {
            device_id: config.device_id(),
            config: Arc::new(serde_json::to_value(config).unwrap_or_default()),
            stats,
            host: Arc::new(HostProbe::new()),
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/client/config", get(client_config))
        .route("/api/v1/client/device", get(client_device))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is set.
pub async fn run(state: AppState, listen_addr: &str, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status server listening on {listen_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    info!("Status server stopped");
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn client_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.as_ref().clone())
}

async fn client_device(State(state): State<AppState>) -> Json<DeviceReport> {
    let host = {
        let probe = state.host.clone();
        tokio::task::spawn_blocking(move || probe.snapshot())
            .await
            .unwrap_or_default()
    };
    Json(DeviceReport {
        device_id: state.device_id.clone(),
        device_config: state.config.as_ref().clone(),
        device_info: DeviceInfo {
            host,
            pipeline: state.stats.snapshot(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::runtime::bump;

    fn state() -> AppState {
        let config = vigil_common::config::parse(
            "[device]\nid = \"edge-7\"\n[[streams]]\nname = \"gate\"\nurl = \"rtsp://10.0.0.2/live\"\n",
        )
        .unwrap();
        let stats = Arc::new(PipelineStats::default());
        bump(&stats.triggers);
        AppState::new(&config, stats)
    }

    #[tokio::test]
    async fn test_health() {
        let Json(resp) = health(State(state())).await;
        assert_eq!(resp.status, "ok");
    }

    #[tokio::test]
    async fn test_config_is_served() {
        let Json(value) = client_config(State(state())).await;
        assert_eq!(value["streams"][0]["url"], "rtsp://10.0.0.2/live");
        assert_eq!(value["device"]["id"], "edge-7");
    }

    #[tokio::test]
    async fn test_device_report() {
        let Json(report) = client_device(State(state())).await;
        assert_eq!(report.device_id, "edge-7");
        assert_eq!(report.device_info.pipeline.triggers, 1);
        assert!(report.device_info.host.memory_total > 0);
        assert_eq!(report.device_config["streams"][0]["name"], "gate");
    }

    #[test]
    fn test_serves_over_http_until_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.spawn({
            let addr = addr.clone();
            let shutdown = shutdown.clone();
            async move { run(state(), &addr, shutdown).await }
        });

        let url = format!("http://{addr}/health");
        let mut body = None;
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(20));
            if let Ok(b) = reqwest::blocking::get(&url).and_then(|r| r.json::<HealthResponse>()) {
                body = Some(b);
                break;
            }
        }
        assert_eq!(body.unwrap().status, "ok");

        shutdown.store(true, Ordering::Relaxed);
        rt.block_on(server).unwrap().unwrap();
    }
}
