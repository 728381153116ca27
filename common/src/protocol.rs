//! HTTP protocol types shared between the pipeline, the alarm sink and the
//! device registry.

use serde::{Deserialize, Serialize};

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// Reply of the alarm sink to an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkResponse {
    #[serde(default)]
    pub id: Option<i64>,
    /// Set when the sink's similarity gate auto-dismissed the alarm.
    #[serde(default)]
    pub duplicate: bool,
}

/// Host resource snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostTelemetry {
    pub host_name: Option<String>,
    pub os: Option<String>,
    pub cpu_count: usize,
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
}

/// Counters reported by the running pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub classifications: u64,
    pub classification_failures: u64,
    pub candidates_emitted: u64,
    pub candidates_rate_limited: u64,
    pub triggers: u64,
    pub clips_written: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub uploads_dropped: u64,
}

/// Device-info payload: host telemetry plus pipeline counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host: HostTelemetry,
    pub pipeline: StatsSnapshot,
    pub uptime_secs: u64,
}

/// Body served to the device registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub device_config: serde_json::Value,
    pub device_info: DeviceInfo,
}
