//! Configuration parsing – reads a TOML file describing the device, the
//! inference settings, the alarm policy and one `[[streams]]` table per
//! camera.
//!
//! Every optional key has an explicit default.  [`Config::validate`] runs
//! before any worker starts; a validation error is fatal.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Startup-time misconfiguration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no [[streams]] configured")]
    NoStreams,
    #[error("stream #{0} has no url")]
    MissingUrl(usize),
    #[error("duplicate stream name '{0}'")]
    DuplicateStream(String),
    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub queues: QueueSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub alarm: AlarmSection,
    #[serde(default)]
    pub streams: Vec<StreamSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Device identity reported to the alarm sink.  Defaults to the host name.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
    #[serde(default = "default_status_listen_addr")]
    pub status_listen_addr: String,
    /// Base URL of the alarm sink.  No uploads when unset.
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default = "default_true")]
    pub mdns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,
    /// Defaults to four times the frame queue.
    #[serde(default)]
    pub alarm_queue_size: Option<usize>,
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
    /// Classifier input as `[width, height]`.
    #[serde(default = "default_input_size")]
    pub input_size: [u32; 2],
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f64,
    #[serde(default)]
    pub target_classes: Option<Vec<String>>,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_tile_count")]
    pub tile_count: usize,
    #[serde(default = "default_tile_overlap")]
    pub tile_overlap: f64,
    /// Region-of-interest offsets, as fractions of the frame height / width.
    #[serde(default)]
    pub roi_top: f64,
    #[serde(default)]
    pub roi_left: f64,
    #[serde(default = "default_min_emit_interval_ms")]
    pub min_emit_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSection {
    #[serde(default = "default_true")]
    pub save_pic: bool,
    #[serde(default)]
    pub save_video: bool,
    #[serde(default = "default_required_hits")]
    pub required_hits: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
    /// Recording length for a trigger.  Defaults to the cooldown.
    #[serde(default)]
    pub record_duration_secs: Option<f64>,
    #[serde(default)]
    pub trigger_types: Option<Vec<String>>,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,
    #[serde(default = "default_upload_queue_size")]
    pub upload_queue_size: usize,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_fps_cap")]
    pub fps_cap: f64,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: f64,
    #[serde(default = "default_read_retry_delay_secs")]
    pub read_retry_delay_secs: f64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides `[alarm].save_video` for this stream.
    #[serde(default)]
    pub save_video: Option<bool>,
    #[serde(default)]
    pub preroll_secs: f64,
    #[serde(default)]
    pub save_frames: bool,
    #[serde(default)]
    pub trigger: Option<TriggerOverride>,
}

/// Per-stream overrides of the `[alarm]` trigger settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerOverride {
    #[serde(default)]
    pub required_hits: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<f64>,
    #[serde(default)]
    pub record_duration_secs: Option<f64>,
    #[serde(default)]
    pub trigger_types: Option<Vec<String>>,
}

/// Backpressure behaviour when the shared frame queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict whatever is queued, then enqueue without blocking, so only the
    /// newest sampled frame is ever pending.
    #[default]
    #[serde(alias = "drop_old")]
    DropOldest,
    /// Wait up to a fixed timeout, then discard the frame.
    #[serde(alias = "block_with_timeout")]
    Block,
}

// ── resolved, immutable views ────────────────────────────────────────────

/// One camera, resolved from a `[[streams]]` table.  Immutable after start.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSource {
    pub id: String,
    pub url: String,
    pub fps_cap: f64,
    pub drop_policy: DropPolicy,
    pub reconnect_delay: Duration,
    pub read_retry_delay: Duration,
    pub max_retries: Option<u32>,
    pub recording: bool,
    pub preroll: Duration,
    pub save_frames: bool,
}

/// Hit-streak / cooldown policy for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPolicy {
    pub required_hits: u32,
    pub cooldown: Duration,
    pub record_duration: Duration,
    pub trigger_types: Option<HashSet<String>>,
    pub recording: bool,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/vigil/vigil.toml"
    }

    /// Device identity, falling back to the host name.
    pub fn device_id(&self) -> String {
        self.device
            .id
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "vigil".into())
    }

    pub fn alarm_queue_size(&self) -> usize {
        self.queues
            .alarm_queue_size
            .unwrap_or(self.queues.frame_queue_size * 4)
            .max(1)
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.device.outputs_dir.join("clips")
    }

    pub fn alarm_frames_dir(&self) -> PathBuf {
        self.device.outputs_dir.join("alarm_frames")
    }

    pub fn saved_frames_dir(&self) -> PathBuf {
        self.device.outputs_dir.join("save_frames")
    }

    pub fn alarm_log_path(&self) -> PathBuf {
        self.device.outputs_dir.join("alarm_log.jsonl")
    }

    /// Reject configurations no worker could run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }

        let mut names = BTreeSet::new();
        for (i, s) in self.streams.iter().enumerate() {
            if s.url.trim().is_empty() {
                return Err(ConfigError::MissingUrl(i + 1));
            }
            let id = stream_id(s, i);
            if !names.insert(id.clone()) {
                return Err(ConfigError::DuplicateStream(id));
            }
            check_range("fps_cap", s.fps_cap, f64::MIN_POSITIVE, f64::MAX)?;
            check_range("reconnect_delay_secs", s.reconnect_delay_secs, 0.0, f64::MAX)?;
            check_range("read_retry_delay_secs", s.read_retry_delay_secs, 0.0, f64::MAX)?;
            check_range("preroll_secs", s.preroll_secs, 0.0, f64::MAX)?;
            if let Some(t) = &s.trigger {
                if t.required_hits == Some(0) {
                    return Err(ConfigError::Zero("required_hits"));
                }
                if let Some(c) = t.cooldown_secs {
                    check_range("cooldown_secs", c, 0.0, f64::MAX)?;
                }
                if let Some(d) = t.record_duration_secs {
                    check_range("record_duration_secs", d, 0.0, f64::MAX)?;
                }
            }
        }

        let inf = &self.inference;
        check_range("conf_threshold", inf.conf_threshold, 0.0, 1.0)?;
        check_range("tile_overlap", inf.tile_overlap, 0.0, f64::MAX)?;
        check_range("roi_top", inf.roi_top, 0.0, 1.0)?;
        check_range("roi_left", inf.roi_left, 0.0, 1.0)?;
        if inf.max_batch_size == 0 {
            return Err(ConfigError::Zero("max_batch_size"));
        }
        if inf.tile_count == 0 {
            return Err(ConfigError::Zero("tile_count"));
        }
        if inf.input_size[0] == 0 || inf.input_size[1] == 0 {
            return Err(ConfigError::Zero("input_size"));
        }

        let alarm = &self.alarm;
        if alarm.required_hits == 0 {
            return Err(ConfigError::Zero("required_hits"));
        }
        check_range("cooldown_secs", alarm.cooldown_secs, 0.0, f64::MAX)?;
        if let Some(d) = alarm.record_duration_secs {
            check_range("record_duration_secs", d, 0.0, f64::MAX)?;
        }
        if alarm.upload_workers == 0 {
            return Err(ConfigError::Zero("upload_workers"));
        }
        if self.queues.frame_queue_size == 0 {
            return Err(ConfigError::Zero("frame_queue_size"));
        }
        if self.queues.command_queue_size == 0 {
            return Err(ConfigError::Zero("command_queue_size"));
        }
        Ok(())
    }

    /// Resolve every `[[streams]]` table into a [`StreamSource`].
    pub fn stream_sources(&self) -> Vec<StreamSource> {
        self.streams
            .iter()
            .enumerate()
            .map(|(i, s)| StreamSource {
                id: stream_id(s, i),
                url: s.url.trim().to_string(),
                fps_cap: s.fps_cap,
                drop_policy: s.drop_policy,
                reconnect_delay: secs(s.reconnect_delay_secs),
                read_retry_delay: secs(s.read_retry_delay_secs),
                max_retries: s.max_retries,
                recording: s.save_video.unwrap_or(self.alarm.save_video),
                preroll: secs(s.preroll_secs),
                save_frames: s.save_frames,
            })
            .collect()
    }

    /// Resolve the trigger policy for the stream at `index`, applying its
    /// `[streams.trigger]` overrides on top of `[alarm]`.
    pub fn trigger_policy(&self, index: usize) -> TriggerPolicy {
        let alarm = &self.alarm;
        let stream = self.streams.get(index);
        let over = stream.and_then(|s| s.trigger.clone()).unwrap_or_default();

        let cooldown = over.cooldown_secs.unwrap_or(alarm.cooldown_secs);
        let duration = over
            .record_duration_secs
            .or(alarm.record_duration_secs)
            .unwrap_or(cooldown);
        let types = over
            .trigger_types
            .or_else(|| alarm.trigger_types.clone())
            .map(|v| v.into_iter().map(|t| t.trim().to_string()).collect());

        TriggerPolicy {
            required_hits: over.required_hits.unwrap_or(alarm.required_hits).max(1),
            cooldown: secs(cooldown),
            record_duration: secs(duration),
            trigger_types: types,
            recording: stream
                .and_then(|s| s.save_video)
                .unwrap_or(alarm.save_video),
        }
    }
}

/// Read, parse and validate a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;
    let config = parse(&text).with_context(|| format!("Invalid config: {}", path.display()))?;
    info!(
        "Loaded config from {} ({} stream(s))",
        path.display(),
        config.streams.len()
    );
    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text).context("Malformed TOML")?;
    config.validate()?;
    Ok(config)
}

/// File name for an output written on behalf of `source` at `ts`:
/// `<source>_<YYYYmmdd_HHMMSS>[_mmm].<ext>`.  Characters that are unsafe in
/// file names are replaced with `_`.
pub fn output_file_name(
    source: &str,
    ts: chrono::DateTime<chrono::Utc>,
    millis: bool,
    ext: &str,
) -> String {
    let safe: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = if millis {
        ts.format("%Y%m%d_%H%M%S_%3f")
    } else {
        ts.format("%Y%m%d_%H%M%S")
    };
    format!("{safe}_{stamp}.{ext}")
}

fn stream_id(s: &StreamSection, index: usize) -> String {
    s.name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("cam{}", index + 1))
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Seconds to a `Duration`, saturating at `Duration::MAX`.  Negative and
/// NaN inputs become zero (validation rejects them first).
fn secs(v: f64) -> Duration {
    match Duration::try_from_secs_f64(v) {
        Ok(d) => d,
        Err(_) if v > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

// ── defaults ─────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_status_listen_addr() -> String {
    "0.0.0.0:9000".into()
}
fn default_frame_queue_size() -> usize {
    4
}
fn default_command_queue_size() -> usize {
    2
}
fn default_input_size() -> [u32; 2] {
    [640, 640]
}
fn default_conf_threshold() -> f64 {
    0.25
}
fn default_batch_window_ms() -> u64 {
    8
}
fn default_max_batch_size() -> usize {
    4
}
fn default_tile_count() -> usize {
    4
}
fn default_tile_overlap() -> f64 {
    0.05
}
fn default_min_emit_interval_ms() -> u64 {
    1500
}
fn default_required_hits() -> u32 {
    1
}
fn default_cooldown_secs() -> f64 {
    60.0
}
fn default_upload_workers() -> usize {
    3
}
fn default_upload_queue_size() -> usize {
    16
}
fn default_upload_timeout_secs() -> u64 {
    10
}
fn default_fps_cap() -> f64 {
    15.0
}
fn default_reconnect_delay_secs() -> f64 {
    5.0
}
fn default_read_retry_delay_secs() -> f64 {
    1.0
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: None,
            latitude: 0.0,
            longitude: 0.0,
            outputs_dir: default_outputs_dir(),
            status_listen_addr: default_status_listen_addr(),
            backend_url: None,
            mdns: true,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            frame_queue_size: default_frame_queue_size(),
            alarm_queue_size: None,
            command_queue_size: default_command_queue_size(),
        }
    }
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            model_path: None,
            labels_path: None,
            input_size: default_input_size(),
            conf_threshold: default_conf_threshold(),
            target_classes: None,
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            tile_count: default_tile_count(),
            tile_overlap: default_tile_overlap(),
            roi_top: 0.0,
            roi_left: 0.0,
            min_emit_interval_ms: default_min_emit_interval_ms(),
        }
    }
}

impl Default for AlarmSection {
    fn default() -> Self {
        Self {
            save_pic: true,
            save_video: false,
            required_hits: default_required_hits(),
            cooldown_secs: default_cooldown_secs(),
            record_duration_secs: None,
            trigger_types: None,
            upload_workers: default_upload_workers(),
            upload_queue_size: default_upload_queue_size(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[device]
id = "edge-7"
latitude = 29.5
longitude = 106.5
backend_url = "http://backend:8000"

[inference]
conf_threshold = 0.4
target_classes = ["excavator", "crane"]

[alarm]
save_video = true
required_hits = 3
cooldown_secs = 60
trigger_types = ["excavator"]

[[streams]]
name = "gate"
url = "rtsp://10.0.0.2/live"
fps_cap = 5
preroll_secs = 5

[[streams]]
url = "rtsp://10.0.0.3/live"
drop_policy = "block"
save_video = false

[streams.trigger]
required_hits = 1
cooldown_secs = 10
"#;

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.device_id(), "edge-7");
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.inference.max_batch_size, 4);
        assert_eq!(config.alarm_queue_size(), 16);
        assert_eq!(config.alarm_log_path(), PathBuf::from("outputs/alarm_log.jsonl"));
    }

    #[test]
    fn test_stream_sources_resolve_defaults() {
        let config = parse(SAMPLE).unwrap();
        let sources = config.stream_sources();
        assert_eq!(sources[0].id, "gate");
        assert_eq!(sources[0].drop_policy, DropPolicy::DropOldest);
        assert!(sources[0].recording);
        assert_eq!(sources[0].preroll, Duration::from_secs(5));
        assert_eq!(sources[0].reconnect_delay, Duration::from_secs(5));
        assert_eq!(sources[1].id, "cam2");
        assert_eq!(sources[1].drop_policy, DropPolicy::Block);
        assert!(!sources[1].recording);
    }

    #[test]
    fn test_trigger_policy_overrides() {
        let config = parse(SAMPLE).unwrap();
        let gate = config.trigger_policy(0);
        assert_eq!(gate.required_hits, 3);
        assert_eq!(gate.cooldown, Duration::from_secs(60));
        assert_eq!(gate.record_duration, Duration::from_secs(60));
        assert!(gate.trigger_types.unwrap().contains("excavator"));

        let second = config.trigger_policy(1);
        assert_eq!(second.required_hits, 1);
        assert_eq!(second.cooldown, Duration::from_secs(10));
        assert_eq!(second.record_duration, Duration::from_secs(10));
        assert!(!second.recording);
    }

    #[test]
    fn test_drop_old_alias() {
        let config = parse("[[streams]]\nurl = \"rtsp://x\"\ndrop_policy = \"drop_old\"\n").unwrap();
        assert_eq!(config.streams[0].drop_policy, DropPolicy::DropOldest);
    }

    #[test]
    fn test_rejects_missing_streams() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::NoStreams));
    }

    #[test]
    fn test_rejects_missing_url() {
        let config: Config = toml::from_str("[[streams]]\nname = \"a\"\n").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingUrl(1)));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let text = "[[streams]]\nname = \"a\"\nurl = \"x\"\n[[streams]]\nname = \"a\"\nurl = \"y\"\n";
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::DuplicateStream("a".into())));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let text = "[inference]\nconf_threshold = 1.5\n[[streams]]\nurl = \"x\"\n";
        let config: Config = toml::from_str(text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "conf_threshold", .. })
        ));
    }

    #[test]
    fn test_rejects_zero_required_hits() {
        let text = "[alarm]\nrequired_hits = 0\n[[streams]]\nurl = \"x\"\n";
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::Zero("required_hits")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.streams[0].url, "rtsp://10.0.0.2/live");
    }

    #[test]
    fn test_output_file_name() {
        use chrono::TimeZone;
        let ts = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            output_file_name("gate/north 1", ts, false, "mp4"),
            "gate_north_1_20240309_070501.mp4"
        );
        assert_eq!(
            output_file_name("cam1", ts, true, "jpg"),
            "cam1_20240309_070501_000.jpg"
        );
    }

    #[test]
    fn test_huge_durations_saturate() {
        assert_eq!(secs(1e30), Duration::MAX);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
        assert_eq!(secs(1.5), Duration::from_millis(1500));

        let text = SAMPLE.replace("cooldown_secs = 60", "cooldown_secs = 1e30");
        let config = parse(&text).unwrap();
        assert_eq!(config.trigger_policy(0).cooldown, Duration::MAX);
    }
}
