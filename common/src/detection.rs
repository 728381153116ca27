//! Data flowing through the pipeline: sampled frames, classifier results,
//! alarm candidates, recording commands and the sink-side alarm record.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::tiling::TileBox;

/// A frame forwarded by a stream worker.  Consumed exactly once by the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
}

/// Top-1 result of one classification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub class_id: i64,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl Detection {
    /// Whether this result qualifies for an alarm: confidence at or above
    /// `threshold` and, when an allow-list is given, a listed class.
    pub fn matches(&self, threshold: f64, allow: Option<&[String]>) -> bool {
        if self.confidence < threshold {
            return false;
        }
        match allow {
            Some(list) => list.iter().any(|c| c == &self.class_name),
            None => true,
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({:.4})",
            self.class_name, self.class_id, self.confidence
        )
    }
}

/// A qualifying detection, rate-limited per source by the dispatcher.
#[derive(Debug, Clone)]
pub struct AlarmCandidate {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub detection: Detection,
    /// Tile the detection came from; `None` for a full-frame match.
    pub tile: Option<TileBox>,
    pub image: Arc<RgbImage>,
}

impl AlarmCandidate {
    /// Structured log entry for the alarm log (never includes the image).
    pub fn log_entry(&self) -> AlarmLogEntry {
        AlarmLogEntry {
            source: self.source.clone(),
            ts: self.timestamp.to_rfc3339(),
            r#type: self.detection.class_name.clone(),
            class_id: self.detection.class_id,
            confidence: (self.detection.confidence * 10000.0).round() / 10000.0,
            details: "classification".into(),
            tile: self.tile,
        }
    }
}

/// One line of `alarm_log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmLogEntry {
    pub source: String,
    pub ts: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub class_id: i64,
    pub confidence: f64,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tile: Option<TileBox>,
}

/// Command sent from the evaluator to one stream worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordCommand {
    Start { duration: Duration },
    Stop,
}

/// Processing state of an alarm held by the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    #[default]
    Pending,
    Processing,
    Closed,
    Dismissed,
    AutoDismissed,
}

/// An alarm as stored by the sink.  Referenced by the similarity gate, not
/// owned by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub confidence: Option<f64>,
    pub image_url: Option<String>,
    /// Perceptual hash as 16 hex digits.
    pub image_hash: String,
    pub status: AlarmStatus,
}
