//! Best-effort delivery of alarms to the alarm sink.
//!
//! The evaluator only enqueues; a fixed number of worker threads drain the
//! bounded job queue and POST each alarm once.  A full queue drops the job,
//! a failed request is logged and forgotten.

use std::io::Cursor;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use image::{ImageFormat, RgbImage};
use reqwest::blocking::multipart::{Form, Part};
use tracing::{debug, info, warn};

use vigil_common::protocol::SinkResponse;
use vigil_common::runtime::{bump, PipelineStats, WorkerContext};
use vigil_common::similarity::ImageHash;

/// One alarm on its way to the sink.
#[derive(Debug, Clone)]
pub struct AlarmUpload {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub alarm_type: String,
    pub confidence: f64,
    pub device_id: String,
    pub image_hash: ImageHash,
    pub image: Arc<RgbImage>,
}

/// Producer handle of the upload job queue.
#[derive(Clone)]
pub struct UploadQueue {
    tx: Sender<AlarmUpload>,
    stats: Arc<PipelineStats>,
}

impl UploadQueue {
    pub fn new(tx: Sender<AlarmUpload>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    /// Enqueue without blocking.  Returns `false` if the job was dropped.
    pub fn submit(&self, job: AlarmUpload) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                bump(&self.stats.uploads_dropped);
                warn!("Upload queue full, alarm '{}' dropped", job.alarm_type);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                bump(&self.stats.uploads_dropped);
                debug!("Upload workers gone, alarm dropped");
                false
            }
        }
    }
}

/// HTTP client for `POST {base}/api/v1/alarms`.
#[derive(Clone)]
pub struct SinkClient {
    client: reqwest::blocking::Client,
    url: String,
}

impl SinkClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/api/v1/alarms", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send(&self, job: &AlarmUpload) -> Result<SinkResponse> {
        let jpeg = encode_jpeg(&job.image)?;
        let image = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .context("Bad image MIME type")?;
        let form = alarm_fields(job)
            .into_iter()
            .fold(Form::new(), |form, (k, v)| form.text(k, v))
            .part("image", image);

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .context("POST /api/v1/alarms")?;
        if !resp.status().is_success() {
            anyhow::bail!("POST {} returned {}", self.url, resp.status());
        }
        let body = resp.text().context("Read sink response")?;
        if body.trim().is_empty() {
            return Ok(SinkResponse::default());
        }
        serde_json::from_str(&body).context("Parse sink response JSON")
    }
}

/// Text fields of the multipart request.
fn alarm_fields(job: &AlarmUpload) -> Vec<(&'static str, String)> {
    vec![
        ("alarm_time", job.time.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("longitude", job.longitude.to_string()),
        ("latitude", job.latitude.to_string()),
        ("alarm_type", job.alarm_type.clone()),
        ("confidence", format!("{:.4}", job.confidence)),
        ("device_ip", job.device_id.clone()),
        ("image_hash", job.image_hash.to_hex()),
    ]
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .context("JPEG encoding failed")?;
    Ok(buf.into_inner())
}

/// Spawn `workers` threads serving `jobs` until shutdown or until every
/// queue handle is dropped.
pub fn spawn_workers(
    client: SinkClient,
    jobs: Receiver<AlarmUpload>,
    workers: usize,
    ctx: &WorkerContext,
) -> Result<Vec<JoinHandle<()>>> {
    info!("Uploading alarms to {} with {workers} worker(s)", client.url());
    (0..workers.max(1))
        .map(|i| {
            let client = client.clone();
            let jobs = jobs.clone();
            let ctx = ctx.with_span(tracing::info_span!("uploader", worker = i));
            std::thread::Builder::new()
                .name(format!("uploader-{i}"))
                .spawn(move || upload_loop(&client, &jobs, &ctx))
                .context("Cannot spawn uploader thread")
        })
        .collect()
}

fn upload_loop(client: &SinkClient, jobs: &Receiver<AlarmUpload>, ctx: &WorkerContext) {
    let _guard = ctx.span.enter();
    while !ctx.is_shutdown() {
        let job = match jobs.recv_timeout(Duration::from_millis(500)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match client.send(&job) {
            Ok(resp) => {
                bump(&ctx.stats.uploads_ok);
                if resp.duplicate {
                    info!("Alarm '{}' accepted as duplicate (id={:?})", job.alarm_type, resp.id);
                } else {
                    debug!("Alarm '{}' uploaded (id={:?})", job.alarm_type, resp.id);
                }
            }
            Err(e) => {
                bump(&ctx.stats.uploads_failed);
                warn!("Alarm upload failed: {e:#}");
            }
        }
    }
    debug!("Uploader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crossbeam_channel::bounded;

    fn job() -> AlarmUpload {
        let image = Arc::new(RgbImage::from_pixel(8, 8, image::Rgb([200, 40, 40])));
        AlarmUpload {
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            latitude: 29.5,
            longitude: 106.5,
            alarm_type: "crane".into(),
            confidence: 0.912345,
            device_id: "edge-7".into(),
            image_hash: ImageHash::of(&image),
            image,
        }
    }

    #[test]
    fn test_alarm_fields() {
        let fields = alarm_fields(&job());
        let get = |k: &str| fields.iter().find(|(n, _)| *n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("alarm_time"), Some("2024-05-01T12:30:00Z"));
        assert_eq!(get("confidence"), Some("0.9123"));
        assert_eq!(get("device_ip"), Some("edge-7"));
        assert_eq!(get("image_hash").map(str::len), Some(16));
    }

    #[test]
    fn test_jpeg_encoding() {
        let bytes = encode_jpeg(&job().image).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_full_queue_drops_job() {
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = bounded(1);
        let queue = UploadQueue::new(tx, stats.clone());
        assert!(queue.submit(job()));
        assert!(!queue.submit(job()));
        assert_eq!(stats.snapshot().uploads_dropped, 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_sink_url() {
        let client = SinkClient::new("http://backend:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(), "http://backend:8000/api/v1/alarms");
    }

    #[test]
    fn test_unreachable_sink_counts_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext::new(
            tracing::Span::none(),
            Arc::new(PipelineStats::default()),
            shutdown.clone(),
        );
        // nothing listens on port 9 of the loopback
        let client = SinkClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let (tx, rx) = bounded(4);
        let handles = spawn_workers(client, rx, 2, &ctx).unwrap();
        let queue = UploadQueue::new(tx, ctx.stats.clone());
        assert!(queue.submit(job()));
        drop(queue);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ctx.stats.snapshot().uploads_failed, 1);
        assert!(!shutdown.load(Ordering::Relaxed));
    }
}
