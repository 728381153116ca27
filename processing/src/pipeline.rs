//! Orchestrator: wires stream workers, the dispatcher, the evaluator, the
//! upload workers and the status server together over bounded channels,
//! and stops them on the shared shutdown flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use tracing::{error, info, info_span, warn};

use vigil_capture::{
    ClipWriterFactory, FfmpegClipWriters, FfmpegConnector, FrameProducer, StreamConnector,
    StreamWorker, WorkerExit,
};
use vigil_common::config::{Config, StreamSource};
use vigil_common::runtime::{PipelineStats, WorkerContext};

use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::evaluator::{DeviceOrigin, Evaluator, EvaluatorOutputs};
use crate::model::Classifier;
use crate::server::{self, AppState};
use crate::uploader::{self, SinkClient, UploadQueue};

/// Per-group bound on how long [`Pipeline::stop`] waits for threads.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectorFn = Box<dyn Fn(&StreamSource) -> Box<dyn StreamConnector>>;
type WritersFn = Box<dyn Fn(&StreamSource) -> Box<dyn ClipWriterFactory>>;

/// The I/O implementations a pipeline runs with.
pub struct Backends {
    pub connector: ConnectorFn,
    pub writers: WritersFn,
    pub classifier: Option<Box<dyn Classifier>>,
}

impl Backends {
    /// ffmpeg for streams and clips.
    pub fn ffmpeg(config: &Config, classifier: Option<Box<dyn Classifier>>) -> Self {
        let clips = config.clips_dir();
        Self {
            connector: Box::new(|_| Box::new(FfmpegConnector)),
            writers: Box::new(move |_| Box::new(FfmpegClipWriters::new(clips.clone()))),
            classifier,
        }
    }
}

type Group<T> = Vec<(String, JoinHandle<T>)>;

pub struct Pipeline {
    streams: Group<WorkerExit>,
    dispatcher: Group<()>,
    evaluator: Group<()>,
    uploaders: Group<()>,
    status: Group<()>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Start every component.  Fails only on setup errors (output
    /// directories, thread spawning, HTTP client construction).
    pub fn start(config: &Config, backends: Backends, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let stats = Arc::new(PipelineStats::default());
        let root = WorkerContext::new(tracing::Span::none(), stats.clone(), shutdown.clone());

        for dir in [&config.device.outputs_dir, &config.clips_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }

        let sources = config.stream_sources();
        let (frame_tx, frame_rx) = bounded(config.queues.frame_queue_size);
        let (alarm_tx, alarm_rx) = bounded(config.alarm_queue_size());

        // ── stream workers ───────────────────────────────────────────────
        let mut commands = HashMap::new();
        let mut streams = Vec::with_capacity(sources.len());
        for source in &sources {
            let (cmd_tx, cmd_rx) = bounded(config.queues.command_queue_size);
            commands.insert(source.id.clone(), cmd_tx);

            let producer = FrameProducer::new(frame_tx.clone(), frame_rx.clone(), source.drop_policy);
            let ctx = root.with_span(info_span!("stream", source = %source.id));
            let worker = StreamWorker::new(
                source.clone(),
                (backends.connector)(source),
                (backends.writers)(source),
                producer,
                cmd_rx,
                ctx,
            )
            .with_snapshots(config.saved_frames_dir());
            let handle = std::thread::Builder::new()
                .name(format!("stream-{}", source.id))
                .spawn(move || {
                    let id = worker.source_id().to_string();
                    let exit = worker.run();
                    if let WorkerExit::RetriesExhausted { attempts } = exit {
                        error!("Stream '{id}' terminated after {attempts} failed connection attempts");
                    }
                    exit
                })
                .context("Cannot spawn stream worker")?;
            streams.push((source.id.clone(), handle));
        }
        drop(frame_tx);

        // ── dispatcher ───────────────────────────────────────────────────
        let dispatcher = Dispatcher::new(
            frame_rx,
            alarm_tx,
            backends.classifier,
            DispatchSettings::from_config(&config.inference),
            root.with_span(info_span!("dispatcher")),
        );
        let dispatcher = vec![(
            "dispatcher".to_string(),
            std::thread::Builder::new()
                .name("dispatcher".into())
                .spawn(move || dispatcher.run())
                .context("Cannot spawn dispatcher")?,
        )];

        // ── uploads ──────────────────────────────────────────────────────
        let mut uploaders = Vec::new();
        let uploads = match config.device.backend_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => {
                let client = SinkClient::new(url, Duration::from_secs(config.alarm.upload_timeout_secs))?;
                let (job_tx, job_rx) = bounded(config.alarm.upload_queue_size.max(1));
                let handles = uploader::spawn_workers(client, job_rx, config.alarm.upload_workers, &root)?;
                uploaders.extend(
                    handles
                        .into_iter()
                        .enumerate()
                        .map(|(i, h)| (format!("uploader-{i}"), h)),
                );
                Some(UploadQueue::new(job_tx, stats.clone()))
            }
            None => {
                info!("No backend_url configured, alarms stay local");
                None
            }
        };

        // ── evaluator ────────────────────────────────────────────────────
        let policies = sources
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), config.trigger_policy(i)))
            .collect();
        let outputs = EvaluatorOutputs {
            alarm_log: config.alarm_log_path(),
            frames_dir: config.alarm.save_pic.then(|| config.alarm_frames_dir()),
        };
        let origin = DeviceOrigin {
            device_id: config.device_id(),
            latitude: config.device.latitude,
            longitude: config.device.longitude,
        };
        let evaluator = Evaluator::new(
            alarm_rx,
            commands,
            policies,
            config.trigger_policy(usize::MAX),
            outputs,
            origin,
            uploads,
            root.with_span(info_span!("evaluator")),
        );
        let evaluator = vec![(
            "evaluator".to_string(),
            std::thread::Builder::new()
                .name("evaluator".into())
                .spawn(move || evaluator.run())
                .context("Cannot spawn evaluator")?,
        )];

        // ── status server ────────────────────────────────────────────────
        let state = AppState::new(config, stats.clone());
        let listen_addr = config.device.status_listen_addr.clone();
        let status_shutdown = shutdown.clone();
        let status_span = info_span!("status");
        let status = vec![(
            "status".to_string(),
            std::thread::Builder::new()
                .name("status".into())
                .spawn(move || {
                    let _guard = status_span.enter();
                    let rt = match tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(1)
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!("Cannot start status runtime: {e}");
                            return;
                        }
                    };
                    if let Err(e) = rt.block_on(server::run(state, &listen_addr, status_shutdown)) {
                        error!("Status server error: {e:#}");
                    }
                })
                .context("Cannot spawn status server")?,
        )];

        info!("Pipeline started with {} stream(s)", streams.len());
        Ok(Self {
            streams,
            dispatcher,
            evaluator,
            uploaders,
            status,
            shutdown,
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Stream workers that have not terminated.
    pub fn streams_running(&self) -> usize {
        self.streams.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Block until shutdown is requested or no stream worker is left.
    pub fn wait(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.streams_running() == 0 {
                warn!("No stream worker left running");
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Raise shutdown and join every group, producers first.  Returns the
    /// names of threads that did not finish within `timeout`.
    pub fn stop(self, timeout: Duration) -> Vec<String> {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut stragglers = Vec::new();
        stragglers.extend(join_group("stream", self.streams, timeout));
        stragglers.extend(join_group("dispatcher", self.dispatcher, timeout));
        stragglers.extend(join_group("evaluator", self.evaluator, timeout));
        stragglers.extend(join_group("uploader", self.uploaders, timeout));
        stragglers.extend(join_group("status", self.status, timeout));
        if stragglers.is_empty() {
            info!("Pipeline stopped");
        } else {
            warn!("Pipeline stopped, abandoned: {}", stragglers.join(", "));
        }
        stragglers
    }
}

/// Join `group` within one shared deadline; unfinished threads are left
/// detached and reported by name.
fn join_group<T>(label: &str, group: Group<T>, timeout: Duration) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline && group.iter().any(|(_, h)| !h.is_finished()) {
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut stragglers = Vec::new();
    for (name, handle) in group {
        if !handle.is_finished() {
            warn!("{label} thread '{name}' did not stop within {timeout:?}");
            stragglers.push(name);
            continue;
        }
        if handle.join().is_err() {
            error!("{label} thread '{name}' panicked");
        }
    }
    stragglers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    use image::RgbImage;
    use vigil_capture::{ClipWriter, FrameReader, StreamError, StreamInfo};

    use crate::dispatcher::tests::RedClassifier;

    /// `left` red frames, then end of stream.
    struct RedReader {
        left: u32,
    }

    impl FrameReader for RedReader {
        fn info(&self) -> StreamInfo {
            StreamInfo {
                width: 8,
                height: 8,
                fps: 20.0,
            }
        }

        fn read_frame(&mut self) -> Result<RgbImage, StreamError> {
            if self.left == 0 {
                return Err(StreamError::EndOfStream);
            }
            self.left -= 1;
            std::thread::sleep(Duration::from_millis(5));
            Ok(RgbImage::from_pixel(8, 8, image::Rgb([230, 10, 10])))
        }

        fn close(&mut self) {}
    }

    /// Refuses every `fail_every`-th connection attempt (0 = never).
    struct FlakyConnector {
        attempts: Arc<AtomicU32>,
        fail_every: u32,
        frames_per_connection: u32,
    }

    impl StreamConnector for FlakyConnector {
        fn connect(&mut self, url: &str) -> Result<Box<dyn FrameReader>, StreamError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(StreamError::Connect {
                    url: url.to_string(),
                    reason: format!("attempt {n} refused"),
                });
            }
            Ok(Box::new(RedReader {
                left: self.frames_per_connection,
            }))
        }
    }

    struct NoClips;

    impl ClipWriterFactory for NoClips {
        fn open(
            &mut self,
            _source: &str,
            _started: chrono::DateTime<chrono::Utc>,
            _info: StreamInfo,
        ) -> Result<Box<dyn ClipWriter>, StreamError> {
            Err(StreamError::Writer("disabled".into()))
        }
    }

    fn config(outputs: &std::path::Path) -> Config {
        let text = format!(
            r#"
[device]
id = "edge-test"
outputs_dir = "{}"
status_listen_addr = "127.0.0.1:0"
mdns = false

[inference]
min_emit_interval_ms = 0
batch_window_ms = 5

[alarm]
save_pic = false

[[streams]]
name = "north"
url = "rtsp://10.0.0.1/live"
fps_cap = 20
reconnect_delay_secs = 0.01
read_retry_delay_secs = 0.01

[[streams]]
name = "south"
url = "rtsp://10.0.0.2/live"
fps_cap = 20
reconnect_delay_secs = 0.01
read_retry_delay_secs = 0.01

[[streams]]
name = "gate"
url = "rtsp://10.0.0.3/live"
fps_cap = 20
reconnect_delay_secs = 0.01
read_retry_delay_secs = 0.01
"#,
            outputs.display()
        );
        vigil_common::config::parse(&text).unwrap()
    }

    fn logged_sources(path: PathBuf) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter_map(|v| v["source"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_recovers_from_refused_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let gate_attempts = Arc::new(AtomicU32::new(0));
        let attempts = gate_attempts.clone();

        let backends = Backends {
            connector: Box::new(move |source| {
                let flaky = source.id == "gate";
                Box::new(FlakyConnector {
                    attempts: if flaky { attempts.clone() } else { Arc::new(AtomicU32::new(0)) },
                    fail_every: if flaky { 3 } else { 0 },
                    frames_per_connection: if flaky { 4 } else { 1000 },
                })
            }),
            writers: Box::new(|_| Box::new(NoClips)),
            classifier: Some(Box::new(RedClassifier::new())),
        };
        let pipeline =
            Pipeline::start(&config, backends, Arc::new(AtomicBool::new(false))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while gate_attempts.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(gate_attempts.load(Ordering::SeqCst) >= 5);
        assert_eq!(pipeline.streams_running(), 3);

        let stats = pipeline.stats().clone();
        let stragglers = pipeline.stop(JOIN_TIMEOUT);
        assert!(stragglers.is_empty(), "abandoned: {stragglers:?}");

        let snap = stats.snapshot();
        // attempts 1, 2, 4 and 5 connected; every one after the first counts
        assert!(snap.reconnects >= 3);
        assert!(snap.classifications > 0);
        assert!(snap.candidates_emitted > 0);

        let sources = logged_sources(config.alarm_log_path());
        for id in ["north", "south", "gate"] {
            assert!(sources.iter().any(|s| s == id), "no alarm logged for {id}");
        }
    }

    #[test]
    fn test_wait_returns_when_every_stream_gave_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.streams.truncate(1);
        config.streams[0].max_retries = Some(1);

        let backends = Backends {
            connector: Box::new(|_| {
                Box::new(FlakyConnector {
                    attempts: Arc::new(AtomicU32::new(0)),
                    fail_every: 1,
                    frames_per_connection: 0,
                })
            }),
            writers: Box::new(|_| Box::new(NoClips)),
            classifier: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::start(&config, backends, shutdown.clone()).unwrap();
        pipeline.wait();
        assert_eq!(pipeline.streams_running(), 0);
        assert!(!shutdown.load(Ordering::Relaxed));
        assert!(pipeline.stop(JOIN_TIMEOUT).is_empty());
    }
}
