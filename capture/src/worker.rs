//! Per-camera worker: `Disconnected → Connecting → Connected`, with a
//! nested recording sub-state owned by [`Recorder`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use image::RgbImage;
use tracing::{debug, error, info, warn};

use vigil_common::config::{output_file_name, StreamSource};
use vigil_common::detection::{FrameSample, RecordCommand};
use vigil_common::runtime::{add, bump, WorkerContext};

use crate::producer::{Enqueued, FrameProducer};
use crate::recorder::Recorder;
use crate::source::{ClipWriterFactory, FrameReader, StreamConnector, StreamInfo};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    /// Consecutive failed connection attempts exceeded `max_retries`.
    RetriesExhausted { attempts: u32 },
}

enum Disconnect {
    ReadFailed,
    Shutdown,
}

/// Every `interval`-th frame is forwarded: `round(native / cap)`, at least 1.
pub fn sampling_interval(native_fps: f64, fps_cap: f64) -> u64 {
    if !native_fps.is_finite() || !fps_cap.is_finite() || native_fps <= 0.0 || fps_cap <= 0.0 {
        return 1;
    }
    ((native_fps / fps_cap).round() as u64).max(1)
}

pub struct StreamWorker {
    source: StreamSource,
    connector: Box<dyn StreamConnector>,
    producer: FrameProducer,
    commands: Receiver<RecordCommand>,
    recorder: Recorder,
    /// Set when sampled frames are also saved as JPEG.
    snapshots_dir: Option<PathBuf>,
    ctx: WorkerContext,
}

impl StreamWorker {
    pub fn new(
        source: StreamSource,
        connector: Box<dyn StreamConnector>,
        writers: Box<dyn ClipWriterFactory>,
        producer: FrameProducer,
        commands: Receiver<RecordCommand>,
        ctx: WorkerContext,
    ) -> Self {
        let recorder = Recorder::new(
            &source.id,
            source.recording,
            source.preroll,
            writers,
            ctx.stats.clone(),
        );
        Self {
            source,
            connector,
            producer,
            commands,
            recorder,
            snapshots_dir: None,
            ctx,
        }
    }

    /// Save every sampled frame under `dir` when the source asks for it.
    pub fn with_snapshots(mut self, dir: PathBuf) -> Self {
        if self.source.save_frames {
            self.snapshots_dir = Some(dir);
        }
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }

    /// Run until shutdown or retry exhaustion.
    pub fn run(mut self) -> WorkerExit {
        let span = self.ctx.span.clone();
        let _guard = span.enter();
        info!(
            "Stream worker started (fps_cap={}, policy={:?}, recording={})",
            self.source.fps_cap, self.source.drop_policy, self.source.recording
        );

        let mut failures: u32 = 0;
        let mut connected_once = false;
        let exit = loop {
            if self.ctx.is_shutdown() {
                break WorkerExit::Shutdown;
            }

            let mut reader = match self.connector.connect(&self.source.url) {
                Ok(r) => r,
                Err(e) => {
                    failures += 1;
                    warn!("Connection attempt {failures} failed: {e}");
                    if let Some(max) = self.source.max_retries {
                        if failures > max {
                            error!("Giving up after {failures} failed attempts");
                            break WorkerExit::RetriesExhausted { attempts: failures };
                        }
                    }
                    if !self.ctx.sleep(self.source.reconnect_delay) {
                        break WorkerExit::Shutdown;
                    }
                    continue;
                }
            };

            if connected_once {
                bump(&self.ctx.stats.reconnects);
            }
            connected_once = true;
            failures = 0;
            self.recorder.reset_preroll();

            let outcome = self.read_loop(reader.as_mut());
            reader.close();
            self.recorder.finish();

            match outcome {
                Disconnect::Shutdown => break WorkerExit::Shutdown,
                Disconnect::ReadFailed => {
                    if !self.ctx.sleep(self.source.read_retry_delay) {
                        break WorkerExit::Shutdown;
                    }
                }
            }
        };

        self.recorder.finish();
        info!("Stream worker stopped: {exit:?}");
        exit
    }

    fn read_loop(&mut self, reader: &mut dyn FrameReader) -> Disconnect {
        let info = reader.info();
        let interval = sampling_interval(info.fps, self.source.fps_cap);
        info!(
            "Connected ({}x{} @ {:.2} fps, forwarding every {interval} frame(s))",
            info.width, info.height, info.fps
        );

        let mut counter: u64 = 0;
        loop {
            if self.ctx.is_shutdown() {
                return Disconnect::Shutdown;
            }
            let frame = match reader.read_frame() {
                Ok(f) => f,
                Err(e) => {
                    warn!("Stream read failed: {e}");
                    return Disconnect::ReadFailed;
                }
            };
            counter += 1;
            let forward = counter % interval == 0;
            self.process_frame(frame, Utc::now(), info, forward);
        }
    }

    /// One read cycle for a decoded frame.
    pub fn process_frame(
        &mut self,
        frame: RgbImage,
        now: DateTime<Utc>,
        info: StreamInfo,
        forward: bool,
    ) {
        bump(&self.ctx.stats.frames_read);
        let image = Arc::new(frame);

        if forward {
            bump(&self.ctx.stats.frames_sampled);
            self.save_snapshot(&image, now);
            let sample = FrameSample {
                source: self.source.id.clone(),
                captured_at: now,
                image: image.clone(),
            };
            match self.producer.send(sample) {
                Enqueued::Sent => {}
                Enqueued::Replaced(n) => add(&self.ctx.stats.frames_dropped, n as u64),
                Enqueued::Dropped => bump(&self.ctx.stats.frames_dropped),
            }
        }

        if let Ok(cmd) = self.commands.try_recv() {
            debug!("Command received: {cmd:?}");
            self.recorder.handle_command(cmd, now);
        }
        self.recorder.on_frame(&image, now, info);
    }

    fn save_snapshot(&self, image: &RgbImage, now: DateTime<Utc>) {
        let Some(dir) = self.snapshots_dir.as_ref() else {
            return;
        };
        let path = dir.join(output_file_name(&self.source.id, now, true, "jpg"));
        let result = std::fs::create_dir_all(dir)
            .map_err(image::ImageError::IoError)
            .and_then(|_| image.save(&path));
        if let Err(e) = result {
            warn!("Cannot save frame {}: {e}", path.display());
        }
    }
}
