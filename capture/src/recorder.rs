//! Recording sub-state of a stream worker: `Idle → Recording → Idle`.
//!
//! A start command only marks a pending start.  The clip is opened on the
//! next frame, the pre-roll window is written first, then live frames follow
//! until the session end time is reached, a stop arrives or the worker
//! shuts down.  A start received while a session is active extends it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use image::RgbImage;
use tracing::{debug, info, warn};

use vigil_common::detection::RecordCommand;
use vigil_common::runtime::{bump, PipelineStats};

use crate::preroll::PrerollBuffer;
use crate::source::{ClipWriter, ClipWriterFactory, StreamInfo};

struct RecordingSession {
    writer: Box<dyn ClipWriter>,
    started: DateTime<Utc>,
    end: DateTime<Utc>,
    frames: u64,
}

pub struct Recorder {
    source: String,
    enabled: bool,
    preroll: Option<PrerollBuffer>,
    pending: Option<Duration>,
    session: Option<RecordingSession>,
    writers: Box<dyn ClipWriterFactory>,
    stats: Arc<PipelineStats>,
}

impl Recorder {
    /// A pre-roll buffer is kept only when recording is enabled and
    /// `preroll` is non-zero.
    pub fn new(
        source: &str,
        enabled: bool,
        preroll: Duration,
        writers: Box<dyn ClipWriterFactory>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source: source.to_string(),
            enabled,
            preroll: (enabled && !preroll.is_zero()).then(|| PrerollBuffer::new(preroll)),
            pending: None,
            session: None,
            writers,
            stats,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_pending_start(&self) -> bool {
        self.pending.is_some()
    }

    /// End time of the active session, if any.
    pub fn session_end(&self) -> Option<DateTime<Utc>> {
        self.session.as_ref().map(|s| s.end)
    }

    pub fn handle_command(&mut self, cmd: RecordCommand, now: DateTime<Utc>) {
        match cmd {
            RecordCommand::Start { duration } => {
                if !self.enabled {
                    debug!("Recording disabled, start ignored");
                    return;
                }
                match self.session.as_mut() {
                    Some(session) => {
                        let end = now + delta(duration);
                        if end > session.end {
                            session.end = end;
                            info!("Recording extended until {}", end.format("%H:%M:%S"));
                        }
                    }
                    None => {
                        self.pending = Some(self.pending.map_or(duration, |d| d.max(duration)));
                    }
                }
            }
            RecordCommand::Stop => {
                self.pending = None;
                if let Some(session) = self.session.as_mut() {
                    session.end = now;
                    info!("Recording stop requested");
                }
            }
        }
    }

    /// Per read cycle: activate a pending start, write the frame to the
    /// active session or close it once expired, then remember the frame for
    /// pre-roll.
    pub fn on_frame(&mut self, frame: &Arc<RgbImage>, now: DateTime<Utc>, info: StreamInfo) {
        if let Some(duration) = self.pending.take() {
            self.activate(duration, now, info);
        }

        let expired = self.session.as_ref().is_some_and(|s| now >= s.end);
        if expired {
            self.finish();
        } else if let Some(session) = self.session.as_mut() {
            match session.writer.write(frame) {
                Ok(()) => session.frames += 1,
                Err(e) => {
                    warn!("Clip write failed: {e}");
                    self.finish();
                }
            }
        }

        if let Some(buffer) = self.preroll.as_mut() {
            buffer.push(now, frame.clone());
        }
    }

    /// Finalise the active session, if any.
    pub fn finish(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let RecordingSession {
            writer,
            started,
            frames,
            ..
        } = session;
        match writer.finish() {
            Ok(path) => {
                bump(&self.stats.clips_written);
                info!(
                    "Clip saved: {} ({frames} frames, started {})",
                    path.display(),
                    started.format("%H:%M:%S")
                );
            }
            Err(e) => warn!("Clip finalise failed: {e}"),
        }
    }

    /// Drop pre-roll frames, e.g. after a reconnect.
    pub fn reset_preroll(&mut self) {
        if let Some(buffer) = self.preroll.as_mut() {
            buffer.clear();
        }
    }

    fn activate(&mut self, duration: Duration, now: DateTime<Utc>, info: StreamInfo) {
        let mut writer = match self.writers.open(&self.source, now, info) {
            Ok(w) => w,
            Err(e) => {
                warn!("Cannot open clip writer, recording skipped: {e}");
                return;
            }
        };

        let mut frames = 0u64;
        if let Some(buffer) = self.preroll.as_ref() {
            for f in buffer.window(now) {
                if let Err(e) = writer.write(f) {
                    warn!("Pre-roll write failed: {e}");
                    break;
                }
                frames += 1;
            }
        }

        let end = now + delta(duration);
        info!(
            "Recording started ({frames} pre-roll frames, until {})",
            end.format("%H:%M:%S")
        );
        self.session = Some(RecordingSession {
            writer,
            started: now,
            end,
            frames,
        });
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::days(365))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::source::StreamError;

    /// Records the first red channel value of every written frame, one Vec
    /// per opened clip.
    #[derive(Clone, Default)]
    pub struct MockWriters {
        pub clips: Arc<Mutex<Vec<Vec<u8>>>>,
        pub finished: Arc<Mutex<usize>>,
        pub fail_open: bool,
    }

    struct MockWriter {
        index: usize,
        clips: Arc<Mutex<Vec<Vec<u8>>>>,
        finished: Arc<Mutex<usize>>,
    }

    impl ClipWriter for MockWriter {
        fn write(&mut self, frame: &RgbImage) -> Result<(), StreamError> {
            self.clips.lock().unwrap()[self.index].push(frame.get_pixel(0, 0).0[0]);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<PathBuf, StreamError> {
            *self.finished.lock().unwrap() += 1;
            Ok(PathBuf::from(format!("clip{}.mp4", self.index)))
        }
    }

    impl ClipWriterFactory for MockWriters {
        fn open(
            &mut self,
            _source: &str,
            _started: DateTime<Utc>,
            _info: StreamInfo,
        ) -> Result<Box<dyn ClipWriter>, StreamError> {
            if self.fail_open {
                return Err(StreamError::Writer("no encoder".into()));
            }
            let mut clips = self.clips.lock().unwrap();
            clips.push(Vec::new());
            Ok(Box::new(MockWriter {
                index: clips.len() - 1,
                clips: self.clips.clone(),
                finished: self.finished.clone(),
            }))
        }
    }

    const INFO: StreamInfo = StreamInfo {
        width: 1,
        height: 1,
        fps: 10.0,
    };

    fn frame(v: u8) -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(1, 1, image::Rgb([v, 0, 0])))
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
    }

    fn recorder(writers: &MockWriters, preroll: Duration) -> Recorder {
        Recorder::new(
            "cam1",
            true,
            preroll,
            Box::new(writers.clone()),
            Arc::new(PipelineStats::default()),
        )
    }

    fn start(secs: u64) -> RecordCommand {
        RecordCommand::Start {
            duration: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_preroll_splice_keeps_order_without_duplicates() {
        let writers = MockWriters::default();
        let mut rec = recorder(&writers, Duration::from_secs(5));

        // 10 fps for 10 s: frame i at i * 100 ms
        for i in 0..100u8 {
            rec.on_frame(&frame(i), at(i as i64 * 100), INFO);
        }
        rec.handle_command(start(2), at(10_000));
        for i in 100..130u8 {
            rec.on_frame(&frame(i), at(i as i64 * 100), INFO);
        }

        let clips = writers.clips.lock().unwrap();
        assert_eq!(clips.len(), 1);
        let written = &clips[0];
        // pre-roll: frames newer than 10.0 s - 5 s, i.e. 5.1 s .. 9.9 s
        let preroll: Vec<u8> = (51..100).collect();
        assert_eq!(&written[..49], &preroll[..]);
        // live frames follow directly, ending before the 12 s mark
        let live: Vec<u8> = (100..120).collect();
        assert_eq!(&written[49..], &live[..]);
        assert!(written.windows(2).all(|w| w[0] < w[1]));
        assert!(!rec.is_recording());
        assert_eq!(*writers.finished.lock().unwrap(), 1);
    }

    #[test]
    fn test_start_while_recording_extends() {
        let writers = MockWriters::default();
        let mut rec = recorder(&writers, Duration::ZERO);

        rec.handle_command(start(10), at(0));
        rec.on_frame(&frame(0), at(0), INFO);
        assert_eq!(rec.session_end(), Some(at(10_000)));

        rec.handle_command(start(10), at(5_000));
        assert_eq!(rec.session_end(), Some(at(15_000)));
        rec.on_frame(&frame(1), at(5_000), INFO);

        // a shorter start never shortens the session
        rec.handle_command(start(1), at(6_000));
        assert_eq!(rec.session_end(), Some(at(15_000)));

        rec.on_frame(&frame(2), at(15_000), INFO);
        assert!(!rec.is_recording());
        assert_eq!(writers.clips.lock().unwrap().len(), 1);
        assert_eq!(writers.clips.lock().unwrap()[0], vec![0, 1]);
        assert_eq!(*writers.finished.lock().unwrap(), 1);
    }

    #[test]
    fn test_stop_closes_on_next_cycle() {
        let writers = MockWriters::default();
        let mut rec = recorder(&writers, Duration::ZERO);

        rec.handle_command(start(60), at(0));
        rec.on_frame(&frame(0), at(0), INFO);
        rec.on_frame(&frame(1), at(100), INFO);
        rec.handle_command(RecordCommand::Stop, at(150));
        assert!(rec.is_recording());
        rec.on_frame(&frame(2), at(200), INFO);

        assert!(!rec.is_recording());
        assert_eq!(writers.clips.lock().unwrap()[0], vec![0, 1]);
        assert_eq!(*writers.finished.lock().unwrap(), 1);
    }

    #[test]
    fn test_open_failure_clears_pending_start() {
        let writers = MockWriters {
            fail_open: true,
            ..Default::default()
        };
        let mut rec = recorder(&writers, Duration::from_secs(1));
        rec.handle_command(start(5), at(0));
        assert!(rec.has_pending_start());
        rec.on_frame(&frame(0), at(0), INFO);
        assert!(!rec.has_pending_start());
        assert!(!rec.is_recording());
        rec.on_frame(&frame(1), at(100), INFO);
        assert!(writers.clips.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_recorder_ignores_start() {
        let writers = MockWriters::default();
        let mut rec = Recorder::new(
            "cam1",
            false,
            Duration::from_secs(5),
            Box::new(writers.clone()),
            Arc::new(PipelineStats::default()),
        );
        rec.handle_command(start(5), at(0));
        rec.on_frame(&frame(0), at(0), INFO);
        assert!(!rec.is_recording());
        assert!(writers.clips.lock().unwrap().is_empty());
    }

    #[test]
    fn test_finish_on_shutdown() {
        let writers = MockWriters::default();
        let mut rec = recorder(&writers, Duration::ZERO);
        rec.handle_command(start(60), at(0));
        rec.on_frame(&frame(0), at(0), INFO);
        rec.finish();
        assert!(!rec.is_recording());
        assert_eq!(*writers.finished.lock().unwrap(), 1);
        rec.finish();
        assert_eq!(*writers.finished.lock().unwrap(), 1);
    }
}
