//! Batch inference dispatcher: the single consumer of sampled frames.
//!
//! Each round opens a short window and pulls up to `max_batch_size` frames.
//! Every frame is classified whole first; on a miss it is tiled and the
//! tiles are tried in order until one matches.  Matches are rate-limited
//! per source before they become alarm candidates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use vigil_common::config::InferenceSection;
use vigil_common::detection::{AlarmCandidate, Detection, FrameSample};
use vigil_common::runtime::{bump, WorkerContext};
use vigil_common::tiling::{split_into_tiles, TileBox, TileSpec};

use crate::model::Classifier;

/// How long a candidate may wait for room in the alarm queue.
const ALARM_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-source minimum spacing between emitted candidates.
#[derive(Debug)]
pub struct RateLimiter {
    interval: TimeDelta,
    last: HashMap<String, DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            last: HashMap::new(),
        }
    }

    /// Whether `source` may emit at `now`.
    pub fn allows(&self, source: &str, now: DateTime<Utc>) -> bool {
        match self.last.get(source) {
            Some(last) => now.signed_duration_since(*last) >= self.interval,
            None => true,
        }
    }

    pub fn record(&mut self, source: &str, now: DateTime<Utc>) {
        self.last.insert(source.to_string(), now);
    }
}

/// Dispatcher settings resolved from `[inference]`.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub window: Duration,
    pub max_batch: usize,
    pub threshold: f64,
    pub target_classes: Option<Vec<String>>,
    pub tiles: TileSpec,
    pub min_interval: Duration,
}

impl DispatchSettings {
    pub fn from_config(cfg: &InferenceSection) -> Self {
        Self {
            window: Duration::from_millis(cfg.batch_window_ms),
            max_batch: cfg.max_batch_size.max(1),
            threshold: cfg.conf_threshold,
            target_classes: cfg.target_classes.clone(),
            tiles: TileSpec::new(cfg.tile_count, cfg.tile_overlap)
                .with_offsets(cfg.roi_top, cfg.roi_left),
            min_interval: Duration::from_millis(cfg.min_emit_interval_ms),
        }
    }
}

pub struct Dispatcher {
    frames: Receiver<FrameSample>,
    alarms: Sender<AlarmCandidate>,
    classifier: Option<Box<dyn Classifier>>,
    settings: DispatchSettings,
    limiter: RateLimiter,
    ctx: WorkerContext,
}

impl Dispatcher {
    pub fn new(
        frames: Receiver<FrameSample>,
        alarms: Sender<AlarmCandidate>,
        classifier: Option<Box<dyn Classifier>>,
        settings: DispatchSettings,
        ctx: WorkerContext,
    ) -> Self {
        let limiter = RateLimiter::new(settings.min_interval);
        Self {
            frames,
            alarms,
            classifier,
            settings,
            limiter,
            ctx,
        }
    }

    pub fn run(mut self) {
        let span = self.ctx.span.clone();
        let _guard = span.enter();
        if self.classifier.is_none() {
            warn!("No classifier loaded, frames will be drained without inference");
        }
        info!(
            "Dispatcher started (window={}ms, max_batch={}, tiles={})",
            self.settings.window.as_millis(),
            self.settings.max_batch,
            self.settings.tiles.count
        );

        while !self.ctx.is_shutdown() {
            let (batch, closed) = self.collect_batch();
            if !batch.is_empty() {
                self.process_batch(&batch, Utc::now());
            }
            if closed {
                info!("Frame queue closed");
                break;
            }
        }
        info!("Dispatcher stopped");
    }

    /// Pull up to `max_batch` frames within one window.  The second value is
    /// `true` once the queue has no producers left.
    fn collect_batch(&self) -> (Vec<FrameSample>, bool) {
        let started = Instant::now();
        let mut batch = Vec::with_capacity(self.settings.max_batch);
        while batch.len() < self.settings.max_batch {
            let remaining = self.settings.window.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self.frames.recv_timeout(remaining) {
                Ok(sample) => batch.push(sample),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return (batch, true),
            }
        }
        (batch, false)
    }

    /// Classify every frame of a batch and emit rate-limited candidates
    /// stamped `now`.
    pub fn process_batch(&mut self, batch: &[FrameSample], now: DateTime<Utc>) {
        for sample in batch {
            let Some((detection, tile)) = self.find_match(sample) else {
                continue;
            };
            if !self.limiter.allows(&sample.source, now) {
                bump(&self.ctx.stats.candidates_rate_limited);
                debug!("[{}] {detection} suppressed by rate limit", sample.source);
                continue;
            }
            let candidate = AlarmCandidate {
                source: sample.source.clone(),
                timestamp: now,
                detection,
                tile,
                image: sample.image.clone(),
            };
            match self.alarms.send_timeout(candidate, ALARM_SEND_TIMEOUT) {
                Ok(()) => {
                    self.limiter.record(&sample.source, now);
                    bump(&self.ctx.stats.candidates_emitted);
                }
                Err(e) => warn!("[{}] Alarm queue unavailable, candidate dropped: {e}", sample.source),
            }
        }
    }

    /// Full frame first, then tiles in order.  `None` when nothing matches or
    /// no classifier is loaded.
    fn find_match(&self, sample: &FrameSample) -> Option<(Detection, Option<TileBox>)> {
        let classifier = self.classifier.as_deref()?;

        if let Some(d) = self.classify(classifier, &sample.image, &sample.source) {
            if self.is_match(&d) {
                return Some((d, None));
            }
        }

        for (tile, bounds) in split_into_tiles(&sample.image, &self.settings.tiles) {
            if let Some(d) = self.classify(classifier, &tile, &sample.source) {
                if self.is_match(&d) {
                    return Some((d, Some(bounds)));
                }
            }
        }
        None
    }

    fn classify(
        &self,
        classifier: &dyn Classifier,
        image: &image::RgbImage,
        source: &str,
    ) -> Option<Detection> {
        bump(&self.ctx.stats.classifications);
        match classifier.classify(image) {
            Ok(d) => Some(d),
            Err(e) => {
                bump(&self.ctx.stats.classification_failures);
                debug!("[{source}] Classification failed: {e:#}");
                None
            }
        }
    }

    fn is_match(&self, d: &Detection) -> bool {
        d.matches(self.settings.threshold, self.settings.target_classes.as_deref())
    }
}
