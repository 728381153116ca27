//! Rolling window of recent raw frames, spliced in front of a clip when a
//! recording starts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use image::RgbImage;

pub struct PrerollBuffer {
    horizon: TimeDelta,
    frames: VecDeque<(DateTime<Utc>, Arc<RgbImage>)>,
}

impl PrerollBuffer {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon: TimeDelta::from_std(horizon).unwrap_or(TimeDelta::MAX),
            frames: VecDeque::new(),
        }
    }

    /// Append a frame and evict everything older than `ts - horizon`.
    /// Timestamps are expected in non-decreasing order.
    pub fn push(&mut self, ts: DateTime<Utc>, frame: Arc<RgbImage>) {
        self.frames.push_back((ts, frame));
        let Some(cutoff) = self.cutoff(ts) else {
            return;
        };
        while self.frames.front().is_some_and(|(t, _)| *t < cutoff) {
            self.frames.pop_front();
        }
    }

    /// Frames strictly newer than `now - horizon`, oldest first.
    pub fn window(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Arc<RgbImage>> {
        let cutoff = self.cutoff(now);
        self.frames
            .iter()
            .filter(move |(t, _)| cutoff.is_none_or(|c| *t > c))
            .map(|(_, f)| f)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.horizon)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
