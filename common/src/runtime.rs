//! Capabilities injected into every pipeline component at construction:
//! a tracing span, the shared counters and the shutdown flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Span;

use crate::protocol::StatsSnapshot;

/// Pipeline-wide counters.  Written by the components, read by the status
/// endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_read: AtomicU64,
    pub frames_sampled: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub classifications: AtomicU64,
    pub classification_failures: AtomicU64,
    pub candidates_emitted: AtomicU64,
    pub candidates_rate_limited: AtomicU64,
    pub triggers: AtomicU64,
    pub clips_written: AtomicU64,
    pub uploads_ok: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub uploads_dropped: AtomicU64,
}

/// Increment a counter by one.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Increment a counter by `n`.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_read: get(&self.frames_read),
            frames_sampled: get(&self.frames_sampled),
            frames_dropped: get(&self.frames_dropped),
            reconnects: get(&self.reconnects),
            classifications: get(&self.classifications),
            classification_failures: get(&self.classification_failures),
            candidates_emitted: get(&self.candidates_emitted),
            candidates_rate_limited: get(&self.candidates_rate_limited),
            triggers: get(&self.triggers),
            clips_written: get(&self.clips_written),
            uploads_ok: get(&self.uploads_ok),
            uploads_failed: get(&self.uploads_failed),
            uploads_dropped: get(&self.uploads_dropped),
        }
    }
}

/// What a component receives from the orchestrator besides its channels.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Entered by the component on its own thread.
    pub span: Span,
    pub stats: Arc<PipelineStats>,
    pub shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn new(span: Span, stats: Arc<PipelineStats>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            span,
            stats,
            shutdown,
        }
    }

    /// Same counters and shutdown flag under a different span.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sleep for `duration` in short slices.  Returns `false` if shutdown was
    /// requested before the time was up.
    pub fn sleep(&self, duration: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_shutdown() {
                return false;
            }
            let remaining = duration.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }
}
