//! Producer side of the shared frame queue.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use vigil_common::config::DropPolicy;
use vigil_common::detection::FrameSample;

/// How long a `Block` producer waits for room before discarding.
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Sent,
    /// Sent after evicting this many queued frames.
    Replaced(usize),
    /// The frame itself was discarded.
    Dropped,
}

/// Enqueues sampled frames according to a [`DropPolicy`].
///
/// Drop-oldest eviction needs access to the consumer end, so every producer
/// holds a clone of the queue's receiver.  The queue therefore never reports
/// disconnection to producers; workers stop on the shutdown flag.
#[derive(Clone)]
pub struct FrameProducer {
    tx: Sender<FrameSample>,
    evict: Receiver<FrameSample>,
    policy: DropPolicy,
    timeout: Duration,
}

impl FrameProducer {
    pub fn new(tx: Sender<FrameSample>, evict: Receiver<FrameSample>, policy: DropPolicy) -> Self {
        Self {
            tx,
            evict,
            policy,
            timeout: BLOCK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn send(&self, sample: FrameSample) -> Enqueued {
        match self.policy {
            DropPolicy::DropOldest => self.send_drop_oldest(sample),
            DropPolicy::Block => match self.tx.send_timeout(sample, self.timeout) {
                Ok(()) => Enqueued::Sent,
                Err(_) => Enqueued::Dropped,
            },
        }
    }

    /// Evict everything pending, then enqueue without blocking.
    fn send_drop_oldest(&self, sample: FrameSample) -> Enqueued {
        let evicted = self.evict.try_iter().count();
        match self.tx.try_send(sample) {
            Ok(()) if evicted == 0 => Enqueued::Sent,
            Ok(()) => Enqueued::Replaced(evicted),
            // another producer refilled the queue in between
            Err(_) => Enqueued::Dropped,
        }
    }
}
