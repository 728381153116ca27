//! Alarm evaluator: logs every candidate, keeps a hit streak per source,
//! asks the originating stream to record once the streak is confirmed and
//! hands the candidate to the uploader.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use vigil_common::config::{output_file_name, TriggerPolicy};
use vigil_common::detection::{AlarmCandidate, RecordCommand};
use vigil_common::runtime::{bump, WorkerContext};
use vigil_common::similarity::ImageHash;

use crate::uploader::{AlarmUpload, UploadQueue};

/// Dequeue timeout, so shutdown is noticed while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hit streak and cooldown state of one source.
#[derive(Debug)]
pub struct TriggerGate {
    policy: TriggerPolicy,
    streak: u32,
    last_trigger: Option<DateTime<Utc>>,
}

impl TriggerGate {
    pub fn new(policy: TriggerPolicy) -> Self {
        Self {
            policy,
            streak: 0,
            last_trigger: None,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Feed one candidate of type `class` seen at `now`.  Returns the
    /// recording duration when this candidate should trigger.  The trigger
    /// only takes effect once [`TriggerGate::commit`] is called.
    pub fn observe(&mut self, class: &str, now: DateTime<Utc>) -> Option<Duration> {
        let counts = self
            .policy
            .trigger_types
            .as_ref()
            .is_none_or(|types| types.contains(class));
        if !counts {
            self.streak = 0;
            return None;
        }
        self.streak += 1;

        if self.streak < self.policy.required_hits || !self.policy.recording {
            return None;
        }
        let cooled = self.last_trigger.is_none_or(|last| {
            let cooldown = TimeDelta::from_std(self.policy.cooldown).unwrap_or(TimeDelta::MAX);
            now.signed_duration_since(last) >= cooldown
        });
        if !cooled {
            return None;
        }
        Some(self.policy.record_duration)
    }

    /// Record a delivered trigger: start the cooldown, reset the streak.
    pub fn commit(&mut self, now: DateTime<Utc>) {
        self.last_trigger = Some(now);
        self.streak = 0;
    }
}

/// Where the evaluator writes.
#[derive(Debug, Clone)]
pub struct EvaluatorOutputs {
    pub alarm_log: PathBuf,
    /// Set when alarm frames are saved as JPEG.
    pub frames_dir: Option<PathBuf>,
}

/// Device position and identity attached to uploads.
#[derive(Debug, Clone)]
pub struct DeviceOrigin {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

pub struct Evaluator {
    alarms: Receiver<AlarmCandidate>,
    commands: HashMap<String, Sender<RecordCommand>>,
    policies: HashMap<String, TriggerPolicy>,
    default_policy: TriggerPolicy,
    gates: HashMap<String, TriggerGate>,
    outputs: EvaluatorOutputs,
    log_file: Option<File>,
    origin: DeviceOrigin,
    uploads: Option<UploadQueue>,
    ctx: WorkerContext,
}

impl Evaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alarms: Receiver<AlarmCandidate>,
        commands: HashMap<String, Sender<RecordCommand>>,
        policies: HashMap<String, TriggerPolicy>,
        default_policy: TriggerPolicy,
        outputs: EvaluatorOutputs,
        origin: DeviceOrigin,
        uploads: Option<UploadQueue>,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            alarms,
            commands,
            policies,
            default_policy,
            gates: HashMap::new(),
            outputs,
            log_file: None,
            origin,
            uploads,
            ctx,
        }
    }

    pub fn run(mut self) {
        let span = self.ctx.span.clone();
        let _guard = span.enter();
        info!("Evaluator started (log={})", self.outputs.alarm_log.display());

        while !self.ctx.is_shutdown() {
            match self.alarms.recv_timeout(POLL_INTERVAL) {
                Ok(candidate) => self.handle(&candidate),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Evaluator stopped");
    }

    pub fn handle(&mut self, candidate: &AlarmCandidate) {
        info!(
            "[{}] Alarm candidate: {}{}",
            candidate.source,
            candidate.detection,
            if candidate.tile.is_some() { " (tile)" } else { "" }
        );

        if let Err(e) = self.append_log(candidate) {
            warn!("Cannot write alarm log: {e:#}");
        }
        if let Err(e) = self.save_frame(candidate) {
            warn!("Cannot save alarm frame: {e:#}");
        }

        if let Some(duration) = self.gate(&candidate.source).observe(
            &candidate.detection.class_name,
            candidate.timestamp,
        ) {
            if self.trigger(&candidate.source, duration) {
                self.gate(&candidate.source).commit(candidate.timestamp);
            }
        }

        self.forward(candidate);
    }

    fn gate(&mut self, source: &str) -> &mut TriggerGate {
        let policies = &self.policies;
        let default = &self.default_policy;
        self.gates.entry(source.to_string()).or_insert_with(|| {
            TriggerGate::new(policies.get(source).cloned().unwrap_or_else(|| default.clone()))
        })
    }

    /// Send a start command.  Returns `true` if the worker got it.
    fn trigger(&self, source: &str, duration: Duration) -> bool {
        let Some(tx) = self.commands.get(source) else {
            warn!("[{source}] Trigger without a command channel");
            return false;
        };
        match tx.try_send(RecordCommand::Start { duration }) {
            Ok(()) => {
                bump(&self.ctx.stats.triggers);
                info!("[{source}] Recording requested for {}s", duration.as_secs_f64());
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("[{source}] Command channel full, trigger deferred");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("[{source}] Stream worker gone");
                false
            }
        }
    }

    fn append_log(&mut self, candidate: &AlarmCandidate) -> Result<()> {
        if self.log_file.is_none() {
            if let Some(parent) = self.outputs.alarm_log.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.outputs.alarm_log)
                .with_context(|| format!("Cannot open {}", self.outputs.alarm_log.display()))?;
            self.log_file = Some(file);
        }
        let line = serde_json::to_string(&candidate.log_entry())?;
        if let Some(file) = self.log_file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                // reopen on the next candidate
                self.log_file = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn save_frame(&self, candidate: &AlarmCandidate) -> Result<()> {
        let Some(dir) = self.outputs.frames_dir.as_ref() else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(output_file_name(
            &candidate.source,
            candidate.timestamp,
            true,
            "jpg",
        ));
        candidate
            .image
            .save(&path)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        debug!("Alarm frame saved: {}", path.display());
        Ok(())
    }

    fn forward(&self, candidate: &AlarmCandidate) {
        let Some(queue) = self.uploads.as_ref() else {
            return;
        };
        queue.submit(AlarmUpload {
            time: candidate.timestamp,
            latitude: self.origin.latitude,
            longitude: self.origin.longitude,
            alarm_type: candidate.detection.class_name.clone(),
            confidence: candidate.detection.confidence,
            device_id: self.origin.device_id.clone(),
            image_hash: ImageHash::of(&candidate.image),
            image: candidate.image.clone(),
        });
    }
}
