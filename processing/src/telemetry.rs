//! Host resource snapshot for the device endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::System;

use vigil_common::protocol::HostTelemetry;

/// CPU usage needs two samples; refresh at most this often.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

pub struct HostProbe {
    inner: Mutex<ProbeState>,
}

struct ProbeState {
    sys: System,
    last_update: Option<Instant>,
    snapshot: HostTelemetry,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProbeState {
                sys: System::new(),
                last_update: None,
                snapshot: HostTelemetry::default(),
            }),
        }
    }

    /// Current telemetry, refreshed when the cached copy is stale.
    pub fn snapshot(&self) -> HostTelemetry {
        let mut state = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = state
            .last_update
            .is_none_or(|t| t.elapsed() >= REFRESH_INTERVAL);
        if stale {
            state.sys.refresh_cpu_usage();
            state.sys.refresh_memory();
            state.snapshot = build_snapshot(&state.sys);
            state.last_update = Some(Instant::now());
        }
        state.snapshot.clone()
    }
}

fn build_snapshot(sys: &System) -> HostTelemetry {
    HostTelemetry {
        host_name: System::host_name(),
        os: System::long_os_version(),
        cpu_count: sys.cpus().len(),
        cpu_percent: sys.global_cpu_usage(),
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reports_memory() {
        let probe = HostProbe::new();
        let snap = probe.snapshot();
        assert!(snap.memory_total > 0);
        assert!(snap.memory_used <= snap.memory_total);
        assert!(snap.cpu_count >= 1);
    }

    #[test]
    fn test_snapshot_is_cached() {
        let probe = HostProbe::new();
        let first = probe.snapshot();
        let second = probe.snapshot();
        assert_eq!(first.memory_total, second.memory_total);
        assert_eq!(first.cpu_percent, second.cpu_percent);
    }
}
