//! mDNS-SD advertisement of an edge node's status endpoint.
//!
//! Each node registers as `edge-01`, `edge-02`, … under
//! `_vigil-edge._tcp.local.` so the device registry can find it without a
//! configured address.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info};

/// mDNS service type of an edge node.
pub const SERVICE_TYPE: &str = "_vigil-edge._tcp.local.";

const INSTANCE_PREFIX: &str = "edge";

/// How long to scan for existing peers before claiming an instance number.
const DISCOVERY_SCAN: Duration = Duration::from_secs(3);

/// Keeps the mDNS daemon alive while registered.
pub struct DiscoveryHandle {
    daemon: ServiceDaemon,
    instance_name: String,
    fullname: String,
}

impl DiscoveryHandle {
    /// Our assigned instance name, e.g. `edge-01`.
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Unregister from mDNS and shut down the daemon.
    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Register the status endpoint listening on `port`, carrying the device
/// identity as a TXT property.
pub fn register(port: u16, device_id: &str) -> Result<DiscoveryHandle> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;

    let receiver = daemon.browse(SERVICE_TYPE).context("Cannot browse mDNS")?;
    let mut existing: BTreeSet<u32> = BTreeSet::new();
    let deadline = Instant::now() + DISCOVERY_SCAN;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(n) = parse_instance_number(info.get_fullname()) {
                    debug!("Found existing edge instance #{n}");
                    existing.insert(n);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = daemon.stop_browse(SERVICE_TYPE);

    let instance_name = format!("{}-{:02}", INSTANCE_PREFIX, next_available(&existing));
    let host = format!("{instance_name}.local.");
    let properties = [("device_id", device_id)];

    let service_info = ServiceInfo::new(
        SERVICE_TYPE,
        &instance_name,
        &host,
        "",
        port,
        &properties[..],
    )
    .context("Cannot create mDNS ServiceInfo")?
    .enable_addr_auto();

    let fullname = service_info.get_fullname().to_string();
    daemon
        .register(service_info)
        .context("Cannot register mDNS service")?;

    info!("Registered on mDNS as '{instance_name}' (type={SERVICE_TYPE}, port={port})");

    Ok(DiscoveryHandle {
        daemon,
        instance_name,
        fullname,
    })
}

/// Extract the instance number from a fullname like
/// `edge-03._vigil-edge._tcp.local.`
fn parse_instance_number(fullname: &str) -> Option<u32> {
    let instance = fullname.split('.').next()?;
    let suffix = instance.strip_prefix(INSTANCE_PREFIX)?.strip_prefix('-')?;
    suffix.parse().ok()
}

/// Return the smallest positive integer not in `used`.
fn next_available(used: &BTreeSet<u32>) -> u32 {
    let mut n = 1;
    while used.contains(&n) {
        n += 1;
    }
    n
}
