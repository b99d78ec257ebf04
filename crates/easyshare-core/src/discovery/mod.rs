//! mDNS/DNS-SD discovery for EasyShare.
//!
//! Each peer registers `_easyshare._tcp.local.` with a unique instance
//! name and a TXT section carrying its identity, and browses for other
//! peers. Resolved services become [`DiscoveredDevice`] entries surfaced
//! as [`Event::DeviceFound`]/[`Event::DeviceLost`]; entries not refreshed
//! within 30 seconds are pruned.
//!
//! Resolution never blocks on `.local` DNS: when a record resolves with
//! no usable address, the advertised hostname minus its `.local` suffix
//! is used as the host string. IPv4 literals are preferred over IPv6.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::device::{DeviceInfo, DiscoveredDevice, Platform};
use crate::error::{Error, Result};
use crate::events::{emit, Event, EventSender};

/// mDNS service type for EasyShare.
pub const SERVICE_TYPE: &str = "_easyshare._tcp.local.";

/// Interval of the stale-entry sweep on the browse side.
const PRUNE_INTERVAL: Duration = Duration::from_secs(15);

/// TXT record keys for service properties.
pub mod txt_keys {
    /// Device id key
    pub const ID: &str = "id";
    /// Device name key
    pub const NAME: &str = "name";
    /// Platform key
    pub const PLATFORM: &str = "platform";
    /// Application version key
    pub const VERSION: &str = "version";
}

/// Encode a number in lowercase base36, as used in instance names.
fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Build the unique instance name for a device.
fn instance_name(device_id: &str) -> String {
    let prefix: String = device_id.chars().take(8).collect();
    format!("EasyShare-{}-{}", prefix, to_base36(crate::epoch_ms()))
}

/// Parse a resolved service into a [`DiscoveredDevice`].
fn parse_service_info(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    let properties = info.get_properties();
    let get_str =
        |key: &str| -> Option<String> { properties.get(key).map(|p| p.val_str().to_string()) };

    let id = get_str(txt_keys::ID)?;
    let name = get_str(txt_keys::NAME)?;
    let platform = get_str(txt_keys::PLATFORM).and_then(|s| Platform::parse(&s))?;
    let version = get_str(txt_keys::VERSION).unwrap_or_else(|| "unknown".to_string());

    let addresses = info.get_addresses();
    let host = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .map(std::string::ToString::to_string)
        .unwrap_or_else(|| {
            // No address record: fall back to the bare hostname.
            info.get_hostname()
                .trim_end_matches('.')
                .trim_end_matches(".local")
                .to_string()
        });

    Some(DiscoveredDevice {
        device: DeviceInfo {
            id,
            name,
            platform,
            version,
            host: Some(host),
            port: Some(info.get_port()),
        },
        last_seen: crate::epoch_ms(),
    })
}

/// Advertises the local device as an mDNS service.
pub struct Advertiser {
    daemon: Option<ServiceDaemon>,
    registered: Option<String>,
}

impl Advertiser {
    /// Create a new advertiser.
    ///
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Discovery(format!("mDNS daemon: {e}")))?;
        Ok(Self {
            daemon: Some(daemon),
            registered: None,
        })
    }

    /// Register the local device with its TCP listening port.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn register(&mut self, device: &DeviceInfo, port: u16) -> Result<()> {
        let instance = instance_name(&device.id);

        let txt: Vec<(&str, String)> = vec![
            (txt_keys::ID, device.id.clone()),
            (txt_keys::NAME, device.name.clone()),
            (txt_keys::PLATFORM, device.platform.as_str().to_string()),
            (txt_keys::VERSION, device.version.clone()),
        ];

        let raw_hostname = hostname::get().map_or_else(
            |_| "localhost".to_string(),
            |h| h.to_string_lossy().to_string(),
        );
        let host = if raw_hostname.to_lowercase().ends_with(".local") {
            format!("{raw_hostname}.")
        } else if raw_hostname.ends_with(".local.") {
            raw_hostname
        } else {
            format!("{raw_hostname}.local.")
        };

        let service_info = ServiceInfo::new(SERVICE_TYPE, &instance, &host, (), port, txt.as_slice())
            .map_err(|e| Error::Discovery(format!("service info: {e}")))?
            .enable_addr_auto();

        self.daemon
            .as_ref()
            .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
            .register(service_info)
            .map_err(|e| Error::Discovery(format!("register: {e}")))?;

        tracing::info!(instance = %instance, port, "registered mDNS service");
        self.registered = Some(instance);
        Ok(())
    }

    /// Unregister the current service, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if unregistration fails.
    pub fn unregister(&mut self) -> Result<()> {
        if let Some(instance) = self.registered.take() {
            let full_name = format!("{instance}.{SERVICE_TYPE}");
            let receiver = self
                .daemon
                .as_ref()
                .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
                .unregister(&full_name)
                .map_err(|e| Error::Discovery(format!("unregister: {e}")))?;

            match receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(status) => tracing::debug!(?status, "mDNS unregister completed"),
                Err(_) => tracing::debug!("mDNS unregister timed out"),
            }
        }
        Ok(())
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            match daemon.shutdown() {
                Ok(receiver) => match receiver.recv_timeout(Duration::from_millis(500)) {
                    Ok(status) => tracing::debug!(?status, "mDNS advertiser shutdown completed"),
                    Err(_) => tracing::debug!("mDNS advertiser shutdown timed out"),
                },
                Err(e) => tracing::debug!("mDNS advertiser shutdown: {e}"),
            }
        }
    }
}

/// Browses for EasyShare peers and maintains the peer registry.
pub struct Browser {
    daemon: Option<ServiceDaemon>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Browser {
    /// Start browsing. Join/leave events for every peer other than
    /// `local_id` are emitted on the event channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn start(local_id: String, events: EventSender) -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Discovery(format!("mDNS daemon: {e}")))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("browse: {e}")))?;

        let task = tokio::spawn(browse_loop(local_id, receiver, events));

        Ok(Self {
            daemon: Some(daemon),
            task: Some(task),
        })
    }

    /// Stop browsing and shut the daemon down.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!("stop mDNS browse: {e}");
            }
            match daemon.shutdown() {
                Ok(receiver) => match receiver.recv_timeout(Duration::from_millis(500)) {
                    Ok(status) => tracing::debug!(?status, "mDNS browser shutdown completed"),
                    Err(_) => tracing::debug!("mDNS browser shutdown timed out"),
                },
                Err(e) => tracing::debug!("mDNS browser shutdown: {e}"),
            }
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drives the browse receiver and the stale sweep.
async fn browse_loop(
    local_id: String,
    receiver: flume::Receiver<ServiceEvent>,
    events: EventSender,
) {
    // fullname -> entry; fullnames are how removals are reported.
    let mut registry: HashMap<String, DiscoveredDevice> = HashMap::new();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                let Ok(event) = event else { break };
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(discovered) = parse_service_info(&info) else {
                            continue;
                        };
                        if discovered.device.id == local_id {
                            continue;
                        }

                        tracing::debug!(
                            device = %discovered.device.name,
                            host = ?discovered.device.host,
                            "resolved peer"
                        );
                        registry.insert(info.get_fullname().to_string(), discovered.clone());
                        emit(&events, Event::DeviceFound(discovered));
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        if let Some(entry) = registry.remove(&fullname) {
                            emit(&events, Event::DeviceLost(entry.device.id));
                        }
                    }
                    _ => {}
                }
            }
            _ = prune.tick() => {
                let now = crate::epoch_ms();
                let stale: Vec<String> = registry
                    .iter()
                    .filter(|(_, entry)| entry.is_stale(now))
                    .map(|(fullname, _)| fullname.clone())
                    .collect();
                for fullname in stale {
                    if let Some(entry) = registry.remove(&fullname) {
                        tracing::debug!(device = %entry.device.name, "pruning stale peer");
                        emit(&events, Event::DeviceLost(entry.device.id));
                    }
                }
            }
        }
    }
}
