//! mDNS discovery of acquisition devices.
//!
//! Devices advertise `_ethoscope._tcp.local.` with TXT keys `MACHINE_NAME`
//! and `MACHINE_ID`. The scanner core never touches the mDNS library
//! directly — this module translates service events into plain
//! [`BrowseEvent`]s on a channel, so tests can drive the scanner with a
//! hand-fed channel instead of real multicast. The mDNS name is only a
//! hint; authoritative identity always comes from the device's own `/id`
//! endpoint.

use std::collections::HashMap;

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Service type the devices advertise.
pub const SERVICE_TYPE: &str = "_ethoscope._tcp.local.";

const MACHINE_NAME_KEY: &str = "MACHINE_NAME";
const MACHINE_ID_KEY: &str = "MACHINE_ID";

/// A discovery event, decoupled from any mDNS library type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Added {
        ip: String,
        port: u16,
        /// `MACHINE_NAME` TXT value, or a name parsed from the instance.
        name: Option<String>,
        /// `MACHINE_ID` TXT value, when advertised.
        device_id: Option<String>,
    },
    Removed {
        ip: String,
    },
}

/// Start browsing and return the event channel. The daemon lives as long
/// as the translation task keeps running.
pub fn start_browser(service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(service_type)?;
    let (tx, rx) = mpsc::channel(64);

    info!(service_type, "Started mDNS device discovery");

    tokio::spawn(async move {
        // Resolved IPs per service instance, so removal events (which only
        // carry the name) can be mapped back to addresses.
        let mut known_ips: HashMap<String, Vec<String>> = HashMap::new();
        // Keep the daemon alive for the duration of the browse.
        let _daemon = daemon;

        loop {
            let event = match receiver.recv_async().await {
                Ok(event) => event,
                Err(e) => {
                    warn!("mDNS receiver error: {e}");
                    break;
                }
            };

            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let fullname = info.get_fullname().to_string();
                    let port = info.get_port();
                    let txt_name = info
                        .get_property_val_str(MACHINE_NAME_KEY)
                        .map(str::to_string);
                    let txt_id = info
                        .get_property_val_str(MACHINE_ID_KEY)
                        .map(str::to_string);
                    let (name, device_id) =
                        parse_identity(&fullname, txt_name.as_deref(), txt_id.as_deref());

                    let ips: Vec<String> = info
                        .get_addresses()
                        .iter()
                        .map(|a| a.to_ip_addr().to_string())
                        .collect();
                    known_ips.insert(fullname.clone(), ips.clone());

                    for ip in ips {
                        debug!(ip = %ip, port, name = ?name, "mDNS service resolved");
                        if tx
                            .send(BrowseEvent::Added {
                                ip,
                                port,
                                name: name.clone(),
                                device_id: device_id.clone(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    debug!(service = %fullname, "mDNS service removed");
                    for ip in known_ips.remove(&fullname).unwrap_or_default() {
                        if tx.send(BrowseEvent::Removed { ip }).await.is_err() {
                            return;
                        }
                    }
                }
                ServiceEvent::SearchStarted(s) => debug!("mDNS search started: {s}"),
                ServiceEvent::SearchStopped(s) => debug!("mDNS search stopped: {s}"),
                _ => {}
            }
        }
    });

    Ok(rx)
}

/// Derive (name, id) from TXT properties, falling back to the mDNS
/// instance name of the form `NAME-ID._ethoscope._tcp.local.`.
fn parse_identity(
    fullname: &str,
    txt_name: Option<&str>,
    txt_id: Option<&str>,
) -> (Option<String>, Option<String>) {
    let mut name = txt_name
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let mut device_id = txt_id
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if name.is_none() || device_id.is_none() {
        let instance = fullname.split('.').next().unwrap_or("");
        if let Some((parsed_name, parsed_id)) = instance.rsplit_once('-') {
            if !parsed_name.is_empty() && !parsed_id.is_empty() {
                name.get_or_insert_with(|| parsed_name.to_string());
                device_id.get_or_insert_with(|| parsed_id.to_string());
            }
        }
    }

    (name, device_id)
}
