//! Linux discovery backend
//!
//! USB devices are enumerated through libusb; network interfaces through
//! `/sys/class/net`. A device and its interfaces are tied together by the
//! USB port path, which is both the libusb identity we hand out
//! (`"<bus>-<port>.<port>"`) and the sysfs name of the USB device that
//! backs the interface.

use super::DiscoveryProvider;
use crate::error::DiscoveryError;
use common::UsbDeviceInfo;
use protocol::NetworkInterfaceInfo;
use rusb::{Context, UsbContext};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// `ARPHRD_ETHER` from `<linux/if_arp.h>`
const ARPHRD_ETHER: u32 = 1;

/// USB hub device class
const USB_CLASS_HUB: u8 = 0x09;

pub struct LinuxDiscovery {
    context: Context,
    sysfs_root: PathBuf,
}

impl LinuxDiscovery {
    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(Self {
            context: Context::new()?,
            sysfs_root: PathBuf::from("/sys"),
        })
    }

    fn product_name(&self, id: &str) -> Option<String> {
        let path = self
            .sysfs_root
            .join("bus/usb/devices")
            .join(id)
            .join("product");
        read_trimmed(&path)
    }
}

impl DiscoveryProvider for LinuxDiscovery {
    fn list_usb_devices(&self) -> Result<Vec<UsbDeviceInfo>, DiscoveryError> {
        let mut devices = Vec::new();

        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if descriptor.class_code() == USB_CLASS_HUB {
                continue;
            }

            // Root hubs have no port path and cannot own interfaces
            let ports = match device.port_numbers() {
                Ok(ports) if !ports.is_empty() => ports,
                _ => continue,
            };
            let id = port_path(device.bus_number(), &ports);

            let name = self.product_name(&id).unwrap_or_else(|| {
                format!(
                    "USB {:04x}:{:04x}",
                    descriptor.vendor_id(),
                    descriptor.product_id()
                )
            });

            devices.push(UsbDeviceInfo {
                id,
                name,
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
            });
        }

        trace!("Enumerated {} USB devices", devices.len());
        Ok(devices)
    }

    fn list_ethernet_interfaces(&self) -> Result<Vec<NetworkInterfaceInfo>, DiscoveryError> {
        usb_ethernet_interfaces(&self.sysfs_root)
    }
}

/// Build the sysfs-style identity of a USB device, e.g. `3-1.2`
pub fn port_path(bus: u8, ports: &[u8]) -> String {
    let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, ports.join("."))
}

/// Enumerate USB-backed Ethernet interfaces under `<sysfs_root>/class/net`
pub fn usb_ethernet_interfaces(sysfs_root: &Path) -> Result<Vec<NetworkInterfaceInfo>, DiscoveryError> {
    let net_dir = sysfs_root.join("class/net");
    let entries = fs::read_dir(&net_dir).map_err(|source| DiscoveryError::Sysfs {
        path: net_dir.clone(),
        source,
    })?;

    let mut interfaces = Vec::new();
    for entry in entries.flatten() {
        let bsd_name = entry.file_name().to_string_lossy().into_owned();
        let if_dir = entry.path();

        let link_type = read_trimmed(&if_dir.join("type")).and_then(|t| t.parse::<u32>().ok());
        if link_type != Some(ARPHRD_ETHER) {
            continue;
        }
        if if_dir.join("wireless").exists() || if_dir.join("phy80211").exists() {
            continue;
        }

        // Virtual interfaces have no device link
        let Ok(device_dir) = fs::canonicalize(if_dir.join("device")) else {
            continue;
        };
        let Some(device_id) = device_dir
            .file_name()
            .and_then(|n| usb_device_of_interface(&n.to_string_lossy()))
        else {
            continue;
        };

        let label = read_trimmed(&device_dir.join("interface"))
            .unwrap_or_else(|| "USB Ethernet".to_string());

        interfaces.push(NetworkInterfaceInfo {
            name: label,
            bsd_name,
            device_id,
        });
    }

    interfaces.sort_by(|a, b| a.bsd_name.cmp(&b.bsd_name));
    Ok(interfaces)
}

/// Map a USB interface sysfs name (`3-1.2:1.0`) to its device (`3-1.2`)
///
/// Returns `None` for anything that is not a USB interface, such as a PCI
/// address (`0000:00:1f.6`).
pub fn usb_device_of_interface(name: &str) -> Option<String> {
    let (device, interface) = name.split_once(':')?;

    let (bus, ports) = device.split_once('-')?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !numeric(bus) || !ports.split('.').all(numeric) {
        return None;
    }

    let (config, number) = interface.split_once('.')?;
    if !numeric(config) || !numeric(number) {
        return None;
    }

    Some(device.to_string())
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
