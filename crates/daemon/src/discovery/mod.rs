//! Discovery provider
//!
//! Read-only queries over the host's USB and network subsystems. The
//! monitor and the reconciler only ever talk to the [`DiscoveryProvider`]
//! trait, so the platform backend can be swapped (and faked in tests).

pub mod linux;

use crate::error::DiscoveryError;
use common::{LanDevice, UsbDeviceInfo};
use protocol::NetworkInterfaceInfo;
use tracing::warn;

pub use linux::LinuxDiscovery;

/// Platform capability for enumerating devices and interfaces
///
/// Implementations must return in bounded time and must not mutate host state.
pub trait DiscoveryProvider: Send + Sync + 'static {
    /// All USB devices currently attached to the host
    fn list_usb_devices(&self) -> Result<Vec<UsbDeviceInfo>, DiscoveryError>;

    /// All Ethernet-class interfaces backed by a USB device
    fn list_ethernet_interfaces(&self) -> Result<Vec<NetworkInterfaceInfo>, DiscoveryError>;

    /// Fleet devices advertising themselves on the local network
    ///
    /// Not used by the daemon loop; backends without LAN discovery report nothing.
    fn list_announced_devices(&self) -> Result<Vec<LanDevice>, DiscoveryError> {
        Ok(Vec::new())
    }

    /// USB devices, or an empty list plus a warning if enumeration fails
    fn usb_devices_or_empty(&self) -> Vec<UsbDeviceInfo> {
        self.list_usb_devices().unwrap_or_else(|e| {
            warn!("USB device enumeration failed: {}", e);
            Vec::new()
        })
    }

    /// Ethernet interfaces owned by `device`
    ///
    /// Enumeration errors yield an empty list plus a warning.
    fn interfaces_for_device(&self, device: &UsbDeviceInfo) -> Vec<NetworkInterfaceInfo> {
        match self.list_ethernet_interfaces() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|interface| interface.device_id == device.id)
                .collect(),
            Err(e) => {
                warn!(device = %device.id, "Interface enumeration failed: {}", e);
                Vec::new()
            }
        }
    }
}
