//! Test utilities for fleet-netd
//!
//! Provides mock devices, interfaces and async helpers for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{FLEET_PRODUCT_ID, FLEET_VENDOR_ID, create_mock_fleet_device};
//!
//! let device = create_mock_fleet_device("dev-1");
//! assert_eq!(device.vendor_id, FLEET_VENDOR_ID);
//! assert_eq!(device.product_id, FLEET_PRODUCT_ID);
//! ```

use crate::usb_types::{DeviceFilter, UsbDeviceInfo};
use protocol::{IpConfigurationInfo, NetworkInterfaceInfo};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor ID used for mock fleet devices (Linux Foundation gadget)
pub const FLEET_VENDOR_ID: u16 = 0x1d6b;

/// Product ID used for mock fleet devices (multifunction composite gadget)
pub const FLEET_PRODUCT_ID: u16 = 0x0104;

/// Filter matching devices created by [`create_mock_fleet_device`]
pub fn fleet_filter() -> DeviceFilter {
    DeviceFilter {
        vendor_id: Some(FLEET_VENDOR_ID),
        product_id: Some(FLEET_PRODUCT_ID),
    }
}

/// Create a mock fleet device with the given id
pub fn create_mock_fleet_device(id: &str) -> UsbDeviceInfo {
    UsbDeviceInfo {
        id: id.to_string(),
        name: format!("Fleet Device {}", id),
        vendor_id: FLEET_VENDOR_ID,
        product_id: FLEET_PRODUCT_ID,
    }
}

/// Create a mock USB device that is not part of the fleet
///
/// # Example
/// ```
/// use common::test_utils::{create_mock_foreign_device, fleet_filter};
///
/// let keyboard = create_mock_foreign_device("1-4", 0x046d, 0xc31c);
/// assert!(!keyboard.is_fleet_device(&[fleet_filter()]));
/// ```
pub fn create_mock_foreign_device(id: &str, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        id: id.to_string(),
        name: format!("Peripheral {:04x}:{:04x}", vendor_id, product_id),
        vendor_id,
        product_id,
    }
}

/// Create a mock Ethernet interface owned by `device_id`
pub fn create_mock_interface(device_id: &str, bsd_name: &str) -> NetworkInterfaceInfo {
    NetworkInterfaceInfo::new(format!("USB Ethernet ({})", bsd_name), bsd_name, device_id)
}

/// Create a /24 configuration in the default pool subnet
pub fn create_mock_config(last_octet: u8) -> IpConfigurationInfo {
    IpConfigurationInfo {
        ip_address: Ipv4Addr::new(10, 90, 0, last_octet),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: None,
    }
}

/// Run a future with timeout
///
/// Useful for preventing tests from hanging indefinitely.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` every 10ms until it holds or `duration` elapses
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> Result<(), TimeoutError>
where
    F: FnMut() -> bool,
{
    with_timeout(duration, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fleet_device_matches_fleet_filter() {
        let device = create_mock_fleet_device("dev-1");
        assert!(device.is_fleet_device(&[fleet_filter()]));
    }

    #[test]
    fn test_mock_interface_ownership() {
        let interface = create_mock_interface("dev-1", "en5");
        assert_eq!(interface.device_id, "dev-1");
        assert_eq!(interface.bsd_name, "en5");
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until(Duration::from_millis(30), || false).await;
        assert!(result.is_err());
    }
}
