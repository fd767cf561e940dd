//! USB device types shared by discovery, monitoring and the CLI

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::{Error, Result};

/// A USB device observed during one enumeration pass
///
/// Re-created on every poll. Identity is the `id` field, which stays stable
/// for the same physical device as long as it remains on the same port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    /// Stable identifier (port path on Linux, e.g. "3-1.2")
    pub id: String,
    /// Product name, or "USB vvvv:pppp" when the device has none
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    /// Whether this device belongs to the managed fleet
    pub fn is_fleet_device(&self, filters: &[DeviceFilter]) -> bool {
        filters.iter().any(|f| f.matches(self.vendor_id, self.product_id))
    }
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {:04x}:{:04x}",
            self.name, self.id, self.vendor_id, self.product_id
        )
    }
}

/// Vendor/product match pattern in `VID:PID` form
///
/// Each side is either `*` or a `0x`-prefixed hex number of 1-4 digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// Parse a list of patterns, failing on the first invalid one
    pub fn parse_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<DeviceFilter>> {
        patterns.iter().map(|p| p.as_ref().parse()).collect()
    }

    fn parse_hex_id(id: &str, name: &str) -> Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name, id
                ))
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(Error::Config(format!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name, id
            )));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id)))
    }
}

impl FromStr for DeviceFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                s
            )));
        }
        Ok(Self {
            vendor_id: Self::parse_hex_id(parts[0], "VID")?,
            product_id: Self::parse_hex_id(parts[1], "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "0x{:04x}", v)?,
            None => write!(f, "*")?,
        }
        match self.product_id {
            Some(p) => write!(f, ":0x{:04x}", p),
            None => write!(f, ":*"),
        }
    }
}

/// Hot-plug event emitted by the USB monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(UsbDeviceInfo),
    Disconnected(UsbDeviceInfo),
}

impl DeviceEvent {
    pub fn device(&self) -> &UsbDeviceInfo {
        match self {
            DeviceEvent::Connected(device) | DeviceEvent::Disconnected(device) => device,
        }
    }
}

/// A fleet device announcing itself on the local network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanDevice {
    pub name: String,
    pub hostname: String,
    pub address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
        UsbDeviceInfo {
            id: "1-2".to_string(),
            name: "Gadget".to_string(),
            vendor_id,
            product_id,
        }
    }

    #[test]
    fn test_filter_parse_valid() {
        let filter: DeviceFilter = "0x1d6b:0x0104".parse().unwrap();
        assert_eq!(filter.vendor_id, Some(0x1d6b));
        assert_eq!(filter.product_id, Some(0x0104));

        let any_product: DeviceFilter = "0x1234:*".parse().unwrap();
        assert_eq!(any_product.product_id, None);
        assert!("*:*".parse::<DeviceFilter>().is_ok());
        assert!("0XABCD:0xEF01".parse::<DeviceFilter>().is_ok());
    }

    #[test]
    fn test_filter_parse_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_fleet_predicate() {
        let filters = DeviceFilter::parse_all(&["0x1d6b:0x0104", "0x0955:*"]).unwrap();

        assert!(device(0x1d6b, 0x0104).is_fleet_device(&filters));
        assert!(device(0x0955, 0x7020).is_fleet_device(&filters));
        assert!(!device(0x1d6b, 0x0002).is_fleet_device(&filters));
        assert!(!device(0x046d, 0xc52b).is_fleet_device(&[]));
    }

    #[test]
    fn test_filter_display() {
        let filter: DeviceFilter = "0x1D6B:*".parse().unwrap();
        assert_eq!(filter.to_string(), "0x1d6b:*");
    }
}
