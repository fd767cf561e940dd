//! Network entity definitions shared by the daemon and the privileged helper
//!
//! These types travel field-for-field over the wire so the helper can
//! validate them independently of the daemon.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A network interface exposed by a directly-attached device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    /// Human-readable label (e.g. "CDC Ethernet (usb0)")
    pub name: String,
    /// OS handle of the interface (e.g. "en5", "usb0")
    pub bsd_name: String,
    /// Identifier of the USB device that owns this interface
    pub device_id: String,
}

impl NetworkInterfaceInfo {
    pub fn new(
        name: impl Into<String>,
        bsd_name: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            bsd_name: bsd_name.into(),
            device_id: device_id.into(),
        }
    }

    /// Check that the OS handle is something the helper may safely pass to
    /// the host's network tooling.
    ///
    /// Linux limits interface names to 15 bytes; only ASCII alphanumerics
    /// and `-`, `_`, `.` are accepted.
    pub fn has_valid_system_name(&self) -> bool {
        let name = self.bsd_name.as_str();
        !name.is_empty()
            && name.len() <= 15
            && name != "."
            && name != ".."
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    }
}

impl fmt::Display for NetworkInterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.bsd_name, self.name)
    }
}

/// IPv4 configuration assigned to a device interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpConfigurationInfo {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl IpConfigurationInfo {
    /// Prefix length of the subnet mask, or `None` if the mask is not contiguous
    pub fn prefix_len(&self) -> Option<u8> {
        let mask = u32::from(self.subnet_mask);
        let ones = mask.leading_ones();
        if mask.checked_shl(ones).unwrap_or(0) == 0 {
            Some(ones as u8)
        } else {
            None
        }
    }
}

impl fmt::Display for IpConfigurationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix_len() {
            Some(prefix) => write!(f, "{}/{}", self.ip_address, prefix)?,
            None => write!(f, "{} mask {}", self.ip_address, self.subnet_mask)?,
        }
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_len() {
        let config = IpConfigurationInfo {
            ip_address: Ipv4Addr::new(10, 90, 0, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
        };
        assert_eq!(config.prefix_len(), Some(24));
        assert_eq!(config.to_string(), "10.90.0.2/24");

        let odd = IpConfigurationInfo {
            subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
            ..config
        };
        assert_eq!(odd.prefix_len(), None);

        let host = IpConfigurationInfo {
            subnet_mask: Ipv4Addr::new(255, 255, 255, 255),
            ..config
        };
        assert_eq!(host.prefix_len(), Some(32));
    }

    #[test]
    fn test_system_name_validation() {
        assert!(NetworkInterfaceInfo::new("USB", "usb0", "1-2").has_valid_system_name());
        assert!(NetworkInterfaceInfo::new("USB", "enx00e04c680001", "1-2").has_valid_system_name());
        assert!(!NetworkInterfaceInfo::new("USB", "", "1-2").has_valid_system_name());
        assert!(!NetworkInterfaceInfo::new("USB", "eth0; rm -rf", "1-2").has_valid_system_name());
        assert!(!NetworkInterfaceInfo::new("USB", "..", "1-2").has_valid_system_name());
        assert!(
            !NetworkInterfaceInfo::new("USB", "averyveryverylongname", "1-2")
                .has_valid_system_name()
        );
    }
}
