//! IP address manager
//!
//! Owns the address pool and the allocation table mapping a
//! `(device id, interface name)` pair to its IPv4 configuration. An address
//! is never outstanding under two keys at once. The table is an intent
//! record: the privileged helper remains the source of truth for what is
//! actually configured.

use crate::config::PoolSettings;
use crate::error::IpamError;
use protocol::{IpConfigurationInfo, NetworkInterfaceInfo};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Smallest accepted prefix; larger pools are never needed for a USB fleet
pub const MIN_PREFIX_LEN: u8 = 16;

/// Allocation table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceKey {
    pub device_id: String,
    pub bsd_name: String,
}

impl From<&NetworkInterfaceInfo> for InterfaceKey {
    fn from(interface: &NetworkInterfaceInfo) -> Self {
        Self {
            device_id: interface.device_id.clone(),
            bsd_name: interface.bsd_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    interface: NetworkInterfaceInfo,
    config: IpConfigurationInfo,
}

#[derive(Debug)]
struct AddressPool {
    free: BTreeSet<Ipv4Addr>,
    allocations: HashMap<InterfaceKey, Allocation>,
    subnet_mask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
}

impl AddressPool {
    fn build(settings: &PoolSettings) -> Result<Self, IpamError> {
        let prefix = settings.prefix_len;
        if !(MIN_PREFIX_LEN..=32).contains(&prefix) {
            return Err(IpamError::InvalidPool(format!(
                "prefix length /{} outside /{}../32",
                prefix, MIN_PREFIX_LEN
            )));
        }

        let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
        let network = u32::from(settings.subnet) & mask;
        let broadcast = network | !mask;

        // /31 and /32 have no network or broadcast address to skip
        let (first, last) = if prefix >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        };

        let reserved: Vec<Ipv4Addr> = settings
            .host_address
            .into_iter()
            .chain(settings.gateway)
            .collect();

        let free = (first..=last)
            .map(Ipv4Addr::from)
            .filter(|addr| !reserved.contains(addr))
            .collect();

        Ok(Self {
            free,
            allocations: HashMap::new(),
            subnet_mask: Ipv4Addr::from(mask),
            gateway: settings.gateway,
        })
    }
}

pub struct IpAddressManager {
    settings: PoolSettings,
    pool: Mutex<Option<AddressPool>>,
}

impl IpAddressManager {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pool: Mutex::new(None),
        }
    }

    /// Prepare the address pool
    ///
    /// Calling this again keeps the existing allocations.
    pub async fn initialize(&self) -> Result<(), IpamError> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            debug!("Address pool already initialized");
            return Ok(());
        }

        let built = AddressPool::build(&self.settings)?;
        if built.free.is_empty() {
            return Err(IpamError::PoolExhausted);
        }

        info!(
            "Address pool {}/{} ready with {} address(es)",
            self.settings.subnet,
            self.settings.prefix_len,
            built.free.len()
        );
        *pool = Some(built);
        Ok(())
    }

    /// Return the interface's allocation, creating one if needed
    pub async fn assign(
        &self,
        interface: &NetworkInterfaceInfo,
    ) -> Result<IpConfigurationInfo, IpamError> {
        let mut guard = self.pool.lock().await;
        let pool = guard.as_mut().ok_or(IpamError::NotInitialized)?;

        let key = InterfaceKey::from(interface);
        if let Some(existing) = pool.allocations.get(&key) {
            return Ok(existing.config);
        }

        let address = pool.free.pop_first().ok_or(IpamError::PoolExhausted)?;
        let config = IpConfigurationInfo {
            ip_address: address,
            subnet_mask: pool.subnet_mask,
            gateway: pool.gateway,
        };
        pool.allocations.insert(
            key,
            Allocation {
                interface: interface.clone(),
                config,
            },
        );

        debug!(
            device = %interface.device_id,
            interface = %interface.bsd_name,
            address = %address,
            "Allocated address"
        );
        Ok(config)
    }

    /// Drop the interface's allocation and return its address to the pool
    ///
    /// Unknown interfaces are ignored.
    pub async fn release(&self, interface: &NetworkInterfaceInfo) -> Option<IpConfigurationInfo> {
        let mut guard = self.pool.lock().await;
        let pool = guard.as_mut()?;

        let allocation = pool.allocations.remove(&InterfaceKey::from(interface))?;
        pool.free.insert(allocation.config.ip_address);

        debug!(
            device = %interface.device_id,
            interface = %interface.bsd_name,
            address = %allocation.config.ip_address,
            "Released address"
        );
        Some(allocation.config)
    }

    pub async fn allocation(&self, interface: &NetworkInterfaceInfo) -> Option<IpConfigurationInfo> {
        let guard = self.pool.lock().await;
        guard
            .as_ref()?
            .allocations
            .get(&InterfaceKey::from(interface))
            .map(|a| a.config)
    }

    /// Interfaces of `device_id` that currently hold an address
    pub async fn allocations_for_device(&self, device_id: &str) -> Vec<NetworkInterfaceInfo> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Vec::new();
        };
        let mut interfaces: Vec<NetworkInterfaceInfo> = pool
            .allocations
            .values()
            .filter(|a| a.interface.device_id == device_id)
            .map(|a| a.interface.clone())
            .collect();
        interfaces.sort_by(|a, b| a.bsd_name.cmp(&b.bsd_name));
        interfaces
    }

    /// Number of free addresses
    pub async fn available(&self) -> usize {
        self.pool.lock().await.as_ref().map_or(0, |p| p.free.len())
    }

    /// Number of active allocations
    pub async fn allocated(&self) -> usize {
        self.pool
            .lock()
            .await
            .as_ref()
            .map_or(0, |p| p.allocations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_interface;

    fn settings(prefix_len: u8) -> PoolSettings {
        PoolSettings {
            subnet: Ipv4Addr::new(10, 90, 0, 0),
            prefix_len,
            host_address: Some(Ipv4Addr::new(10, 90, 0, 1)),
            gateway: None,
        }
    }

    #[tokio::test]
    async fn test_first_assignment_skips_host_address() {
        let ipam = IpAddressManager::new(settings(24));
        ipam.initialize().await.unwrap();
        assert_eq!(ipam.available().await, 253);

        let config = ipam
            .assign(&create_mock_interface("dev-1", "en5"))
            .await
            .unwrap();
        assert_eq!(config.ip_address, Ipv4Addr::new(10, 90, 0, 2));
        assert_eq!(config.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.gateway, None);
    }

    #[tokio::test]
    async fn test_assign_is_idempotent_per_key() {
        let ipam = IpAddressManager::new(settings(24));
        ipam.initialize().await.unwrap();
        let interface = create_mock_interface("dev-1", "en5");

        let first = ipam.assign(&interface).await.unwrap();
        let second = ipam.assign(&interface).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ipam.allocated().await, 1);

        // Same interface name on another device is a different key
        let other = ipam
            .assign(&create_mock_interface("dev-2", "en5"))
            .await
            .unwrap();
        assert_ne!(first.ip_address, other.ip_address);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let ipam = IpAddressManager::new(settings(24));
        ipam.initialize().await.unwrap();
        let before = ipam.available().await;

        assert!(ipam.release(&create_mock_interface("ghost", "en9")).await.is_none());
        assert_eq!(ipam.available().await, before);
    }

    #[tokio::test]
    async fn test_gateway_is_reserved_and_reported() {
        let mut pool = settings(24);
        pool.gateway = Some(Ipv4Addr::new(10, 90, 0, 2));
        let ipam = IpAddressManager::new(pool);
        ipam.initialize().await.unwrap();

        let config = ipam
            .assign(&create_mock_interface("dev-1", "usb0"))
            .await
            .unwrap();
        assert_eq!(config.ip_address, Ipv4Addr::new(10, 90, 0, 3));
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 90, 0, 2)));
    }

    #[tokio::test]
    async fn test_degenerate_pool_fails_initialize() {
        let ipam = IpAddressManager::new(PoolSettings {
            subnet: Ipv4Addr::new(10, 90, 0, 1),
            prefix_len: 32,
            host_address: Some(Ipv4Addr::new(10, 90, 0, 1)),
            gateway: None,
        });
        assert!(matches!(ipam.initialize().await, Err(IpamError::PoolExhausted)));

        let invalid = IpAddressManager::new(settings(8));
        assert!(matches!(invalid.initialize().await, Err(IpamError::InvalidPool(_))));
    }

    #[tokio::test]
    async fn test_assign_before_initialize() {
        let ipam = IpAddressManager::new(settings(24));
        assert!(matches!(
            ipam.assign(&create_mock_interface("dev-1", "en5")).await,
            Err(IpamError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_reinitialize_keeps_allocations() {
        let ipam = IpAddressManager::new(settings(24));
        ipam.initialize().await.unwrap();
        let interface = create_mock_interface("dev-1", "en5");
        let config = ipam.assign(&interface).await.unwrap();

        ipam.initialize().await.unwrap();
        assert_eq!(ipam.allocation(&interface).await, Some(config));
    }

    #[tokio::test]
    async fn test_allocations_for_device() {
        let ipam = IpAddressManager::new(settings(24));
        ipam.initialize().await.unwrap();
        ipam.assign(&create_mock_interface("dev-1", "usb1")).await.unwrap();
        ipam.assign(&create_mock_interface("dev-1", "usb0")).await.unwrap();
        ipam.assign(&create_mock_interface("dev-2", "usb2")).await.unwrap();

        let names: Vec<String> = ipam
            .allocations_for_device("dev-1")
            .await
            .into_iter()
            .map(|i| i.bsd_name)
            .collect();
        assert_eq!(names, vec!["usb0", "usb1"]);
    }
}
