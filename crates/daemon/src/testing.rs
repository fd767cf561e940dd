//! In-memory stand-ins for the discovery provider and the privileged helper
//!
//! Used by the daemon's own tests and by the helper's end-to-end tests.

use crate::discovery::DiscoveryProvider;
use crate::error::{DiscoveryError, NetworkClientError};
use crate::network::{self, PrivilegedNetwork};
use async_trait::async_trait;
use common::UsbDeviceInfo;
use protocol::{CURRENT_VERSION, IpConfigurationInfo, NetworkInterfaceInfo, ProtocolVersion};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FakeHost {
    devices: BTreeMap<String, UsbDeviceInfo>,
    interfaces: Vec<NetworkInterfaceInfo>,
}

/// Discovery provider backed by a mutable in-memory host
#[derive(Default)]
pub struct FakeDiscovery {
    host: Mutex<FakeHost>,
    failing: AtomicBool,
}

impl FakeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device together with its interfaces
    pub fn attach(&self, device: UsbDeviceInfo, interfaces: Vec<NetworkInterfaceInfo>) {
        let mut host = lock(&self.host);
        host.interfaces.retain(|i| i.device_id != device.id);
        host.interfaces.extend(interfaces);
        host.devices.insert(device.id.clone(), device);
    }

    /// Unplug a device; its interfaces disappear with it
    pub fn detach(&self, device_id: &str) {
        let mut host = lock(&self.host);
        host.devices.remove(device_id);
        host.interfaces.retain(|i| i.device_id != device_id);
    }

    /// Make every enumeration fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DiscoveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Unavailable("simulated failure".to_string()));
        }
        Ok(())
    }
}

impl DiscoveryProvider for FakeDiscovery {
    fn list_usb_devices(&self) -> Result<Vec<UsbDeviceInfo>, DiscoveryError> {
        self.check()?;
        Ok(lock(&self.host).devices.values().cloned().collect())
    }

    fn list_ethernet_interfaces(&self) -> Result<Vec<NetworkInterfaceInfo>, DiscoveryError> {
        self.check()?;
        Ok(lock(&self.host).interfaces.clone())
    }
}

/// One call observed by [`RecordingNetwork`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCall {
    Handshake,
    IsConfigured(String),
    Configure(String, IpConfigurationInfo),
    Cleanup(String),
    GetVersion,
}

/// Privileged network double that records calls and tracks configured state
#[derive(Default)]
pub struct RecordingNetwork {
    calls: Mutex<Vec<NetworkCall>>,
    configured: Mutex<HashMap<String, IpConfigurationInfo>>,
    failing: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    unauthorized: AtomicBool,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `bsd_name` was already configured outside the daemon
    pub fn preconfigure(&self, bsd_name: &str, config: IpConfigurationInfo) {
        lock(&self.configured).insert(bsd_name.to_string(), config);
    }

    /// Fail every configure call for `bsd_name` until cleared
    pub fn fail_interface(&self, bsd_name: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(bsd_name.to_string());
        } else {
            set.remove(bsd_name);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<NetworkCall> {
        lock(&self.calls).clone()
    }

    pub fn configure_calls(&self) -> Vec<(String, IpConfigurationInfo)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NetworkCall::Configure(name, config) => Some((name, config)),
                _ => None,
            })
            .collect()
    }

    pub fn cleanup_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NetworkCall::Cleanup(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn configuration(&self, bsd_name: &str) -> Option<IpConfigurationInfo> {
        lock(&self.configured).get(bsd_name).copied()
    }

    fn record(&self, call: NetworkCall) -> network::Result<()> {
        lock(&self.calls).push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NetworkClientError::DaemonNotRunning(
                "simulated helper outage".to_string(),
            ));
        }
        Ok(())
    }

    fn authorize(&self) -> network::Result<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(NetworkClientError::AuthorizationInvalid(format!(
                "{}: missing right {}",
                protocol::AUTHORIZATION_DENIED,
                protocol::CONFIGURE_RIGHT
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PrivilegedNetwork for RecordingNetwork {
    async fn handshake(&self) -> network::Result<ProtocolVersion> {
        self.record(NetworkCall::Handshake)?;
        Ok(CURRENT_VERSION)
    }

    async fn is_interface_configured(
        &self,
        interface: &NetworkInterfaceInfo,
    ) -> network::Result<bool> {
        self.record(NetworkCall::IsConfigured(interface.bsd_name.clone()))
            .map_err(|e| NetworkClientError::ConnectionFailed(e.to_string()))?;
        Ok(lock(&self.configured).contains_key(&interface.bsd_name))
    }

    async fn configure_interface(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> network::Result<()> {
        self.record(NetworkCall::Configure(interface.bsd_name.clone(), *config))?;
        self.authorize()?;
        if lock(&self.failing).contains(&interface.bsd_name) {
            return Err(NetworkClientError::NetworkConfigurationFailed(format!(
                "simulated failure on {}",
                interface.bsd_name
            )));
        }
        lock(&self.configured).insert(interface.bsd_name.clone(), *config);
        Ok(())
    }

    async fn cleanup_interface(&self, interface: &NetworkInterfaceInfo) -> network::Result<()> {
        self.record(NetworkCall::Cleanup(interface.bsd_name.clone()))?;
        self.authorize()?;
        lock(&self.configured).remove(&interface.bsd_name);
        Ok(())
    }

    async fn get_version(&self) -> network::Result<String> {
        self.record(NetworkCall::GetVersion)?;
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }
}
