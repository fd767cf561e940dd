//! Helper daemon orchestration
//!
//! [`HelperDaemon`] owns the lifecycle; [`Reconciler`] is the event handler
//! it registers with the monitor. For every fleet device that appears, the
//! reconciler walks its interfaces and, for each one on its own, asks the
//! privileged helper whether it is already configured, allocates an address
//! and applies it. When a device disappears the same interfaces are cleaned
//! up and their addresses returned to the pool.

use crate::config::DaemonConfig;
use crate::discovery::DiscoveryProvider;
use crate::error::DaemonError;
use crate::ipam::IpAddressManager;
use crate::monitor::{DeviceEventHandler, UsbMonitor};
use crate::network::PrivilegedNetwork;
use crate::service;
use async_trait::async_trait;
use common::{DeviceEvent, UsbDeviceInfo};
use protocol::{IpConfigurationInfo, NetworkInterfaceInfo};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Outcome of reconciling one device's interfaces
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Interfaces configured by this pass
    pub configured: Vec<String>,
    /// Interfaces the helper reported as already configured
    pub already_configured: Vec<String>,
    /// Interfaces whose configuration failed
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.configured.is_empty() && self.already_configured.is_empty() && self.failed.is_empty()
    }
}

enum InterfaceOutcome {
    AlreadyConfigured,
    Configured(IpConfigurationInfo),
}

pub struct Reconciler {
    discovery: Arc<dyn DiscoveryProvider>,
    ipam: Arc<IpAddressManager>,
    network: Arc<dyn PrivilegedNetwork>,
    retry_incomplete: bool,
    /// Present devices with at least one interface left unconfigured
    incomplete: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(
        discovery: Arc<dyn DiscoveryProvider>,
        ipam: Arc<IpAddressManager>,
        network: Arc<dyn PrivilegedNetwork>,
        retry_incomplete: bool,
    ) -> Self {
        Self {
            discovery,
            ipam,
            network,
            retry_incomplete,
            incomplete: Mutex::new(HashSet::new()),
        }
    }

    /// Ids of devices waiting for a retry
    pub async fn incomplete_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.incomplete.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    async fn interfaces_of(&self, device: &UsbDeviceInfo) -> Vec<NetworkInterfaceInfo> {
        let discovery = self.discovery.clone();
        let owner = device.clone();
        match tokio::task::spawn_blocking(move || discovery.interfaces_for_device(&owner)).await {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!(device = %device.id, "Interface enumeration task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Bring every interface of a newly attached device to a configured state
    pub async fn device_connected(&self, device: &UsbDeviceInfo) -> ReconcileReport {
        let interfaces = self.interfaces_of(device).await;
        let mut report = ReconcileReport::default();

        if interfaces.is_empty() {
            debug!(device = %device.id, "No Ethernet interfaces visible yet");
        }

        for interface in &interfaces {
            match self.configure_interface(interface).await {
                Ok(InterfaceOutcome::AlreadyConfigured) => {
                    debug!(
                        device = %device.id,
                        interface = %interface.bsd_name,
                        "Interface already configured, skipping"
                    );
                    report.already_configured.push(interface.bsd_name.clone());
                }
                Ok(InterfaceOutcome::Configured(config)) => {
                    info!(
                        device = %device.id,
                        interface = %interface.bsd_name,
                        address = %config,
                        "Configured interface"
                    );
                    report.configured.push(interface.bsd_name.clone());
                }
                Err(e) => {
                    error!(
                        device = %device.id,
                        interface = %interface.bsd_name,
                        "Failed to configure interface: {}",
                        e
                    );
                    report.failed.push(interface.bsd_name.clone());
                }
            }
        }

        if self.retry_incomplete {
            let mut incomplete = self.incomplete.lock().await;
            if interfaces.is_empty() || !report.is_complete() {
                incomplete.insert(device.id.clone());
            } else {
                incomplete.remove(&device.id);
            }
        }

        report
    }

    async fn configure_interface(
        &self,
        interface: &NetworkInterfaceInfo,
    ) -> Result<InterfaceOutcome, DaemonError> {
        if self.network.is_interface_configured(interface).await? {
            return Ok(InterfaceOutcome::AlreadyConfigured);
        }

        // A failed configure keeps the allocation so a retry reuses the address
        let config = self.ipam.assign(interface).await?;
        self.network.configure_interface(interface, &config).await?;
        Ok(InterfaceOutcome::Configured(config))
    }

    /// Undo configuration for every interface of a detached device
    ///
    /// Covers the interfaces still visible plus any the allocation table
    /// records for the device; the OS usually removes the interface together
    /// with the device. Local allocations are released whatever the helper
    /// answers.
    pub async fn device_disconnected(&self, device: &UsbDeviceInfo) {
        self.incomplete.lock().await.remove(&device.id);

        let mut interfaces = self.interfaces_of(device).await;
        for allocated in self.ipam.allocations_for_device(&device.id).await {
            if !interfaces.iter().any(|i| i.bsd_name == allocated.bsd_name) {
                interfaces.push(allocated);
            }
        }
        interfaces.sort_by(|a, b| a.bsd_name.cmp(&b.bsd_name));

        for interface in &interfaces {
            if let Err(e) = self.network.cleanup_interface(interface).await {
                warn!(
                    device = %device.id,
                    interface = %interface.bsd_name,
                    "Cleanup failed: {}",
                    e
                );
            }

            if let Some(config) = self.ipam.release(interface).await {
                info!(
                    device = %device.id,
                    interface = %interface.bsd_name,
                    address = %config.ip_address,
                    "Released interface"
                );
            }
        }
    }
}

#[async_trait]
impl DeviceEventHandler for Reconciler {
    async fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected(device) => {
                info!(device = %device.id, "Fleet device connected: {}", device.name);
                let report = self.device_connected(&device).await;
                if !report.is_empty() {
                    debug!(device = %device.id, ?report, "Connect handling finished");
                }
            }
            DeviceEvent::Disconnected(device) => {
                info!(device = %device.id, "Fleet device disconnected: {}", device.name);
                self.device_disconnected(&device).await;
            }
        }
    }

    async fn poll_completed(&self, present: &[UsbDeviceInfo]) {
        if !self.retry_incomplete {
            return;
        }

        let pending: Vec<UsbDeviceInfo> = {
            let mut incomplete = self.incomplete.lock().await;
            incomplete.retain(|id| present.iter().any(|d| &d.id == id));
            present
                .iter()
                .filter(|d| incomplete.contains(&d.id))
                .cloned()
                .collect()
        };

        for device in pending {
            debug!(device = %device.id, "Retrying incomplete device");
            self.device_connected(&device).await;
        }
    }
}

pub struct HelperDaemon {
    monitor: UsbMonitor,
    reconciler: Arc<Reconciler>,
    ipam: Arc<IpAddressManager>,
    network: Arc<dyn PrivilegedNetwork>,
    running: Mutex<bool>,
    start_retry: Duration,
}

impl HelperDaemon {
    pub fn new(
        config: &DaemonConfig,
        discovery: Arc<dyn DiscoveryProvider>,
        network: Arc<dyn PrivilegedNetwork>,
    ) -> Result<Self, DaemonError> {
        config
            .validate()
            .map_err(|e| common::Error::Config(format!("{:#}", e)))?;
        let filters = config.device_filters()?;
        let ipam = Arc::new(IpAddressManager::new(config.pool.clone()));
        let reconciler = Arc::new(Reconciler::new(
            discovery.clone(),
            ipam.clone(),
            network.clone(),
            config.daemon.retry_incomplete,
        ));
        let monitor = UsbMonitor::new(discovery, filters)
            .with_poll_interval(config.usb.poll_interval())
            .with_stop_grace(config.usb.stop_grace());

        Ok(Self {
            monitor,
            reconciler,
            ipam,
            network,
            running: Mutex::new(false),
            start_retry: config.usb.poll_interval(),
        })
    }

    /// Override the poll interval (and the start retry delay) from the config
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.monitor = self.monitor.with_poll_interval(interval);
        self.start_retry = interval;
        self
    }

    pub fn ipam(&self) -> &Arc<IpAddressManager> {
        &self.ipam
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Start monitoring; a no-op when already running
    ///
    /// On error the daemon stays stopped.
    pub async fn start(&self) -> Result<(), DaemonError> {
        let mut running = self.running.lock().await;
        if *running {
            debug!("Daemon already running");
            return Ok(());
        }

        self.ipam.initialize().await?;

        match self.network.handshake().await {
            Ok(version) => info!("Privileged helper reachable (protocol {})", version),
            Err(e) => warn!("Privileged helper handshake failed: {}", e),
        }

        self.monitor.set_handler(self.reconciler.clone()).await;
        self.monitor.start().await?;

        *running = true;
        info!("Daemon started");
        Ok(())
    }

    /// Stop monitoring; a no-op when not running
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }

        self.monitor.stop().await;
        *running = false;
        info!("Daemon stopped");
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run_until_shutdown(&self) {
        self.run_until(shutdown_signal()).await;
    }

    /// Run until `shutdown` resolves
    ///
    /// A failed start is retried every poll interval; nothing short of the
    /// shutdown future ends the loop.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            match self.start().await {
                Ok(()) => break,
                Err(e) => {
                    error!("Failed to start daemon: {}, retrying in {:?}", e, self.start_retry);
                    if let Err(e) = service::notify_status(&format!("Start failed: {}", e)) {
                        debug!("systemd status update failed: {:#}", e);
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested before start completed");
                    return;
                }
                _ = tokio::time::sleep(self.start_retry) => {}
            }
        }

        let watchdog = service::spawn_watchdog_task();
        if let Err(e) = service::notify_ready() {
            warn!("Failed to notify systemd: {:#}", e);
        }
        if let Err(e) = service::notify_status("Monitoring USB devices") {
            debug!("systemd status update failed: {:#}", e);
        }

        shutdown.await;
        info!("Shutting down");

        if let Err(e) = service::notify_stopping() {
            warn!("Failed to notify systemd: {:#}", e);
        }
        watchdog.abort();
        self.stop().await;
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error waiting for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error installing SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::testing::{FakeDiscovery, NetworkCall, RecordingNetwork};
    use common::test_utils::{create_mock_config, create_mock_fleet_device, create_mock_interface};
    use std::net::Ipv4Addr;

    struct Fixture {
        discovery: Arc<FakeDiscovery>,
        network: Arc<RecordingNetwork>,
        ipam: Arc<IpAddressManager>,
        reconciler: Reconciler,
    }

    async fn fixture() -> Fixture {
        let discovery = Arc::new(FakeDiscovery::new());
        let network = Arc::new(RecordingNetwork::new());
        let ipam = Arc::new(IpAddressManager::new(Default::default()));
        ipam.initialize().await.unwrap();
        let reconciler = Reconciler::new(discovery.clone(), ipam.clone(), network.clone(), true);
        Fixture {
            discovery,
            network,
            ipam,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_connect_configures_new_interface() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        let en5 = NetworkInterfaceInfo::new("eth-1", "en5", "dev-1");
        f.discovery.attach(device.clone(), vec![en5.clone()]);

        let report = f.reconciler.device_connected(&device).await;

        assert_eq!(report.configured, vec!["en5"]);
        let expected = create_mock_config(2);
        assert_eq!(
            f.network.calls(),
            vec![
                NetworkCall::IsConfigured("en5".to_string()),
                NetworkCall::Configure("en5".to_string(), expected),
            ]
        );
        assert_eq!(f.ipam.allocation(&en5).await, Some(expected));
    }

    #[tokio::test]
    async fn test_connect_twice_configures_once() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        f.discovery
            .attach(device.clone(), vec![create_mock_interface("dev-1", "en5")]);

        f.reconciler.device_connected(&device).await;
        let second = f.reconciler.device_connected(&device).await;

        assert_eq!(second.already_configured, vec!["en5"]);
        assert_eq!(f.network.configure_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_preconfigured_interface_is_left_alone() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        f.discovery
            .attach(device.clone(), vec![create_mock_interface("dev-1", "usb0")]);
        f.network.preconfigure("usb0", create_mock_config(40));

        let report = f.reconciler.device_connected(&device).await;

        assert_eq!(report.already_configured, vec!["usb0"]);
        assert!(f.network.configure_calls().is_empty());
        assert_eq!(f.ipam.allocated().await, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        let a = create_mock_interface("dev-1", "usb0");
        let b = create_mock_interface("dev-1", "usb1");
        f.discovery.attach(device.clone(), vec![a.clone(), b.clone()]);
        f.network.fail_interface("usb0", true);

        let report = f.reconciler.device_connected(&device).await;

        assert_eq!(report.failed, vec!["usb0"]);
        assert_eq!(report.configured, vec!["usb1"]);
        let b_config = f.ipam.allocation(&b).await.unwrap();
        assert_eq!(f.network.configuration("usb1"), Some(b_config));
        assert_eq!(f.reconciler.incomplete_devices().await, vec!["dev-1"]);
    }

    #[tokio::test]
    async fn test_incomplete_device_is_retried_after_poll() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        let usb0 = create_mock_interface("dev-1", "usb0");
        f.discovery.attach(device.clone(), vec![usb0.clone()]);
        f.network.fail_interface("usb0", true);

        f.reconciler.device_connected(&device).await;
        let reserved = f.ipam.allocation(&usb0).await.unwrap();

        f.network.fail_interface("usb0", false);
        f.reconciler.poll_completed(&[device.clone()]).await;

        assert_eq!(f.network.configuration("usb0"), Some(reserved));
        assert!(f.reconciler.incomplete_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_helper_leaves_device_pending() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        f.discovery
            .attach(device.clone(), vec![create_mock_interface("dev-1", "en5")]);
        f.network.set_unreachable(true);

        let report = f.reconciler.device_connected(&device).await;

        assert_eq!(report.failed, vec!["en5"]);
        assert_eq!(f.ipam.allocated().await, 0);
        assert_eq!(f.reconciler.incomplete_devices().await, vec!["dev-1"]);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_and_releases() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        let en5 = NetworkInterfaceInfo::new("eth-1", "en5", "dev-1");
        f.discovery.attach(device.clone(), vec![en5.clone()]);
        f.reconciler.device_connected(&device).await;

        // The interface vanishes together with the device
        f.discovery.detach("dev-1");
        f.reconciler.device_disconnected(&device).await;

        assert_eq!(f.network.cleanup_calls(), vec!["en5"]);
        assert_eq!(f.ipam.allocation(&en5).await, None);

        let next = f
            .ipam
            .assign(&create_mock_interface("dev-2", "en6"))
            .await
            .unwrap();
        assert_eq!(next.ip_address, Ipv4Addr::new(10, 90, 0, 2));
    }

    #[tokio::test]
    async fn test_disconnect_releases_even_when_cleanup_fails() {
        let f = fixture().await;
        let device = create_mock_fleet_device("dev-1");
        let en5 = create_mock_interface("dev-1", "en5");
        f.discovery.attach(device.clone(), vec![en5.clone()]);
        f.reconciler.device_connected(&device).await;

        f.network.set_unauthorized(true);
        f.reconciler.device_disconnected(&device).await;

        assert_eq!(f.network.cleanup_calls(), vec!["en5"]);
        assert_eq!(f.ipam.allocation(&en5).await, None);
    }

    #[tokio::test]
    async fn test_daemon_lifecycle() {
        let discovery = Arc::new(FakeDiscovery::new());
        let network = Arc::new(RecordingNetwork::new());
        let daemon =
            HelperDaemon::new(&DaemonConfig::default(), discovery.clone(), network.clone())
                .unwrap();

        daemon.stop().await;
        assert!(!daemon.is_running().await);

        daemon.start().await.unwrap();
        daemon.start().await.unwrap();
        assert!(daemon.is_running().await);
        assert_eq!(network.calls(), vec![NetworkCall::Handshake]);

        daemon.stop().await;
        daemon.stop().await;
        assert!(!daemon.is_running().await);
    }

    #[tokio::test]
    async fn test_start_failure_keeps_daemon_stopped() {
        let discovery = Arc::new(FakeDiscovery::new());
        discovery.set_failing(true);
        let daemon = HelperDaemon::new(
            &DaemonConfig::default(),
            discovery.clone(),
            Arc::new(RecordingNetwork::new()),
        )
        .unwrap();

        let result = daemon.start().await;
        assert!(matches!(result, Err(DaemonError::Monitor(_))));
        assert!(!daemon.is_running().await);

        discovery.set_failing(false);
        daemon.start().await.unwrap();
        assert!(daemon.is_running().await);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_helper_does_not_block_start() {
        let network = Arc::new(RecordingNetwork::new());
        network.set_unreachable(true);
        let daemon = HelperDaemon::new(
            &DaemonConfig::default(),
            Arc::new(FakeDiscovery::new()),
            network,
        )
        .unwrap();

        daemon.start().await.unwrap();
        assert!(daemon.is_running().await);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_zero_poll_interval_never_reports_running() {
        let discovery = Arc::new(FakeDiscovery::new());
        discovery.attach(create_mock_fleet_device("dev-1"), vec![]);
        let network = Arc::new(RecordingNetwork::new());

        let mut config = DaemonConfig::default();
        config.usb.poll_interval_secs = 0;
        let result = HelperDaemon::new(&config, discovery.clone(), network.clone());
        assert!(matches!(result, Err(DaemonError::Config(_))));

        let daemon = HelperDaemon::new(&DaemonConfig::default(), discovery, network)
            .unwrap()
            .with_poll_interval(Duration::ZERO);
        let result = daemon.start().await;
        assert!(matches!(
            result,
            Err(DaemonError::Monitor(MonitorError::InvalidPollInterval(_)))
        ));
        assert!(!daemon.is_running().await);
    }
}
