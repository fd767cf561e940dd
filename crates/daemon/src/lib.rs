//! fleet-netd daemon library
//!
//! Watches the host's USB bus for fleet devices and keeps the Ethernet
//! interfaces they expose configured, delegating every privileged change
//! to the helper process over its Unix socket.
//!
//! The pieces, leaf first:
//! - [`discovery`]: read-only USB and network interface enumeration
//! - [`monitor`]: periodic polling that turns device set changes into events
//! - [`ipam`]: the address pool and allocation table
//! - [`network`]: the client side of the privileged helper protocol
//! - [`daemon`]: lifecycle and per-event reconciliation

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod ipam;
pub mod monitor;
pub mod network;
pub mod service;
pub mod testing;

pub use config::DaemonConfig;
pub use daemon::{HelperDaemon, ReconcileReport, Reconciler};
pub use discovery::{DiscoveryProvider, LinuxDiscovery};
pub use error::{DaemonError, DiscoveryError, IpamError, MonitorError, NetworkClientError};
pub use ipam::IpAddressManager;
pub use monitor::{DeviceEventHandler, UsbMonitor};
pub use network::{PrivilegedNetwork, PrivilegedNetworkClient};
