//! Privileged network operations
//!
//! The daemon runs unprivileged; anything that touches interface
//! configuration goes through a [`PrivilegedNetwork`] implementation. In
//! production that is [`PrivilegedNetworkClient`], which forwards each call
//! to the helper over its Unix socket.

pub mod client;

use crate::error::NetworkClientError;
use async_trait::async_trait;
use protocol::{IpConfigurationInfo, NetworkInterfaceInfo, ProtocolVersion};

pub use client::PrivilegedNetworkClient;

pub type Result<T> = std::result::Result<T, NetworkClientError>;

#[async_trait]
pub trait PrivilegedNetwork: Send + Sync + 'static {
    /// Check the helper is reachable; returns the version it speaks
    async fn handshake(&self) -> Result<ProtocolVersion>;

    /// Read-only check; any transport problem, including an absent
    /// helper, is reported as `ConnectionFailed`
    async fn is_interface_configured(&self, interface: &NetworkInterfaceInfo) -> Result<bool>;

    /// Fails with `NetworkConfigurationFailed` or `AuthorizationInvalid`
    /// when the helper refuses, `ConnectionFailed` or `DaemonNotRunning`
    /// when it cannot be reached
    async fn configure_interface(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> Result<()>;

    async fn cleanup_interface(&self, interface: &NetworkInterfaceInfo) -> Result<()>;

    /// Helper software version
    async fn get_version(&self) -> Result<String>;
}
