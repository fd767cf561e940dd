//! Error types for the daemon components

use protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to enumerate USB devices or network interfaces
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("USB enumeration failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Failed to read {path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("USB monitor is already running")]
    AlreadyRunning,

    #[error("Invalid poll interval {0:?}")]
    InvalidPollInterval(std::time::Duration),

    #[error("Initial device enumeration failed: {0}")]
    DiscoveryFailed(#[source] DiscoveryError),
}

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Invalid address pool: {0}")]
    InvalidPool(String),

    #[error("Address pool not initialized")]
    NotInitialized,
}

/// Errors reported by the privileged network client
#[derive(Debug, Error)]
pub enum NetworkClientError {
    #[error("Privileged helper is not running ({0})")]
    DaemonNotRunning(String),

    #[error("Connection to privileged helper failed: {0}")]
    ConnectionFailed(String),

    #[error("Network configuration failed: {0}")]
    NetworkConfigurationFailed(String),

    #[error("Authorization rejected by privileged helper: {0}")]
    AuthorizationInvalid(String),

    #[error("Invalid response from privileged helper: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    Network(#[from] NetworkClientError),

    #[error("Configuration error: {0}")]
    Config(#[from] common::Error),
}
