//! Interface configuration backends
//!
//! [`IpCommandConfigurator`] drives iproute2's `ip` tool. Every method takes
//! an interface whose name has already been validated by the service layer.

use crate::error::{HelperError, Result};
use async_trait::async_trait;
use protocol::{IpConfigurationInfo, NetworkInterfaceInfo};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Metric for routes added via a configuration's gateway, kept high so they
/// never displace the host's primary default route
pub const GATEWAY_ROUTE_METRIC: u32 = 1024;

#[async_trait]
pub trait InterfaceConfigurator: Send + Sync + 'static {
    /// Whether the interface already carries a routable IPv4 address
    async fn is_configured(&self, interface: &NetworkInterfaceInfo) -> Result<bool>;

    async fn configure(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> Result<()>;

    /// Remove IPv4 configuration; succeeds if there is nothing to remove
    async fn cleanup(&self, interface: &NetworkInterfaceInfo) -> Result<()>;
}

pub struct IpCommandConfigurator {
    ip_binary: PathBuf,
}

impl Default for IpCommandConfigurator {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpCommandConfigurator {
    pub fn new(ip_binary: impl Into<PathBuf>) -> Self {
        Self {
            ip_binary: ip_binary.into(),
        }
    }

    /// Run `ip <args>` and return its stdout
    async fn ip(&self, args: &[&str]) -> Result<String> {
        let command = format!("ip {}", args.join(" "));
        debug!("Running {}", command);

        let output = Command::new(&self.ip_binary)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_device(&stderr)
            && let Some(name) = args.iter().skip_while(|a| **a != "dev").nth(1)
        {
            return Err(HelperError::NoSuchInterface(name.to_string()));
        }
        Err(HelperError::Command {
            command,
            status: output.status.to_string(),
            stderr,
        })
    }
}

#[async_trait]
impl InterfaceConfigurator for IpCommandConfigurator {
    async fn is_configured(&self, interface: &NetworkInterfaceInfo) -> Result<bool> {
        let output = self
            .ip(&["-4", "-o", "addr", "show", "dev", &interface.bsd_name])
            .await?;
        Ok(parse_ipv4_addresses(&output)
            .iter()
            .any(|(addr, _)| !addr.is_link_local()))
    }

    async fn configure(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> Result<()> {
        let prefix = config.prefix_len().ok_or_else(|| {
            HelperError::InvalidConfiguration(format!(
                "non-contiguous subnet mask {}",
                config.subnet_mask
            ))
        })?;
        let name = interface.bsd_name.as_str();
        let cidr = format!("{}/{}", config.ip_address, prefix);

        self.ip(&["link", "set", "dev", name, "up"]).await?;
        self.ip(&["-4", "addr", "replace", &cidr, "dev", name]).await?;

        if let Some(gateway) = config.gateway {
            let gateway = gateway.to_string();
            let metric = GATEWAY_ROUTE_METRIC.to_string();
            self.ip(&[
                "-4", "route", "replace", "default", "via", &gateway, "dev", name, "metric",
                &metric,
            ])
            .await?;
        }

        info!(interface = name, address = %config, "Applied configuration");
        Ok(())
    }

    async fn cleanup(&self, interface: &NetworkInterfaceInfo) -> Result<()> {
        let name = interface.bsd_name.as_str();
        match self.ip(&["-4", "addr", "flush", "dev", name]).await {
            Ok(_) => {
                info!(interface = name, "Flushed IPv4 configuration");
                Ok(())
            }
            // Interface went away with its device; nothing left to undo
            Err(HelperError::NoSuchInterface(_)) => {
                debug!(interface = name, "Interface already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

/// Extract `inet` addresses from `ip -4 -o addr show` output
pub fn parse_ipv4_addresses(output: &str) -> Vec<(Ipv4Addr, u8)> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet")?;
            let (addr, prefix) = tokens.next()?.split_once('/')?;
            Some((addr.parse().ok()?, prefix.parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_addresses() {
        let output = "\
5: usb0    inet 10.90.0.2/24 brd 10.90.0.255 scope global usb0\\       valid_lft forever preferred_lft forever
5: usb0    inet 169.254.12.7/16 brd 169.254.255.255 scope link usb0\\       valid_lft forever preferred_lft forever
";
        assert_eq!(
            parse_ipv4_addresses(output),
            vec![
                (Ipv4Addr::new(10, 90, 0, 2), 24),
                (Ipv4Addr::new(169, 254, 12, 7), 16)
            ]
        );
        assert!(parse_ipv4_addresses("").is_empty());
    }

    #[test]
    fn test_missing_device_detection() {
        assert!(is_missing_device("Device \"usb9\" does not exist."));
        assert!(is_missing_device("Cannot find device \"usb9\""));
        assert!(!is_missing_device("RTNETLINK answers: Operation not permitted"));
    }

    #[tokio::test]
    async fn test_missing_ip_binary_is_an_io_error() {
        let configurator = IpCommandConfigurator::new("/nonexistent/ip");
        let interface = NetworkInterfaceInfo::new("USB Ethernet", "usb0", "1-2");
        assert!(matches!(
            configurator.is_configured(&interface).await,
            Err(HelperError::Io(_))
        ));
    }
}
