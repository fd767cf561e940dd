//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use common::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipam::MIN_PREFIX_LEN;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub helper: HelperSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Append logs to this file instead of stderr (unless run in the foreground)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Retry devices whose interfaces could not all be configured on the next poll
    #[serde(default = "DaemonSettings::default_retry_incomplete")]
    pub retry_incomplete: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            retry_incomplete: Self::default_retry_incomplete(),
        }
    }
}

impl DaemonSettings {
    fn default_retry_incomplete() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns identifying fleet devices
    pub filters: Vec<String>,
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How long `stop` waits for in-flight interface work
    #[serde(default = "UsbSettings::default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            // Linux USB gadget composite device (g_ether / configfs gadgets)
            filters: vec!["0x1d6b:0x0104".to_string()],
            poll_interval_secs: Self::default_poll_interval(),
            stop_grace_secs: Self::default_stop_grace(),
        }
    }
}

impl UsbSettings {
    fn default_poll_interval() -> u64 {
        30
    }

    fn default_stop_grace() -> u64 {
        5
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Address pool handed out to device interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub subnet: Ipv4Addr,
    pub prefix_len: u8,
    /// The host's own address in the subnet; never handed out
    #[serde(default)]
    pub host_address: Option<Ipv4Addr>,
    /// Gateway included in every configuration; never handed out
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            subnet: Ipv4Addr::new(10, 90, 0, 0),
            prefix_len: 24,
            host_address: Some(Ipv4Addr::new(10, 90, 0, 1)),
            gateway: None,
        }
    }
}

impl PoolSettings {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0);
        u32::from(addr) & mask == u32::from(self.subnet) & mask
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSettings {
    pub socket_path: PathBuf,
    /// Upper bound on one request/response exchange with the helper
    #[serde(default = "HelperSettings::default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(protocol::HELPER_SOCKET_PATH),
            request_timeout_secs: Self::default_request_timeout(),
        }
    }
}

impl HelperSettings {
    fn default_request_timeout() -> u64 {
        10
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_tilde(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/fleet-netd/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.daemon.log_file = config.daemon.log_file.as_deref().map(expand_tilde);
        config.helper.socket_path = expand_tilde(&config.helper.socket_path);
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("fleet-netd").join("daemon.toml")
        } else {
            PathBuf::from(".config/fleet-netd/daemon.toml")
        }
    }

    /// Parsed fleet device filters
    pub fn device_filters(&self) -> common::Result<Vec<DeviceFilter>> {
        DeviceFilter::parse_all(&self.usb.filters)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.filters.is_empty() {
            return Err(anyhow!("usb.filters must name at least one fleet device"));
        }
        self.device_filters()?;

        if self.usb.poll_interval_secs == 0 {
            return Err(anyhow!("usb.poll_interval_secs must be at least 1"));
        }
        if self.helper.request_timeout_secs == 0 {
            return Err(anyhow!("helper.request_timeout_secs must be at least 1"));
        }

        let pool = &self.pool;
        if !(MIN_PREFIX_LEN..=32).contains(&pool.prefix_len) {
            return Err(anyhow!(
                "Invalid pool prefix length /{}, must be between /{} and /32",
                pool.prefix_len,
                MIN_PREFIX_LEN
            ));
        }
        for (name, addr) in [("host_address", pool.host_address), ("gateway", pool.gateway)] {
            if let Some(addr) = addr
                && !pool.contains(addr)
            {
                return Err(anyhow!(
                    "pool.{} {} is outside {}/{}",
                    name,
                    addr,
                    pool.subnet,
                    pool.prefix_len
                ));
            }
        }

        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.usb.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.pool.subnet, Ipv4Addr::new(10, 90, 0, 0));
        assert_eq!(
            config.helper.socket_path,
            PathBuf::from(protocol::HELPER_SOCKET_PATH)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.pool, parsed.pool);
        assert_eq!(config.usb.filters, parsed.usb.filters);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            [pool]
            subnet = "192.168.77.0"
            prefix_len = 28
            "#,
        )
        .unwrap();

        assert_eq!(parsed.pool.prefix_len, 28);
        assert_eq!(parsed.pool.host_address, None);
        assert_eq!(parsed.usb.poll_interval_secs, 30);
        assert!(parsed.daemon.retry_incomplete);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.usb.filters = vec!["1d6b:0104".to_string()];
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.usb.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.pool.prefix_len = 12;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.pool.host_address = Some(Ipv4Addr::new(10, 91, 0, 1));
        assert!(config.validate().is_err());
    }
}
