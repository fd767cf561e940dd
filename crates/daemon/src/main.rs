//! fleet-netd
//!
//! Host daemon that configures the network interfaces of USB-attached
//! fleet devices. Runs unprivileged; interface changes are applied by
//! `fleet-netd-helper`.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use daemon::{
    DaemonConfig, DiscoveryProvider, HelperDaemon, LinuxDiscovery, PrivilegedNetworkClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fleet-netd")]
#[command(
    author,
    version,
    about = "Fleet network daemon - configure USB-attached fleet devices"
)]
#[command(long_about = "
Watches the USB bus for fleet devices and assigns an address from a private
pool to every Ethernet interface they expose. The actual configuration is
applied by the privileged fleet-netd-helper service.

EXAMPLES:
    # Run with default config
    fleet-netd

    # Run in the foreground with debug logging
    fleet-netd --foreground --debug

    # List USB devices and their interfaces
    fleet-netd --list-devices

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/fleet-netd/daemon.toml
    3. /etc/fleet-netd/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log to stderr even if a log file is configured
    #[arg(short, long)]
    foreground: bool,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    debug: bool,

    /// Append logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = DaemonConfig::default_path();
        DaemonConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = if args.debug {
        "debug"
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(&config.daemon.log_level)
    };
    let log_file = if args.foreground {
        None
    } else {
        args.log_file.clone().or_else(|| config.daemon.log_file.clone())
    };
    setup_logging(log_level, log_file.as_deref()).context("Failed to setup logging")?;

    info!("fleet-netd v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let discovery = Arc::new(LinuxDiscovery::new().context("Failed to initialize USB access")?);

    if args.list_devices {
        return list_devices(discovery.as_ref(), &config);
    }

    let network = Arc::new(
        PrivilegedNetworkClient::new(&config.helper.socket_path)
            .with_request_timeout(config.helper.request_timeout()),
    );
    info!("Privileged helper socket: {}", config.helper.socket_path.display());

    let daemon = HelperDaemon::new(&config, discovery, network)
        .context("Failed to initialize daemon")?;
    daemon.run_until_shutdown().await;

    info!("fleet-netd shutdown complete");
    Ok(())
}

/// Print USB devices, marking fleet devices and their interfaces
fn list_devices(discovery: &LinuxDiscovery, config: &DaemonConfig) -> Result<()> {
    let filters = config.device_filters()?;
    let devices = discovery
        .list_usb_devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        let fleet = device.is_fleet_device(&filters);
        println!(
            "  [{}] {:04x}:{:04x} - {}{}",
            device.id,
            device.vendor_id,
            device.product_id,
            device.name,
            if fleet { "  (fleet)" } else { "" }
        );
        if fleet {
            for interface in discovery.interfaces_for_device(device) {
                println!("      {} - {}", interface.bsd_name, interface.name);
            }
        }
    }

    Ok(())
}
