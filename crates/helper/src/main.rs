//! fleet-netd-helper
//!
//! Privileged service that applies interface configuration on behalf of
//! the unprivileged fleet-netd daemon. Must run as root.

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::setup_logging;
use helper::{AuthorizationPolicy, HelperService, IpCommandConfigurator};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleet-netd-helper")]
#[command(author, version, about = "Privileged network helper for fleet-netd")]
struct Args {
    /// Unix socket to listen on
    #[arg(short, long, value_name = "PATH", default_value = protocol::HELPER_SOCKET_PATH)]
    socket: PathBuf,

    /// Members of this group may configure interfaces (root always may)
    #[arg(short, long, value_name = "GROUP")]
    group: Option<String>,

    /// Path to the iproute2 `ip` binary
    #[arg(long, value_name = "PATH", default_value = "ip")]
    ip_binary: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, None).context("Failed to setup logging")?;

    info!("fleet-netd-helper v{}", env!("CARGO_PKG_VERSION"));
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; interface configuration will fail");
    }

    let policy = AuthorizationPolicy::from_group_name(args.group.as_deref())
        .context("Failed to resolve authorization group")?;
    match (&args.group, policy.group()) {
        (Some(name), Some(gid)) => info!("Authorization group: {} (gid {})", name, gid),
        _ => info!("Authorization: root only"),
    }

    let listener = bind_socket(&args.socket)?;
    info!("Listening on {}", args.socket.display());

    let service = Arc::new(HelperService::new(
        Arc::new(IpCommandConfigurator::new(&args.ip_binary)),
        policy,
    ));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    service
        .serve(listener, async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        })
        .await;

    if let Err(e) = fs::remove_file(&args.socket) {
        warn!("Failed to remove socket {}: {}", args.socket.display(), e);
    }
    info!("fleet-netd-helper shutdown complete");
    Ok(())
}

/// Bind the service socket, replacing a stale one
///
/// The socket is world-connectable; mutating requests are gated by peer
/// credentials, not by file permissions.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            bail!("Another helper is already listening on {}", path.display());
        }
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

    Ok(listener)
}
