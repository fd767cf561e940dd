//! Systemd service integration
//!
//! Implements the client side of the sd_notify protocol: readiness, status,
//! stopping and watchdog keepalives are sent as datagrams to the socket
//! named by `NOTIFY_SOCKET`. Outside systemd every call is a quiet no-op.

use anyhow::{Context, Result};
use std::env;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Send one state assignment (`READY=1`, `STATUS=...`) to `socket`
///
/// A leading `@` names a socket in the abstract namespace.
fn send_state(socket: &str, state: &str) -> Result<()> {
    let datagram = UnixDatagram::unbound().context("Failed to create notify socket")?;

    let sent = if let Some(name) = socket.strip_prefix('@') {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())
            .context("Invalid abstract NOTIFY_SOCKET name")?;
        datagram.send_to_addr(state.as_bytes(), &addr)
    } else {
        datagram.send_to(state.as_bytes(), socket)
    };
    sent.with_context(|| format!("Failed to send '{}' to systemd", state))?;

    Ok(())
}

/// Returns whether a notification was sent
fn notify(state: &str) -> Result<bool> {
    match env::var("NOTIFY_SOCKET") {
        Ok(socket) => send_state(&socket, state).map(|()| true),
        Err(_) => Ok(false),
    }
}

pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Keepalive period for a `WATCHDOG_USEC` value: half the timeout, at least 1s
fn keepalive_interval(watchdog_usec: Option<&str>) -> Option<Duration> {
    let usec: u64 = watchdog_usec?.parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2).max(Duration::from_secs(1)))
}

/// Watchdog keepalive period, if systemd enabled the watchdog
pub fn watchdog_interval() -> Option<Duration> {
    keepalive_interval(env::var("WATCHDOG_USEC").ok().as_deref())
}

/// Spawn the watchdog keepalive task
///
/// Returns an already finished task when the watchdog is disabled, so the
/// caller can always `abort()` the handle on shutdown.
pub fn spawn_watchdog_task() -> JoinHandle<()> {
    let Some(interval) = watchdog_interval() else {
        debug!("Systemd watchdog not enabled");
        return tokio::spawn(async {});
    };

    info!("Systemd watchdog enabled, keepalive every {:?}", interval);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    })
}
