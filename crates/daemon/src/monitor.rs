//! USB monitor
//!
//! Polls the discovery provider on a fixed interval, diffs the observed
//! device set against the previous poll, and hands connect/disconnect
//! events for fleet devices to a single registered handler.
//!
//! Polling instead of native hot-plug keeps the monitor portable; the cost
//! is up to one interval of latency, so the interval is configurable.

use crate::discovery::DiscoveryProvider;
use crate::error::{DiscoveryError, MonitorError};
use async_trait::async_trait;
use common::{DeviceEvent, DeviceFilter, UsbDeviceInfo};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default poll period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default time `stop()` waits for in-flight handlers
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Receiver of monitor events
#[async_trait]
pub trait DeviceEventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: DeviceEvent);

    /// Called after every tick's events have been handled, with the fleet
    /// devices present in that tick
    async fn poll_completed(&self, _present: &[UsbDeviceInfo]) {}
}

type SharedHandler = Arc<RwLock<Option<Arc<dyn DeviceEventHandler>>>>;

enum MonitorState {
    Idle,
    Polling {
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

pub struct UsbMonitor {
    provider: Arc<dyn DiscoveryProvider>,
    filters: Arc<Vec<DeviceFilter>>,
    poll_interval: Duration,
    stop_grace: Duration,
    handler: SharedHandler,
    state: Mutex<MonitorState>,
}

impl UsbMonitor {
    pub fn new(provider: Arc<dyn DiscoveryProvider>, filters: Vec<DeviceFilter>) -> Self {
        Self {
            provider,
            filters: Arc::new(filters),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
            handler: Arc::new(RwLock::new(None)),
            state: Mutex::new(MonitorState::Idle),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Register the event handler, replacing any previous one
    pub async fn set_handler(&self, handler: Arc<dyn DeviceEventHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn is_polling(&self) -> bool {
        matches!(*self.state.lock().await, MonitorState::Polling { .. })
    }

    /// Start polling
    ///
    /// The first enumeration happens before this returns; fleet devices that
    /// are already attached are reported as connected on the first tick.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut state = self.state.lock().await;
        if matches!(*state, MonitorState::Polling { .. }) {
            return Err(MonitorError::AlreadyRunning);
        }
        if self.poll_interval.is_zero() {
            return Err(MonitorError::InvalidPollInterval(self.poll_interval));
        }

        let initial = enumerate(self.provider.clone())
            .await
            .map_err(MonitorError::DiscoveryFailed)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let poller = Poller {
            provider: self.provider.clone(),
            filters: self.filters.clone(),
            handler: self.handler.clone(),
            previous: BTreeMap::new(),
        };
        let task = tokio::spawn(poller.run(initial, self.poll_interval, shutdown_rx));

        *state = MonitorState::Polling { shutdown_tx, task };
        info!(
            "USB monitor started (interval {:?}, {} filter(s))",
            self.poll_interval,
            self.filters.len()
        );
        Ok(())
    }

    /// Stop polling; a no-op when idle
    ///
    /// In-flight handlers get `stop_grace` to finish. After that the poll task
    /// is detached rather than aborted, so a pending helper call completes
    /// on its own.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let MonitorState::Polling { shutdown_tx, task } =
            std::mem::replace(&mut *state, MonitorState::Idle)
        else {
            return;
        };

        let _ = shutdown_tx.send(());
        match time::timeout(self.stop_grace, task).await {
            Ok(Ok(())) => info!("USB monitor stopped"),
            Ok(Err(e)) => error!("USB monitor task failed: {}", e),
            Err(_) => warn!(
                "USB monitor still busy after {:?}, leaving in-flight work to finish",
                self.stop_grace
            ),
        }
    }
}

/// State owned by the polling task
struct Poller {
    provider: Arc<dyn DiscoveryProvider>,
    filters: Arc<Vec<DeviceFilter>>,
    handler: SharedHandler,
    previous: BTreeMap<String, UsbDeviceInfo>,
}

impl Poller {
    async fn run(
        mut self,
        initial: Vec<UsbDeviceInfo>,
        period: Duration,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut observed = Some(initial);
        loop {
            if let Some(devices) = observed.take() {
                self.tick(devices).await;
            }

            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    match enumerate(self.provider.clone()).await {
                        Ok(devices) => observed = Some(devices),
                        // Keep the previous set; an empty one would look like a mass unplug
                        Err(e) => warn!("USB poll failed, skipping tick: {}", e),
                    }
                }
            }
        }
        debug!("USB poll loop exited");
    }

    async fn tick(&mut self, devices: Vec<UsbDeviceInfo>) {
        let current = index_devices(devices);
        let events = diff_devices(&self.previous, &current, &self.filters);
        self.previous = current;

        let Some(handler) = self.handler.read().await.clone() else {
            if !events.is_empty() {
                debug!("No event handler registered, dropping {} event(s)", events.len());
            }
            return;
        };

        // One task per device; a device's own events stay in order
        let mut per_device: BTreeMap<String, Vec<DeviceEvent>> = BTreeMap::new();
        for event in events {
            per_device
                .entry(event.device().id.clone())
                .or_default()
                .push(event);
        }

        let mut tasks = JoinSet::new();
        for (_, device_events) in per_device {
            let handler = handler.clone();
            tasks.spawn(async move {
                for event in device_events {
                    handler.handle_event(event).await;
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Device event handler panicked: {}", e);
            }
        }

        let present: Vec<UsbDeviceInfo> = self
            .previous
            .values()
            .filter(|d| d.is_fleet_device(&self.filters))
            .cloned()
            .collect();
        handler.poll_completed(&present).await;
    }
}

async fn enumerate(
    provider: Arc<dyn DiscoveryProvider>,
) -> Result<Vec<UsbDeviceInfo>, DiscoveryError> {
    tokio::task::spawn_blocking(move || provider.list_usb_devices())
        .await
        .map_err(|e| DiscoveryError::Unavailable(format!("enumeration task failed: {}", e)))?
}

/// Key a device list by id; later duplicates win
pub fn index_devices(devices: Vec<UsbDeviceInfo>) -> BTreeMap<String, UsbDeviceInfo> {
    devices.into_iter().map(|d| (d.id.clone(), d)).collect()
}

/// Compute the events between two polls
///
/// Disconnects come first, then connects, each ordered by device id. A
/// device whose id survives but whose vendor/product changed is treated as
/// unplugged and plugged again.
pub fn diff_devices(
    previous: &BTreeMap<String, UsbDeviceInfo>,
    current: &BTreeMap<String, UsbDeviceInfo>,
    filters: &[DeviceFilter],
) -> Vec<DeviceEvent> {
    let mut disconnected = Vec::new();
    let mut connected = Vec::new();

    for (id, old) in previous {
        let replaced = current.get(id).is_some_and(|new| {
            new.vendor_id != old.vendor_id || new.product_id != old.product_id
        });
        if (replaced || !current.contains_key(id)) && old.is_fleet_device(filters) {
            disconnected.push(DeviceEvent::Disconnected(old.clone()));
        }
    }

    for (id, new) in current {
        let replaced = previous.get(id).is_some_and(|old| {
            new.vendor_id != old.vendor_id || new.product_id != old.product_id
        });
        if (replaced || !previous.contains_key(id)) && new.is_fleet_device(filters) {
            connected.push(DeviceEvent::Connected(new.clone()));
        }
    }

    disconnected.extend(connected);
    disconnected
}
