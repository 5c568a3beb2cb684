//! `btleplug` implementation of [`Transport`] for JamMate pedals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::protocol::{CONTROL_CHARACTERISTIC, DEVICE_NAME_PREFIX, JAMMATE_SERVICE_UUID};
use crate::transport::{LinkEvent, Transport};

// ── JamMateDevice ────────────────────────────────────────────────────────────

/// A JamMate unit discovered during a BLE scan.
///
/// Returned by [`BleTransport::scan_all`]; pass to
/// [`BleTransport::with_device`] to bind a transport to that unit.
#[derive(Clone, Debug)]
pub struct JamMateDevice {
    /// Advertised device name (e.g. `"JamMate-01"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    pub(crate) peripheral: Peripheral,
    pub(crate) adapter: Adapter,
}

// ── BleConfig ────────────────────────────────────────────────────────────────

/// Configuration for [`BleTransport`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// BLE scan duration in seconds before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string.
    /// Default: `"JamMate"`.
    pub name_prefix: String,
    /// Upper bound on `connect()`. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Upper bound on GATT service discovery. Default: `15`.
    pub discover_timeout_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_prefix: DEVICE_NAME_PREFIX.into(),
            connect_timeout_secs: 10,
            discover_timeout_secs: 15,
        }
    }
}

// ── BleTransport ─────────────────────────────────────────────────────────────

/// Peripheral the transport is bound to, plus what the current link owns.
struct Link {
    adapter: Adapter,
    peripheral: Peripheral,
    name: String,
    control: Option<Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// What a successful connect hands back to [`Transport::open`].
struct Opened {
    control: Characteristic,
    tasks: Vec<JoinHandle<()>>,
    events: mpsc::Receiver<LinkEvent>,
}

/// BLE link to one JamMate pedal.
///
/// The first [`open`](Transport::open) scans for a device matching
/// [`BleConfig::name_prefix`]. Later opens reconnect to the same peripheral
/// without scanning again.
///
/// The link lock is only held to read or store [`Link`] state, never across
/// a scan or a connect, so [`close`](Transport::close) is never stuck behind
/// an `open` in progress. An `open` that a `close` overtakes gives up with
/// [`TransportError::Closed`] and leaves the peripheral disconnected.
pub struct BleTransport {
    config: BleConfig,
    link: Mutex<Option<Link>>,
    /// Incremented by every `close`.
    epoch: AtomicU64,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self::bound(config, None)
    }

    /// Bind to a device found by [`scan_all`](Self::scan_all).
    pub fn with_device(config: BleConfig, device: JamMateDevice) -> Self {
        Self::bound(
            config,
            Some(Link {
                adapter: device.adapter,
                peripheral: device.peripheral,
                name: device.name,
                control: None,
                tasks: Vec::new(),
            }),
        )
    }

    fn bound(config: BleConfig, link: Option<Link>) -> Self {
        Self {
            config,
            link: Mutex::new(link),
            epoch: AtomicU64::new(0),
        }
    }

    /// Scan for **all** nearby JamMate units.
    ///
    /// The scan runs for the full `scan_timeout_secs` so every device in
    /// range has a chance to advertise.
    pub async fn scan_all(&self) -> Result<Vec<JamMateDevice>, TransportError> {
        let adapter = first_adapter().await?;

        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let found: Vec<JamMateDevice> = matching_peripherals(&adapter, &self.config.name_prefix)
            .await?
            .into_iter()
            .map(|(peripheral, name)| {
                let id = peripheral.id().to_string();
                info!("scan_all: found {name}  id={id}");
                JamMateDevice {
                    name,
                    id,
                    peripheral,
                    adapter: adapter.clone(),
                }
            })
            .collect();
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Name of the bound device, once one has been found.
    pub async fn device_name(&self) -> Option<String> {
        self.link.lock().await.as_ref().map(|l| l.name.clone())
    }

    /// `true` once a `close` has happened after `epoch` was read.
    fn closed_since(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn discover(&self) -> Result<Link, TransportError> {
        let adapter = first_adapter().await?;
        info!(
            "Scanning for {}* (timeout: {} s) …",
            self.config.name_prefix, self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = find_first(&adapter, &self.config.name_prefix, self.config.scan_timeout_secs).await;
        adapter.stop_scan().await.ok();
        let (peripheral, name) = found?;
        info!("Found device: {name}");
        Ok(Link {
            adapter,
            peripheral,
            name,
            control: None,
            tasks: Vec::new(),
        })
    }

    /// The bound peripheral with its old link torn down, scanning for one
    /// first if none is bound yet.
    async fn target(&self) -> Result<(Adapter, Peripheral, String), TransportError> {
        {
            let mut guard = self.link.lock().await;
            if let Some(link) = guard.as_mut() {
                link.stop_tasks();
                link.control = None;
                debug!("Reconnecting to known device {}", link.name);
                return Ok((link.adapter.clone(), link.peripheral.clone(), link.name.clone()));
            }
        }
        let link = self.discover().await?;
        let target = (link.adapter.clone(), link.peripheral.clone(), link.name.clone());
        *self.link.lock().await = Some(link);
        Ok(target)
    }

    async fn connect_link(
        &self,
        adapter: &Adapter,
        peripheral: &Peripheral,
        name: &str,
    ) -> Result<Opened, TransportError> {
        // BlueZ's Device1.Connect can block forever when the device is out of range.
        tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            peripheral.connect(),
        )
        .await
        .map_err(|_| TransportError::Timeout("connect"))??;

        // BlueZ reports the connection before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(
            Duration::from_secs(self.config.discover_timeout_secs),
            peripheral.discover_services(),
        )
        .await
        .map_err(|_| TransportError::Timeout("service discovery"))??;
        info!("Connected and services discovered: {name}");

        let control = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CONTROL_CHARACTERISTIC && c.service_uuid == JAMMATE_SERVICE_UUID)
            .ok_or(TransportError::CharacteristicNotFound(CONTROL_CHARACTERISTIC))?;
        peripheral.subscribe(&control).await?;
        let mut notifications = peripheral.notifications().await?;

        let (tx, rx) = mpsc::channel::<LinkEvent>(256);

        // ── Disconnect watcher ──────────────────────────────────────────────
        // DeviceDisconnected usually fires before the notification stream closes.
        let disconnect_tx = tx.clone();
        let adapter = adapter.clone();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("Disconnect watcher: device {id:?} disconnected.");
                                let _ = disconnect_tx.send(LinkEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                }
            }
        });

        // ── Notification pump ───────────────────────────────────────────────
        let pump = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(notif) = notifications.next().await {
                if notif.uuid != CONTROL_CHARACTERISTIC {
                    debug!("Ignoring notification from {}", notif.uuid);
                    continue;
                }
                count += 1;
                if count <= 5 || count % 500 == 0 {
                    debug!("notif #{count} len={}", notif.value.len());
                }
                if tx.send(LinkEvent::Notification(notif.value)).await.is_err() {
                    return;
                }
            }
            info!("Notification stream ended – device disconnected.");
            let _ = tx.send(LinkEvent::Disconnected).await;
        });

        Ok(Opened {
            control,
            tasks: vec![watcher, pump],
            events: rx,
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let (adapter, peripheral, name) = self.target().await?;
        if self.closed_since(epoch) {
            return Err(TransportError::Closed);
        }

        let mut opened = match self.connect_link(&adapter, &peripheral, &name).await {
            Ok(opened) => opened,
            Err(e) => {
                // Also cancels a connect that timed out while still pending.
                peripheral.disconnect().await.ok();
                return Err(e);
            }
        };

        {
            let mut guard = self.link.lock().await;
            if let Some(link) = guard.as_mut().filter(|_| !self.closed_since(epoch)) {
                link.control = Some(opened.control);
                link.tasks = opened.tasks;
                return Ok(opened.events);
            }
        }
        debug!("Link to {name} closed while opening");
        for task in opened.tasks.drain(..) {
            task.abort();
        }
        peripheral.disconnect().await.ok();
        Err(TransportError::Closed)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let (peripheral, control) = {
            let guard = self.link.lock().await;
            let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
            let control = link.control.clone().ok_or(TransportError::NotConnected)?;
            (link.peripheral.clone(), control)
        };
        peripheral
            .write(&control, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let (peripheral, name) = {
            let mut guard = self.link.lock().await;
            let Some(link) = guard.as_mut() else {
                return Ok(());
            };
            link.stop_tasks();
            link.control = None;
            (link.peripheral.clone(), link.name.clone())
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Disconnecting from {name}");
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// First adapter of the platform manager, ready to scan.
async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(TransportError::NoAdapter)?;
    #[cfg(target_os = "macos")]
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// `CBCentralManager` starts in an "unknown" state and scanning before it
/// reports PoweredOn is a silent no-op, so wait up to 3 s for it.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still in state {state:?} after 3 s, proceeding");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// Whether an advertised name belongs to a JamMate unit.
fn matches_prefix(local_name: Option<&str>, prefix: &str) -> bool {
    local_name.is_some_and(|name| name.starts_with(prefix))
}

/// Known peripherals whose advertised name matches `prefix`, with that name.
async fn matching_peripherals(
    adapter: &Adapter,
    prefix: &str,
) -> Result<Vec<(Peripheral, String)>, TransportError> {
    let mut found = vec![];
    for p in adapter.peripherals().await? {
        let Ok(Some(props)) = p.properties().await else {
            continue;
        };
        if let Some(name) = props
            .local_name
            .filter(|name| matches_prefix(Some(name.as_str()), prefix))
        {
            found.push((p, name));
        }
    }
    Ok(found)
}

/// Poll until the first matching peripheral appears or the timeout expires.
async fn find_first(
    adapter: &Adapter,
    prefix: &str,
    timeout_secs: u64,
) -> Result<(Peripheral, String), TransportError> {
    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        loop {
            let found = matching_peripherals(adapter, prefix).await.unwrap_or_default();
            if let Some(first) = found.into_iter().next() {
                return first;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;

    result.map_err(|_| TransportError::DeviceNotFound(prefix.to_string()))
}
