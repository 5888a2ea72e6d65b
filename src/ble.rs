//! [`Transport`] implementation on top of `btleplug`.
//!
//! Works on every platform btleplug supports (BlueZ, CoreBluetooth, WinRT).
//! Discovery keeps scanning until the first accepted device shows up or the
//! scan timeout expires. Connection and GATT discovery carry hard timeouts so
//! a wedged adapter cannot block a pairing attempt forever.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    DeviceFilter, DeviceLink, Endpoints, GattProfile, Transport, TransportEvent,
    EVENT_CHANNEL_DEPTH,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ── BleTransport ──────────────────────────────────────────────────────────────

/// Discovers sensors on the first Bluetooth adapter of the host.
pub struct BleTransport {
    scan_timeout: Duration,
    adapter: OnceCell<Adapter>,
}

impl BleTransport {
    pub fn new(scan_timeout: Duration) -> Self {
        Self {
            scan_timeout,
            adapter: OnceCell::new(),
        }
    }

    async fn adapter(&self) -> TransportResult<&Adapter> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter found".into()))?;
                wait_powered_on(&adapter).await;
                Ok::<_, TransportError>(adapter)
            })
            .await
    }

    /// Poll until an accepted, not-yet-connected peripheral appears.
    async fn find_first(&self, adapter: &Adapter, filter: &DeviceFilter) -> Option<(Peripheral, String)> {
        let result = tokio::time::timeout(self.scan_timeout, async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    let Ok(Some(props)) = p.properties().await else {
                        continue;
                    };
                    let Some(name) = props.local_name else {
                        continue;
                    };
                    if !filter.accepts(&name) {
                        continue;
                    }
                    // Already owned by another session.
                    if p.is_connected().await.unwrap_or(false) {
                        debug!("find_first: skipping connected {name}");
                        continue;
                    }
                    return (p, name);
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;
        result.ok()
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

/// CoreBluetooth starts in an "unknown" state and silently ignores scans until
/// it reports PoweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                info!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still {state:?} after 3 s, scanning anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

#[async_trait]
impl Transport for BleTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Box<dyn DeviceLink>> {
        let adapter = self.adapter().await?;

        info!("Scanning for sensors (timeout: {} s)", self.scan_timeout.as_secs());
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self.find_first(adapter, filter).await;
        adapter.stop_scan().await.ok();

        let (peripheral, name) = found.ok_or_else(|| {
            TransportError::NoDevice(format!(
                "no matching sensor after {} s",
                self.scan_timeout.as_secs()
            ))
        })?;
        info!("Found device: {name}  id={}", peripheral.id());

        Ok(Box::new(BleLink {
            peripheral,
            adapter: adapter.clone(),
            name,
            write_type: Mutex::new(WriteType::WithoutResponse),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

// ── BleLink ───────────────────────────────────────────────────────────────────

/// One connected peripheral.
pub struct BleLink {
    peripheral: Peripheral,
    /// Kept to watch for `DeviceDisconnected` on the adapter that found us.
    adapter: Adapter,
    name: String,
    write_type: Mutex<WriteType>,
    /// Notification pump and disconnect watcher.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> TransportResult<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

fn writable(c: &Characteristic) -> bool {
    c.properties
        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

#[async_trait]
impl DeviceLink for BleLink {
    fn id(&self) -> Option<String> {
        Some(self.peripheral.id().to_string())
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    async fn connect(&self) -> TransportResult<()> {
        // BlueZ's Device1.Connect can block forever on a device out of range.
        tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout("BLE connect"))??;
        Ok(())
    }

    async fn resolve(&self, profile: &GattProfile) -> TransportResult<Endpoints> {
        // BlueZ reports the connection before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVERY_TIMEOUT, self.peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("service discovery"))??;

        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == profile.service)
            .ok_or(TransportError::MissingService(profile.service))?;

        let find = |uuid: Uuid| service.characteristics.iter().find(|c| c.uuid == uuid).cloned();

        let notify = find(profile.notify).ok_or(TransportError::MissingCharacteristic(profile.notify))?;

        let write = match profile.write.and_then(find) {
            Some(c) => Some(c),
            None if writable(&notify) => {
                debug!("{}: writing on the notify characteristic", self.name);
                Some(notify.clone())
            }
            None => {
                warn!("{}: no writable characteristic, commands disabled", self.name);
                None
            }
        };

        if let Some(c) = &write {
            let wt = if c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            };
            if let Ok(mut slot) = self.write_type.lock() {
                *slot = wt;
            }
        }

        info!(
            "Connected and services discovered: {}  notify={}  write={:?}",
            self.name,
            notify.uuid,
            write.as_ref().map(|c| c.uuid)
        );
        Ok(Endpoints {
            notify: notify.uuid,
            write: write.map(|c| c.uuid),
        })
    }

    async fn subscribe(&self, notify: Uuid) -> TransportResult<mpsc::Receiver<TransportEvent>> {
        let characteristic = self.characteristic(notify)?;
        self.peripheral.subscribe(&characteristic).await?;
        let mut notifications = self.peripheral.notifications().await?;

        let (tx, rx) = mpsc::channel::<TransportEvent>(EVENT_CHANNEL_DEPTH);

        // ── Disconnect watcher ──────────────────────────────────────────────
        // The adapter's DeviceDisconnected usually fires before the
        // notification stream closes.
        let disconnect_tx = tx.clone();
        let peripheral_id = self.peripheral.id();
        let adapter = self.adapter.clone();
        let watcher = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("Disconnect watcher: device {id:?} disconnected.");
                                let _ = disconnect_tx.send(TransportEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
            }
        });

        let name = self.name.clone();
        let pump = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(n) = notifications.next().await {
                if n.uuid != notify {
                    continue;
                }
                count += 1;
                if count <= 3 || count % 500 == 0 {
                    debug!("{name}: notif #{count} len={}", n.value.len());
                }
                if tx.send(TransportEvent::Notification(n.value)).await.is_err() {
                    return;
                }
            }
            info!("{name}: notification stream ended.");
            let _ = tx.send(TransportEvent::Disconnected).await;
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(watcher);
            tasks.push(pump);
        }
        Ok(rx)
    }

    async fn write(&self, endpoint: Uuid, payload: &[u8]) -> TransportResult<()> {
        let characteristic = self.characteristic(endpoint)?;
        let write_type = self
            .write_type
            .lock()
            .map(|wt| *wt)
            .unwrap_or(WriteType::WithoutResponse);
        self.peripheral
            .write(&characteristic, payload, write_type)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.abort_tasks();
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
