//! In-process transport with scripted devices.
//!
//! [`SimTransport`] hands out queued [`SimDevice`]s in order. Each device comes
//! with a [`SimController`] that plays the firmware's side of the link: push
//! notifications, drop the link, inspect what the host wrote, or make writes
//! fail. Devices built with [`SimDevice::synthetic`] generate a waveform on
//! their own, which is what `--simulate` in the binaries uses.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::protocol::WRITE_CHARACTERISTIC;
use crate::transport::{
    DeviceFilter, DeviceLink, Endpoints, GattProfile, Transport, TransportEvent,
    EVENT_CHANNEL_DEPTH,
};
use crate::types::DeviceKind;

/// Interval between synthetic frames.
pub const SYNTH_FRAME_INTERVAL: Duration = Duration::from_millis(10);

// ── Shared link state ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Shared {
    tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(mut g) = self.generator.lock() {
            if let Some(task) = g.take() {
                task.abort();
            }
        }
    }
}

// ── SimDevice ─────────────────────────────────────────────────────────────────

/// A scripted device waiting to be discovered.
pub struct SimDevice {
    id: Option<String>,
    name: String,
    has_write: bool,
    fail_connect: bool,
    missing_service: bool,
    connect_delay: Duration,
    synth: Option<DeviceKind>,
    shared: Arc<Shared>,
}

impl SimDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            has_write: true,
            fail_connect: false,
            missing_service: false,
            connect_delay: Duration::ZERO,
            synth: None,
            shared: Arc::default(),
        }
    }

    /// A device that streams a generated waveform once subscribed.
    ///
    /// `Lr` devices send 8-byte stereo frames, `Ud` devices 16-byte frames.
    pub fn synthetic(id: impl Into<String>, kind: DeviceKind) -> Self {
        let name = match kind {
            DeviceKind::Lr => "AV-SIM-LR",
            DeviceKind::Ud => "AV-SIM-UD",
        };
        Self {
            synth: Some(kind),
            ..Self::new(id, name)
        }
    }

    /// The transport reports no id for this device.
    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    /// The device exposes no writable characteristic.
    pub fn without_write(mut self) -> Self {
        self.has_write = false;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// The sensor service is absent after connecting.
    pub fn without_service(mut self) -> Self {
        self.missing_service = true;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn controller(&self) -> SimController {
        SimController {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ── SimController ─────────────────────────────────────────────────────────────

/// Firmware-side handle of a [`SimDevice`].
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimController {
    /// Deliver one notification. `false` when nobody is subscribed.
    pub async fn notify(&self, payload: impl Into<Vec<u8>>) -> bool {
        match self.shared.sender() {
            Some(tx) => tx
                .send(TransportEvent::Notification(payload.into()))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Drop the link as if the device powered off.
    pub async fn drop_link(&self) {
        if let Some(tx) = self.shared.sender() {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
        self.shared.close();
    }

    /// Every payload the host wrote, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// Writes that parse as control commands.
    pub fn commands(&self) -> Vec<Command> {
        self.writes().iter().filter_map(|w| Command::decode(w)).collect()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// How many times the host called `disconnect`.
    pub fn disconnect_calls(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }
}

// ── SimTransport ──────────────────────────────────────────────────────────────

/// Hands out queued devices, first in first out.
///
/// In synthetic mode an empty queue produces a fresh four-channel
/// [`SimDevice::synthetic`] on every request instead of failing.
#[derive(Default)]
pub struct SimTransport {
    pending: Mutex<VecDeque<SimDevice>>,
    synthetic: bool,
    spawned: AtomicUsize,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that never runs out of generated devices.
    pub fn synthetic() -> Self {
        Self {
            synthetic: true,
            ..Self::default()
        }
    }

    /// Queue a device and return its controller.
    pub fn push(&self, device: SimDevice) -> SimController {
        let controller = device.controller();
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(device);
        }
        controller
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Box<dyn DeviceLink>> {
        let device = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| TransportError::Unavailable("simulator poisoned".into()))?;
            let pos = pending.iter().position(|d| filter.accepts(&d.name));
            pos.and_then(|i| pending.remove(i))
        };
        let device = device.or_else(|| {
            self.synthetic.then(|| {
                let n = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
                SimDevice::synthetic(format!("sim-{n:04}"), DeviceKind::Ud)
            })
        });
        let device = device.ok_or_else(|| TransportError::NoDevice("no simulated device queued".into()))?;
        debug!("sim: handing out {}", device.name);
        Ok(Box::new(SimLink { device }))
    }
}

// ── SimLink ───────────────────────────────────────────────────────────────────

struct SimLink {
    device: SimDevice,
}

#[async_trait]
impl DeviceLink for SimLink {
    fn id(&self) -> Option<String> {
        self.device.id.clone()
    }

    fn name(&self) -> Option<String> {
        Some(self.device.name.clone())
    }

    async fn connect(&self) -> TransportResult<()> {
        if !self.device.connect_delay.is_zero() {
            tokio::time::sleep(self.device.connect_delay).await;
        }
        if self.device.fail_connect {
            return Err(TransportError::Connection(format!(
                "{} refused the connection",
                self.device.name
            )));
        }
        self.device.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve(&self, profile: &GattProfile) -> TransportResult<Endpoints> {
        if self.device.missing_service {
            return Err(TransportError::MissingService(profile.service));
        }
        Ok(Endpoints {
            notify: profile.notify,
            write: self
                .device
                .has_write
                .then(|| profile.write.unwrap_or(WRITE_CHARACTERISTIC)),
        })
    }

    async fn subscribe(&self, _notify: Uuid) -> TransportResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        if let Some(kind) = self.device.synth {
            let task = tokio::spawn(generate(tx.clone(), kind));
            if let Ok(mut g) = self.device.shared.generator.lock() {
                *g = Some(task);
            }
        }
        if let Ok(mut slot) = self.device.shared.tx.lock() {
            *slot = Some(tx);
        }
        Ok(rx)
    }

    async fn write(&self, _endpoint: Uuid, payload: &[u8]) -> TransportResult<()> {
        let shared = &self.device.shared;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write("simulated GATT error".into()));
        }
        if let Ok(mut w) = shared.writes.lock() {
            w.push(payload.to_vec());
        }
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.device.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        self.device.shared.close();
        Ok(())
    }
}

// ── Synthetic waveform ────────────────────────────────────────────────────────

/// One frame of the generated signal at sample index `i`, in firmware units.
pub fn synthetic_frame(kind: DeviceKind, i: u64) -> Vec<u8> {
    let t = i as f32 * SYNTH_FRAME_INTERVAL.as_secs_f32();
    // Slow swell so the rolling average visibly moves.
    let envelope = 0.6 + 0.4 * (TAU * 0.05 * t).sin();
    let left = envelope * (4.0 * (TAU * 3.0 * t).sin() + 1.5 * (TAU * 11.0 * t).sin());
    let right = envelope * (3.5 * (TAU * 3.0 * t + 0.8).sin() + 1.0 * (TAU * 17.0 * t).sin());

    let mut frame = Vec::with_capacity(16);
    frame.extend_from_slice(&left.to_le_bytes());
    frame.extend_from_slice(&right.to_le_bytes());
    if kind == DeviceKind::Ud {
        let up = envelope * 5.0 * (TAU * 2.0 * t).sin();
        let down = envelope * 2.5 * (TAU * 7.0 * t).cos();
        frame.extend_from_slice(&up.to_le_bytes());
        frame.extend_from_slice(&down.to_le_bytes());
    }
    frame
}

async fn generate(tx: mpsc::Sender<TransportEvent>, kind: DeviceKind) {
    info!("sim: {} generator started", kind.label());
    let mut tick = tokio::time::interval(SYNTH_FRAME_INTERVAL);
    let mut i: u64 = 0;
    loop {
        tick.tick().await;
        if tx
            .send(TransportEvent::Notification(synthetic_frame(kind, i)))
            .await
            .is_err()
        {
            break;
        }
        i += 1;
    }
    debug!("sim: generator stopped after {i} frames");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_float_frame;

    #[test]
    fn synthetic_frames_decode() {
        let lr = decode_float_frame(&synthetic_frame(DeviceKind::Lr, 5)).unwrap();
        assert!(lr.up.is_none());
        let ud = decode_float_frame(&synthetic_frame(DeviceKind::Ud, 5)).unwrap();
        assert!(ud.up.is_some() && ud.down.is_some());
    }

    #[tokio::test]
    async fn hands_out_devices_in_order() {
        let sim = SimTransport::new();
        sim.push(SimDevice::new("a", "AV-1"));
        sim.push(SimDevice::new("b", "AV-2"));
        let filter = DeviceFilter::default();
        let first = sim.request_device(&filter).await.unwrap();
        assert_eq!(first.id().as_deref(), Some("a"));
        let second = sim.request_device(&filter).await.unwrap();
        assert_eq!(second.id().as_deref(), Some("b"));
        assert!(matches!(
            sim.request_device(&filter).await,
            Err(TransportError::NoDevice(_))
        ));
    }

    #[tokio::test]
    async fn synthetic_mode_generates_devices() {
        let sim = SimTransport::synthetic();
        let filter = DeviceFilter::default();
        let a = sim.request_device(&filter).await.unwrap();
        let b = sim.request_device(&filter).await.unwrap();
        assert_eq!(a.id().as_deref(), Some("sim-0001"));
        assert_eq!(b.id().as_deref(), Some("sim-0002"));
    }

    #[tokio::test]
    async fn writes_are_recorded_until_closed() {
        let sim = SimTransport::new();
        let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
        let link = sim.request_device(&DeviceFilter::default()).await.unwrap();
        link.connect().await.unwrap();
        link.write(WRITE_CHARACTERISTIC, &[0x10, 5]).await.unwrap();
        assert_eq!(ctl.commands(), vec![Command::SetBrightness(5)]);

        ctl.set_fail_writes(true);
        assert!(link.write(WRITE_CHARACTERISTIC, &[0x10, 6]).await.is_err());

        link.disconnect().await.unwrap();
        assert!(!ctl.is_connected());
        assert_eq!(ctl.disconnect_calls(), 1);
    }
}
