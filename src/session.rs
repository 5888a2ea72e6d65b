//! Session orchestration: pairing, notification pumps, commands, teardown.
//!
//! [`SessionManager`] is the only thing the dashboards talk to. It never
//! returns an error: every failure is logged and left in
//! [`RegistryState::error`] for the UI to show.
//!
//! ```text
//! DeviceLink ──TransportEvent──▶ pump task ──decode──▶ watch::Sender<RegistryState>
//!                                                          │
//!                                          subscribe() ◀───┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::buffer::DeviceBuffers;
use crate::command::{Command, ControlSettings};
use crate::decode::DecodeStrategy;
use crate::error::SessionError;
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, DEFAULT_ROLLING_WINDOW};
use crate::registry::{RegistryState, SessionSnapshot};
use crate::rolling::RollingAverage;
use crate::transport::{DeviceFilter, DeviceLink, GattProfile, Transport, TransportEvent};
use crate::types::{DeviceKind, SessionId};

// ── SessionConfig ─────────────────────────────────────────────────────────────

/// Configuration for [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Samples kept per channel buffer. Default: `512`.
    pub buffer_capacity: usize,
    /// Span of the rolling RMS average. Default: 10 minutes.
    pub rolling_window: Duration,
    /// Which advertised names are paired with.
    pub filter: DeviceFilter,
    /// Service and characteristics resolved after connecting.
    pub profile: GattProfile,
    /// Payload format of the deployed firmware. Default: float32 frames.
    pub decoder: DecodeStrategy,
    /// How long the BLE transport scans before giving up. Default: `15 s`.
    pub scan_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            rolling_window: DEFAULT_ROLLING_WINDOW,
            filter: DeviceFilter::default(),
            profile: GattProfile::default(),
            decoder: DecodeStrategy::default(),
            scan_timeout: Duration::from_secs(15),
        }
    }
}

/// Raw payloads buffered per tap subscriber before the oldest are skipped.
pub const RAW_TAP_DEPTH: usize = 256;

/// One notification exactly as the device sent it, before decoding.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub id: SessionId,
    pub bytes: Arc<[u8]>,
}

// ── Internals ─────────────────────────────────────────────────────────────────

struct SessionLink {
    link: Arc<dyn DeviceLink>,
    write: Option<Uuid>,
    pump: Option<JoinHandle<()>>,
    /// Distinguishes this link from a later session that reuses the id.
    generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: watch::Sender<RegistryState>,
    raw: broadcast::Sender<RawPayload>,
    links: Mutex<HashMap<SessionId, SessionLink>>,
    generation: AtomicU64,
}

impl Inner {
    fn links(&self) -> MutexGuard<'_, HashMap<SessionId, SessionLink>> {
        // The table holds no invariants a panicking holder could break.
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_error(&self, message: String) {
        self.state.send_modify(|s| s.error = Some(message));
    }

    /// Remove session `id` if it still belongs to `generation`.
    async fn teardown_if_current(&self, id: &SessionId, generation: u64) {
        let entry = {
            let mut links = self.links();
            if links.get(id).is_some_and(|l| l.generation == generation) {
                self.state.send_modify(|s| {
                    s.remove(id);
                });
                links.remove(id)
            } else {
                None
            }
        };
        if let Some(entry) = entry {
            info!("{id}: link lost, session closed");
            if let Err(e) = entry.link.disconnect().await {
                debug!("{id}: release after link loss: {e}");
            }
        }
    }
}

// ── SessionManager ────────────────────────────────────────────────────────────

/// Owns every device session and the registry they publish into.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(RegistryState::default());
        let (raw, _) = broadcast::channel(RAW_TAP_DEPTH);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                raw,
                links: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Receiver that is marked changed on every registry update.
    pub fn subscribe(&self) -> watch::Receiver<RegistryState> {
        self.inner.state.subscribe()
    }

    /// Every notification from every session, undecoded, including payloads
    /// the decoder rejects. A slow receiver skips the oldest ones.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<RawPayload> {
        self.inner.raw.subscribe()
    }

    /// Borrow the current state. Do not hold across an `.await`.
    pub fn state(&self) -> watch::Ref<'_, RegistryState> {
        self.inner.state.borrow()
    }

    /// Owned copy of one session.
    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.state.borrow().get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.state.borrow().ids().cloned().collect()
    }

    pub fn is_connected(&self, id: &SessionId) -> bool {
        self.inner.links().contains_key(id)
    }

    /// Latest error message, if any.
    pub fn status(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    pub fn clear_status(&self) {
        self.inner.state.send_if_modified(|s| s.error.take().is_some());
    }

    /// Control settings last applied, or the defaults.
    pub fn controls(&self) -> ControlSettings {
        self.inner.state.borrow().controls.unwrap_or_default()
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    /// Pair with one more device.
    ///
    /// Returns the new session id, or `None` with [`status`](Self::status) set.
    /// Several connects may run at once; each one lands in the registry
    /// without disturbing the others.
    pub async fn connect(&self, kind: DeviceKind) -> Option<SessionId> {
        self.clear_status();
        match self.try_connect(kind).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("connect ({}) failed: {e}", kind.label());
                self.inner.set_error(e.to_string());
                None
            }
        }
    }

    async fn try_connect(&self, kind: DeviceKind) -> Result<SessionId, SessionError> {
        let inner = &self.inner;
        let cfg = &inner.config;

        let link: Arc<dyn DeviceLink> = Arc::from(inner.transport.request_device(&cfg.filter).await?);
        let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
        let id = SessionId::from_transport(link.id(), generation);
        if self.is_connected(&id) {
            // Same physical device; leave the live session's link alone.
            return Err(SessionError::AlreadyConnected(id));
        }

        link.connect().await?;
        let setup = async {
            let endpoints = link.resolve(&cfg.profile).await?;
            let events = link.subscribe(endpoints.notify).await?;
            Ok::<_, SessionError>((endpoints, events))
        };
        let (endpoints, events) = match setup.await {
            Ok(ok) => ok,
            Err(e) => {
                if let Err(de) = link.disconnect().await {
                    debug!("{id}: cleanup after failed setup: {de}");
                }
                return Err(e);
            }
        };

        let name = link.name();
        let registered = {
            let mut links = inner.links();
            if links.contains_key(&id) {
                false
            } else {
                let snapshot = SessionSnapshot::new(
                    id.clone(),
                    kind,
                    DeviceBuffers::new(cfg.buffer_capacity),
                    RollingAverage::new(cfg.rolling_window),
                )
                .with_name(name.clone())
                .with_write(endpoints.write.is_some());
                inner.state.send_modify(|s| {
                    s.insert(snapshot);
                });
                let pump = tokio::spawn(pump(Arc::downgrade(inner), id.clone(), generation, events));
                links.insert(
                    id.clone(),
                    SessionLink {
                        link: Arc::clone(&link),
                        write: endpoints.write,
                        pump: Some(pump),
                        generation,
                    },
                );
                true
            }
        };
        if !registered {
            // Another connect for the same id won while this one was pairing.
            if let Err(e) = link.disconnect().await {
                debug!("{id}: release after losing the race: {e}");
            }
            return Err(SessionError::AlreadyConnected(id));
        }

        info!(
            "{id}: connected as {} ({})",
            kind.label(),
            name.as_deref().unwrap_or("unnamed")
        );
        Ok(id)
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Close one session, or every session when `target` is `None`.
    ///
    /// Unknown ids are a no-op, so calling this twice is the same as once.
    /// Transport errors while closing are logged and otherwise ignored.
    pub async fn disconnect(&self, target: Option<&SessionId>) {
        let removed: Vec<(SessionId, SessionLink)> = {
            let mut links = self.inner.links();
            let removed: Vec<_> = match target {
                Some(id) => links.remove_entry(id).into_iter().collect(),
                None => links.drain().collect(),
            };
            self.inner.state.send_modify(|s| {
                for (id, _) in &removed {
                    s.remove(id);
                }
            });
            removed
        };

        if removed.is_empty() {
            debug!("disconnect: nothing to do for {target:?}");
        }
        for (id, entry) in removed {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
            match entry.link.disconnect().await {
                Ok(()) => info!("{id}: disconnected"),
                Err(e) => warn!("{id}: disconnect error (ignored): {e}"),
            }
        }
    }

    // ── Send ─────────────────────────────────────────────────────────────────

    /// Write `payload` to one session, or to every session when `target` is
    /// `None`.
    ///
    /// Each device is written independently: one failure does not stop or
    /// undo the others. Returns `false` if any write failed, with the status
    /// set to the last failure. Broadcasting with no sessions returns `true`.
    pub async fn send(&self, payload: &[u8], target: Option<&SessionId>) -> bool {
        let targets: Vec<(SessionId, Arc<dyn DeviceLink>, Option<Uuid>)> = {
            let links = self.inner.links();
            match target {
                Some(id) => links
                    .get(id)
                    .map(|l| (id.clone(), Arc::clone(&l.link), l.write))
                    .into_iter()
                    .collect(),
                None => links
                    .iter()
                    .map(|(id, l)| (id.clone(), Arc::clone(&l.link), l.write))
                    .collect(),
            }
        };
        if let (Some(id), true) = (target, targets.is_empty()) {
            let e = SessionError::UnknownSession(id.clone());
            warn!("send: {e}");
            self.inner.set_error(e.to_string());
            return false;
        }

        let mut all_ok = true;
        for (id, link, write) in targets {
            let result = match write {
                Some(endpoint) => link.write(endpoint, payload).await.map_err(SessionError::from),
                None => Err(SessionError::NoWriteEndpoint(id.clone())),
            };
            match result {
                Ok(()) => debug!("{id}: wrote {:02x?}", payload),
                Err(e) => {
                    warn!("{id}: send failed: {e}");
                    self.inner.set_error(e.to_string());
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    // ── Controls ─────────────────────────────────────────────────────────────

    /// Record new control settings and send the commands whose value changed.
    ///
    /// The first update sends both. Delivery failures are logged only.
    pub async fn update_controls(&self, settings: ControlSettings, target: Option<&SessionId>) {
        let mut previous = None;
        self.inner
            .state
            .send_modify(|s| previous = s.controls.replace(settings));
        let commands = settings.changed_since(previous.as_ref());
        self.send_commands(&commands, target).await;
    }

    /// Re-send both commands with the current settings.
    pub async fn resend_controls(&self, target: Option<&SessionId>) {
        let commands = self.controls().commands();
        self.send_commands(&commands, target).await;
    }

    async fn send_commands(&self, commands: &[Command], target: Option<&SessionId>) {
        for command in commands {
            if !self.send(&command.encode(), target).await {
                warn!("{command:?} not delivered to every target");
            }
        }
    }
}

// ── Notification pump ─────────────────────────────────────────────────────────

/// Drain one link's events into the registry until the link goes away.
async fn pump(
    inner: Weak<Inner>,
    id: SessionId,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let mut decoded: u64 = 0;
    let mut dropped: u64 = 0;

    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Notification(payload) => {
                if inner.raw.receiver_count() > 0 {
                    let _ = inner.raw.send(RawPayload {
                        id: id.clone(),
                        bytes: Arc::from(payload.as_slice()),
                    });
                }
                match inner.config.decoder.decode(&payload) {
                    Some(readings) => {
                        decoded += 1;
                        if decoded <= 3 || decoded % 500 == 0 {
                            info!("{id}: frame #{decoded} len={} (dropped: {dropped})", payload.len());
                        }
                        let now = Instant::now();
                        inner.state.send_modify(|s| {
                            s.apply_readings(&id, &readings, now);
                        });
                    }
                    None => {
                        dropped += 1;
                        debug!("{id}: dropped undecodable payload ({} B)", payload.len());
                        inner.state.send_modify(|s| s.record_dropped(&id));
                    }
                }
            }
            TransportEvent::Disconnected => {
                info!("{id}: device reported disconnect");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.teardown_if_current(&id, generation).await;
    }
    debug!("{id}: pump finished after {decoded} frames");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimTransport};

    #[tokio::test]
    async fn failed_connect_sets_status_and_registers_nothing() {
        let sim = Arc::new(SimTransport::new());
        sim.push(SimDevice::new("x", "AudioVisor").failing_connect());
        let mgr = SessionManager::new(sim.clone(), SessionConfig::default());

        assert_eq!(mgr.connect(DeviceKind::Lr).await, None);
        assert!(mgr.status().is_some_and(|s| s.contains("refused")));
        assert!(mgr.state().is_empty());

        // Nothing queued: discovery fails the same way.
        assert_eq!(mgr.connect(DeviceKind::Lr).await, None);
        assert!(mgr.status().is_some());
    }

    #[tokio::test]
    async fn missing_service_disconnects_the_link() {
        let sim = Arc::new(SimTransport::new());
        let ctl = sim.push(SimDevice::new("x", "AudioVisor").without_service());
        let mgr = SessionManager::new(sim, SessionConfig::default());

        assert_eq!(mgr.connect(DeviceKind::Ud).await, None);
        assert_eq!(ctl.disconnect_calls(), 1);
        assert!(!ctl.is_connected());
    }

    #[tokio::test]
    async fn connect_clears_previous_error() {
        let sim = Arc::new(SimTransport::new());
        let mgr = SessionManager::new(sim.clone(), SessionConfig::default());
        assert_eq!(mgr.connect(DeviceKind::Lr).await, None);
        assert!(mgr.status().is_some());

        sim.push(SimDevice::new("ok", "AV-1"));
        assert_eq!(mgr.connect(DeviceKind::Lr).await, Some(SessionId::from("ok")));
        assert_eq!(mgr.status(), None);
    }

    #[tokio::test]
    async fn missing_id_gets_generated_one() {
        let sim = Arc::new(SimTransport::new());
        sim.push(SimDevice::new("unused", "AV-1").without_id());
        let mgr = SessionManager::new(sim, SessionConfig::default());
        let id = mgr.connect(DeviceKind::Lr).await.unwrap();
        assert!(id.as_str().starts_with("device-"));
    }
}
