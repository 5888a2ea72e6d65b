//! Snapshot state of every paired device.
//!
//! [`RegistryState`] is plain data. The session manager owns the only writer
//! and applies every change as a keyed transformation inside
//! `watch::Sender::send_modify`, so concurrent connects never lose an entry and
//! observers never see half an update.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::buffer::DeviceBuffers;
use crate::command::ControlSettings;
use crate::protocol::{DEFAULT_SENSITIVITY, SPECTRUM_BINS};
use crate::rolling::RollingAverage;
use crate::stats::{magnitude_spectrum, rms, rms_to_db, sensitivity_scale};
use crate::types::{Channel, ChannelReadings, DeviceKind, SessionId};

/// Everything the dashboard knows about one device session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: DeviceKind,
    /// Advertised name, when the transport reported one.
    pub name: Option<String>,
    pub buffers: DeviceBuffers,
    /// RMS history for the long-window level readout.
    pub rolling: RollingAverage,
    /// RMS of the level buffer after the most recent frame.
    pub latest_rms: f64,
    /// Notifications decoded so far.
    pub frames: u64,
    /// Notifications that could not be decoded.
    pub dropped: u64,
    /// `false` when the device has nothing to write commands to.
    pub has_write: bool,
    pub connected_at: Instant,
}

impl SessionSnapshot {
    pub fn new(id: SessionId, kind: DeviceKind, buffers: DeviceBuffers, rolling: RollingAverage) -> Self {
        Self {
            id,
            kind,
            name: None,
            buffers,
            rolling,
            latest_rms: 0.0,
            frames: 0,
            dropped: 0,
            has_write: true,
            connected_at: Instant::now(),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_write(mut self, has_write: bool) -> Self {
        self.has_write = has_write;
        self
    }

    /// Display name: the advertised name, else the short id.
    pub fn label(&self) -> String {
        match &self.name {
            Some(n) => format!("{} · {}", n, self.id.short()),
            None => self.id.short(),
        }
    }

    pub fn latest_db(&self) -> f64 {
        rms_to_db(self.latest_rms)
    }

    /// Mean RMS over the rolling window.
    pub fn average_rms(&self) -> f64 {
        self.rolling.average()
    }

    pub fn average_db(&self) -> f64 {
        rms_to_db(self.average_rms())
    }

    /// Magnitude spectrum of `channel` for the frequency view.
    pub fn spectrum(&self, channel: Channel) -> Vec<f64> {
        match self.buffers.get(channel) {
            Some(b) => magnitude_spectrum(&b.to_vec(), SPECTRUM_BINS),
            None => Vec::new(),
        }
    }

    /// Append one decoded frame and refresh the level statistics.
    fn ingest(&mut self, readings: &ChannelReadings, sensitivity: u8, now: Instant) {
        self.buffers.append(readings);
        self.frames += 1;
        if let Some(source) = self.buffers.level_source() {
            let level = rms(&source.to_vec(), sensitivity_scale(sensitivity));
            self.latest_rms = level;
            self.rolling.push_at(level, now);
        }
    }
}

/// The registry: sessions by id plus the control settings last sent.
#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    pub sessions: BTreeMap<SessionId, SessionSnapshot>,
    /// `None` until the first control update.
    pub controls: Option<ControlSettings>,
    /// Most recent error, cleared at the start of each connect.
    pub error: Option<String>,
}

impl RegistryState {
    /// Add a session. Returns `false`, leaving the existing entry untouched,
    /// when the id is already registered.
    pub fn insert(&mut self, snapshot: SessionSnapshot) -> bool {
        if self.sessions.contains_key(&snapshot.id) {
            return false;
        }
        self.sessions.insert(snapshot.id.clone(), snapshot);
        true
    }

    /// Remove a session together with all of its buffers and statistics.
    pub fn remove(&mut self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionSnapshot> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sensitivity used for RMS scaling.
    pub fn sensitivity(&self) -> u8 {
        self.controls
            .map(|c| c.sensitivity)
            .unwrap_or(DEFAULT_SENSITIVITY)
    }

    /// Apply a decoded frame to session `id`.
    ///
    /// Frames for an id that is no longer registered are ignored; returns
    /// whether the frame was applied.
    pub fn apply_readings(&mut self, id: &SessionId, readings: &ChannelReadings, now: Instant) -> bool {
        let sensitivity = self.sensitivity();
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.ingest(readings, sensitivity, now);
                true
            }
            None => false,
        }
    }

    pub fn record_dropped(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SessionSnapshot {
        SessionSnapshot::new(
            SessionId::from(id),
            DeviceKind::Lr,
            DeviceBuffers::new(4),
            RollingAverage::default(),
        )
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut state = RegistryState::default();
        assert!(state.insert(session("a")));
        let mut again = session("a");
        again.kind = DeviceKind::Ud;
        assert!(!state.insert(again));
        assert_eq!(state.get(&"a".into()).map(|s| s.kind), Some(DeviceKind::Lr));
    }

    #[test]
    fn readings_update_only_their_session() {
        let mut state = RegistryState::default();
        state.insert(session("a"));
        state.insert(session("b"));
        let now = Instant::now();
        assert!(state.apply_readings(&"a".into(), &ChannelReadings::stereo(0.5, 0.25), now));
        let a = state.get(&"a".into()).unwrap();
        assert_eq!(a.buffers.samples(Channel::Left), vec![0.5]);
        assert!((a.latest_rms - 0.5).abs() < 1e-6);
        assert_eq!(a.rolling.len(), 1);
        let b = state.get(&"b".into()).unwrap();
        assert!(b.buffers.get(Channel::Left).is_none());
        assert_eq!(b.frames, 0);
    }

    #[test]
    fn removed_session_ignores_late_frames() {
        let mut state = RegistryState::default();
        state.insert(session("a"));
        assert!(state.remove(&"a".into()).is_some());
        assert!(!state.apply_readings(&"a".into(), &ChannelReadings::stereo(1.0, 1.0), Instant::now()));
        assert!(state.is_empty());
    }

    #[test]
    fn sensitivity_scales_level() {
        let mut state = RegistryState {
            controls: Some(ControlSettings::clamped(100, 128)),
            ..RegistryState::default()
        };
        state.insert(session("a"));
        state.apply_readings(&"a".into(), &ChannelReadings::stereo(0.25, 0.0), Instant::now());
        let a = state.get(&"a".into()).unwrap();
        assert!((a.latest_rms - 0.5).abs() < 1e-6);
    }
}
