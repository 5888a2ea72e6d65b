//! Shared data types: channels, device kinds, decoded readings, session ids.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One named data stream produced by a sensor.
///
/// | Channel | Float32 layout | ASCII layout |
/// |---|---|---|
/// | `Left`  | bytes 0–3   | the scalar |
/// | `Right` | bytes 4–7   | the same scalar |
/// | `Up`    | bytes 8–11  | — |
/// | `Down`  | bytes 12–15 | — |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Left,
    Right,
    Up,
    Down,
}

impl Channel {
    /// All channels in wire order.
    pub const ALL: [Channel; 4] = [Channel::Left, Channel::Right, Channel::Up, Channel::Down];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Left => "left",
            Channel::Right => "right",
            Channel::Up => "up",
            Channel::Down => "down",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Role of a paired sensor.
///
/// Only tells the dashboard which channel pair to highlight; both kinds speak
/// the same wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Left/right sensor (`"lr"`).
    #[default]
    #[serde(rename = "lr")]
    Lr,
    /// Up/down ("behind") sensor (`"ud"`).
    #[serde(rename = "ud")]
    Ud,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Lr => "lr",
            DeviceKind::Ud => "ud",
        }
    }

    /// Human-readable label used by the dashboards.
    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Lr => "L/R",
            DeviceKind::Ud => "Up/Behind",
        }
    }

    /// The channel pair this kind of device is primarily about.
    pub fn primary_channels(self) -> [Channel; 2] {
        match self {
            DeviceKind::Lr => [Channel::Left, Channel::Right],
            DeviceKind::Ud => [Channel::Up, Channel::Down],
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lr" => Ok(DeviceKind::Lr),
            "ud" => Ok(DeviceKind::Ud),
            other => Err(format!("unknown device kind '{other}' (expected 'lr' or 'ud')")),
        }
    }
}

/// Stable identifier of one device session.
///
/// Taken from the transport when it reports one; otherwise generated from the
/// wall clock at pairing time plus a caller-supplied sequence number
/// (`device-<unix millis>-<seq>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Use the transport id when present and non-empty, else a generated id.
    ///
    /// `seq` keeps generated ids distinct when several devices pair within
    /// the same millisecond; the caller must never reuse it.
    pub fn from_transport(id: Option<String>, seq: u64) -> Self {
        match id {
            Some(id) if !id.trim().is_empty() => Self(id),
            _ => Self(format!("device-{}-{seq}", unix_millis())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last 8 characters, upper-cased, for compact display.
    pub fn short(&self) -> String {
        let trimmed = self.0.trim_matches(|c: char| c == '{' || c == '}');
        let start = trimmed
            .char_indices()
            .rev()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(0);
        trimmed[start..].to_uppercase()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Normalized samples decoded from one notification.
///
/// Every channel is optional: a short float payload carries only left and
/// right, an ASCII payload fills left and right with the same scalar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelReadings {
    pub left: Option<Vec<f32>>,
    pub right: Option<Vec<f32>>,
    pub up: Option<Vec<f32>>,
    pub down: Option<Vec<f32>>,
}

impl ChannelReadings {
    /// Left and right both set to `[value]`.
    pub fn stereo(left: f32, right: f32) -> Self {
        Self {
            left: Some(vec![left]),
            right: Some(vec![right]),
            ..Self::default()
        }
    }

    pub fn get(&self, channel: Channel) -> Option<&[f32]> {
        match channel {
            Channel::Left => self.left.as_deref(),
            Channel::Right => self.right.as_deref(),
            Channel::Up => self.up.as_deref(),
            Channel::Down => self.down.as_deref(),
        }
    }

    pub fn set(&mut self, channel: Channel, samples: Vec<f32>) {
        let slot = match channel {
            Channel::Left => &mut self.left,
            Channel::Right => &mut self.right,
            Channel::Up => &mut self.up,
            Channel::Down => &mut self.down,
        };
        *slot = Some(samples);
    }

    /// Channels that carry data, in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &[f32])> + '_ {
        Channel::ALL
            .into_iter()
            .filter_map(move |ch| self.get(ch).map(|s| (ch, s)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, s)| s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_parses_wire_names() {
        assert_eq!("lr".parse::<DeviceKind>(), Ok(DeviceKind::Lr));
        assert_eq!(" UD ".parse::<DeviceKind>(), Ok(DeviceKind::Ud));
        assert!("xy".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn session_id_falls_back_to_generated() {
        let id = SessionId::from_transport(None, 7);
        assert!(id.as_str().starts_with("device-"));
        assert!(id.as_str().ends_with("-7"));
        let id = SessionId::from_transport(Some("  ".into()), 8);
        assert!(id.as_str().starts_with("device-"));
        let id = SessionId::from_transport(Some("AA:BB".into()), 9);
        assert_eq!(id.as_str(), "AA:BB");
    }

    #[test]
    fn generated_ids_differ_by_sequence() {
        // Same millisecond is likely here; the sequence still separates them.
        let a = SessionId::from_transport(None, 1);
        let b = SessionId::from_transport(None, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn short_id_keeps_tail() {
        assert_eq!(SessionId::new("{1234567890abcdef}").short(), "90ABCDEF");
        assert_eq!(SessionId::new("ab").short(), "AB");
    }

    #[test]
    fn readings_iterate_in_wire_order() {
        let mut r = ChannelReadings::default();
        r.set(Channel::Down, vec![4.0]);
        r.set(Channel::Left, vec![1.0]);
        let chans: Vec<Channel> = r.iter().map(|(c, _)| c).collect();
        assert_eq!(chans, vec![Channel::Left, Channel::Down]);
        assert!(!r.is_empty());
        assert!(ChannelReadings::default().is_empty());
    }
}
