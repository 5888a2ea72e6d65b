//! Host → device control commands and the control settings they carry.
//!
//! Commands are fire-and-forget: two bytes, no acknowledgment, no sequence
//! number. The parameter is clamped here so firmware never has to validate.

use serde::{Deserialize, Serialize};

use crate::protocol::{
    BRIGHTNESS_RANGE, DEFAULT_BRIGHTNESS, DEFAULT_SENSITIVITY, OPCODE_SET_BRIGHTNESS,
    OPCODE_SET_SENSITIVITY, SENSITIVITY_RANGE,
};

/// A single control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// LED brightness, 0..=255.
    SetBrightness(u8),
    /// Input sensitivity in percent, 0..=100.
    SetSensitivity(u8),
}

fn clamp_to(value: i64, (min, max): (i64, i64)) -> u8 {
    // Both ranges sit inside 0..=255.
    value.clamp(min, max) as u8
}

impl Command {
    pub fn brightness(value: i64) -> Self {
        Command::SetBrightness(clamp_to(value, BRIGHTNESS_RANGE))
    }

    pub fn sensitivity(value: i64) -> Self {
        Command::SetSensitivity(clamp_to(value, SENSITIVITY_RANGE))
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::SetBrightness(_) => OPCODE_SET_BRIGHTNESS,
            Command::SetSensitivity(_) => OPCODE_SET_SENSITIVITY,
        }
    }

    /// Wire frame `[opcode, parameter]`.
    ///
    /// The parameter is clamped again so a hand-built variant still encodes
    /// inside its opcode's range.
    pub fn encode(&self) -> [u8; 2] {
        let param = match *self {
            Command::SetBrightness(v) => clamp_to(i64::from(v), BRIGHTNESS_RANGE),
            Command::SetSensitivity(v) => clamp_to(i64::from(v), SENSITIVITY_RANGE),
        };
        [self.opcode(), param]
    }

    /// Parse a 2-byte frame back into a command (used by the simulator).
    pub fn decode(frame: &[u8]) -> Option<Self> {
        match frame {
            [OPCODE_SET_BRIGHTNESS, v, ..] => Some(Command::brightness(i64::from(*v))),
            [OPCODE_SET_SENSITIVITY, v, ..] => Some(Command::sensitivity(i64::from(*v))),
            _ => None,
        }
    }
}

/// Control state mirrored to every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub sensitivity: u8,
    pub brightness: u8,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            brightness: DEFAULT_BRIGHTNESS,
        }
    }
}

impl ControlSettings {
    /// Build from arbitrary integers, clamping each into its range.
    pub fn clamped(sensitivity: i64, brightness: i64) -> Self {
        Self {
            sensitivity: clamp_to(sensitivity, SENSITIVITY_RANGE),
            brightness: clamp_to(brightness, BRIGHTNESS_RANGE),
        }
    }

    /// Both commands, brightness first.
    pub fn commands(&self) -> [Command; 2] {
        [
            Command::brightness(i64::from(self.brightness)),
            Command::sensitivity(i64::from(self.sensitivity)),
        ]
    }

    /// Commands for the settings that differ from `previous`.
    ///
    /// Each changed setting is re-sent in full; there is no delta encoding.
    /// With no previous state every command is returned.
    pub fn changed_since(&self, previous: Option<&ControlSettings>) -> Vec<Command> {
        let Some(prev) = previous else {
            return self.commands().to_vec();
        };
        let mut out = Vec::with_capacity(2);
        if prev.brightness != self.brightness {
            out.push(Command::brightness(i64::from(self.brightness)));
        }
        if prev.sensitivity != self.sensitivity {
            out.push(Command::sensitivity(i64::from(self.sensitivity)));
        }
        out
    }

    pub fn with_sensitivity(self, value: i64) -> Self {
        Self {
            sensitivity: clamp_to(value, SENSITIVITY_RANGE),
            ..self
        }
    }

    pub fn with_brightness(self, value: i64) -> Self {
        Self {
            brightness: clamp_to(value, BRIGHTNESS_RANGE),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_opcode_and_clamped_param() {
        assert_eq!(Command::brightness(300).encode(), [0x10, 255]);
        assert_eq!(Command::brightness(-4).encode(), [0x10, 0]);
        assert_eq!(Command::sensitivity(150).encode(), [0x11, 100]);
        assert_eq!(Command::sensitivity(42).encode(), [0x11, 42]);
        assert_eq!(Command::SetSensitivity(200).encode(), [0x11, 100]);
    }

    #[test]
    fn decode_round_trips_wire_frames() {
        assert_eq!(Command::decode(&[0x10, 7]), Some(Command::SetBrightness(7)));
        assert_eq!(Command::decode(&[0x11, 250]), Some(Command::SetSensitivity(100)));
        assert_eq!(Command::decode(&[0x12, 1]), None);
        assert_eq!(Command::decode(&[0x10]), None);
    }

    #[test]
    fn first_update_sends_everything() {
        let s = ControlSettings::default();
        assert_eq!(
            s.changed_since(None),
            vec![Command::SetBrightness(128), Command::SetSensitivity(50)]
        );
    }

    #[test]
    fn only_changed_settings_are_resent() {
        let prev = ControlSettings::default();
        let next = prev.with_sensitivity(70);
        assert_eq!(next.changed_since(Some(&prev)), vec![Command::SetSensitivity(70)]);
        assert!(prev.changed_since(Some(&prev)).is_empty());
        let both = ControlSettings::clamped(-1, 999);
        assert_eq!(both, ControlSettings { sensitivity: 0, brightness: 255 });
        assert_eq!(both.changed_since(Some(&prev)).len(), 2);
    }
}
