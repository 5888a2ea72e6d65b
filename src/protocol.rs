//! GATT UUIDs, device name filter, wire-format constants and defaults.
//!
//! The sensors expose the Nordic UART service: one characteristic notifies
//! amplitude frames to the host, a second accepts 2-byte control commands.

use std::time::Duration;

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service (Nordic UART).
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Device → host notifications (amplitude frames).
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Host → device control commands.
///
/// Some firmware builds accept writes on the notify characteristic instead;
/// the session falls back to it when this one is missing.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

// ── Device name filter ────────────────────────────────────────────────────────

/// Advertised names accepted verbatim.
pub const KNOWN_DEVICE_NAMES: [&str; 3] = ["AudioVisor", "ItsyBitsy", "CIRCUITPY"];

/// Any advertised name starting with this prefix is accepted too.
pub const DEVICE_NAME_PREFIX: &str = "AV-";

// ── Wire format ───────────────────────────────────────────────────────────────

/// Float frames are sent in roughly 0..10 and divided by this to land in 0..1.
pub const NORMALIZATION_DIVISOR: f32 = 10.0;

/// Smallest float frame: left + right.
pub const FLOAT_FRAME_STEREO_LEN: usize = 8;

/// Float frame carrying all four channels.
pub const FLOAT_FRAME_QUAD_LEN: usize = 16;

// ── Control commands ──────────────────────────────────────────────────────────

/// `[0x10, brightness]`, brightness in 0..=255.
pub const OPCODE_SET_BRIGHTNESS: u8 = 0x10;

/// `[0x11, sensitivity]`, sensitivity in 0..=100.
pub const OPCODE_SET_SENSITIVITY: u8 = 0x11;

pub const BRIGHTNESS_RANGE: (i64, i64) = (0, 255);
pub const SENSITIVITY_RANGE: (i64, i64) = (0, 100);

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Samples kept per (device, channel). About two seconds at 256 Hz.
pub const DEFAULT_BUFFER_CAPACITY: usize = 512;

/// Trailing window of the rolling RMS average.
pub const DEFAULT_ROLLING_WINDOW: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_SENSITIVITY: u8 = 50;
pub const DEFAULT_BRIGHTNESS: u8 = 128;

/// Samples fed to the frequency view.
pub const SPECTRUM_MAX_SAMPLES: usize = 1024;

/// Frequency bins shown by the dashboards.
pub const SPECTRUM_BINS: usize = 128;

/// Below this many samples the spectrum is left empty.
pub const SPECTRUM_MIN_SAMPLES: usize = 8;

/// Returns `true` when an advertised name belongs to a supported sensor.
pub fn is_known_device_name(name: &str) -> bool {
    KNOWN_DEVICE_NAMES.contains(&name) || name.starts_with(DEVICE_NAME_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_filter_accepts_exact_and_prefix() {
        assert!(is_known_device_name("ItsyBitsy"));
        assert!(is_known_device_name("AV-left-01"));
        assert!(!is_known_device_name("itsybitsy"));
        assert!(!is_known_device_name("Headset-AB12"));
    }

    #[test]
    fn uuids_share_the_uart_namespace() {
        assert_eq!(
            NOTIFY_CHARACTERISTIC.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            SENSOR_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }
}
