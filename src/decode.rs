//! Decoders for sensor notification payloads.
//!
//! All functions here are pure: no I/O, no panics on short or garbled input.
//! A payload that cannot be interpreted yields `None` and the caller drops it.
//!
//! | Strategy | Payload | Channels | Scaling |
//! |---|---|---|---|
//! | [`decode_float_frame`] | 8 or 16 B, `f32` LE | L, R (+ U, D) | ÷ [`NORMALIZATION_DIVISOR`] |
//! | [`decode_ascii_scalar`] | ASCII decimal | L = R = value | none |

use std::fmt;

use log::trace;

use crate::protocol::{FLOAT_FRAME_QUAD_LEN, FLOAT_FRAME_STEREO_LEN, NORMALIZATION_DIVISOR};
use crate::types::ChannelReadings;

/// Signature of a caller-supplied decoder.
pub type DecodeFn = fn(&[u8]) -> Option<ChannelReadings>;

/// Which wire format a deployment's firmware speaks.
#[derive(Clone, Copy, Default)]
pub enum DecodeStrategy {
    /// Little-endian `f32` fields: left, right, and optionally up, down.
    #[default]
    Float32Le,
    /// A single decimal number as text, applied to left and right.
    AsciiDecimal,
    /// Custom decoder for firmware with its own layout.
    Custom(DecodeFn),
}

impl DecodeStrategy {
    pub fn decode(&self, payload: &[u8]) -> Option<ChannelReadings> {
        trace!("decode {} B: {:02x?}", payload.len(), payload);
        match self {
            DecodeStrategy::Float32Le => decode_float_frame(payload),
            DecodeStrategy::AsciiDecimal => decode_ascii_scalar(payload),
            DecodeStrategy::Custom(f) => f(payload),
        }
    }
}

impl fmt::Debug for DecodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeStrategy::Float32Le => f.write_str("Float32Le"),
            DecodeStrategy::AsciiDecimal => f.write_str("AsciiDecimal"),
            DecodeStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl std::str::FromStr for DecodeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" | "float32" | "float32-le" => Ok(DecodeStrategy::Float32Le),
            "ascii" | "ascii-decimal" | "text" => Ok(DecodeStrategy::AsciiDecimal),
            other => Err(format!("unknown decoder '{other}' (expected 'float' or 'ascii')")),
        }
    }
}

// ── Float32 frames ────────────────────────────────────────────────────────────

fn read_f32_le(data: &[u8], offset: usize) -> Option<f32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}

/// Decode a binary float frame.
///
/// ```text
/// [0..4]   left   f32 LE
/// [4..8]   right  f32 LE
/// [8..12]  up     f32 LE  (only when len >= 16)
/// [12..16] down   f32 LE  (only when len >= 16)
/// ```
///
/// Every value is divided by [`NORMALIZATION_DIVISOR`], which maps the
/// firmware's ~0..10 amplitude onto ~0..1.
///
/// Returns `None` for payloads shorter than 8 bytes or when left/right is not
/// a finite number. A non-finite up/down pair is dropped and left/right are
/// still returned.
pub fn decode_float_frame(data: &[u8]) -> Option<ChannelReadings> {
    if data.len() < FLOAT_FRAME_STEREO_LEN {
        return None;
    }
    let left = read_f32_le(data, 0)?;
    let right = read_f32_le(data, 4)?;
    if !left.is_finite() || !right.is_finite() {
        return None;
    }

    let mut readings =
        ChannelReadings::stereo(left / NORMALIZATION_DIVISOR, right / NORMALIZATION_DIVISOR);

    if data.len() >= FLOAT_FRAME_QUAD_LEN {
        if let (Some(up), Some(down)) = (read_f32_le(data, 8), read_f32_le(data, 12)) {
            if up.is_finite() && down.is_finite() {
                readings.up = Some(vec![up / NORMALIZATION_DIVISOR]);
                readings.down = Some(vec![down / NORMALIZATION_DIVISOR]);
            }
        }
    }
    Some(readings)
}

// ── ASCII scalars ─────────────────────────────────────────────────────────────

fn parse_finite(text: &str) -> Option<f32> {
    text.parse::<f32>().ok().filter(|v| v.is_finite())
}

/// Decode a text payload holding one decimal number (e.g. `b"6.5\n"`).
///
/// The text is trimmed and parsed; if that fails every character other than
/// ASCII digits, `.` and `-` is stripped and parsing is retried. The value is
/// returned unscaled on both left and right.
///
/// Returns `None` for empty payloads, unparseable text, and `inf`/`NaN`.
pub fn decode_ascii_scalar(data: &[u8]) -> Option<ChannelReadings> {
    if data.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(data);
    let value = parse_finite(text.trim()).or_else(|| {
        let digits: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        parse_finite(&digits)
    })?;
    Some(ChannelReadings::stereo(value, value))
}
