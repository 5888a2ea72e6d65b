//! # audiovisor
//!
//! Async Rust core and terminal dashboard for AudioVisor wireless sensors:
//! small microcontrollers that stream amplitude samples over Bluetooth Low
//! Energy (Nordic UART profile) and accept two-byte LED/sensitivity commands.
//!
//! ## Supported payloads
//!
//! | Firmware | Payload | Channels |
//! |---|---|---|
//! | float (default) | 8 B, two `f32` LE | left, right |
//! | float, four-channel | 16 B, four `f32` LE | left, right, up, down |
//! | text | ASCII decimal, e.g. `"6.5\n"` | left = right = value |
//!
//! Float values are divided by 10 on the way in; text values are used as-is.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use audiovisor::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default();
//!     let transport = Arc::new(BleTransport::new(config.scan_timeout));
//!     let sessions = SessionManager::new(transport, config);
//!
//!     let Some(id) = sessions.connect(DeviceKind::Lr).await else {
//!         anyhow::bail!("pairing failed: {:?}", sessions.status());
//!     };
//!     sessions
//!         .update_controls(ControlSettings::default(), Some(&id))
//!         .await;
//!
//!     let mut rx = sessions.subscribe();
//!     while rx.changed().await.is_ok() {
//!         let state = rx.borrow_and_update();
//!         let Some(s) = state.get(&id) else { break };
//!         println!("{:.1} dB (10 min avg {:.1} dB)", s.latest_db(), s.average_db());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | [`session::SessionManager`]: connect, disconnect, send, control updates |
//! | [`registry`] | Snapshot state of every session, published through a `watch` channel |
//! | [`transport`] | Async traits the core needs from a wireless stack |
//! | [`ble`] | `btleplug` implementation of the transport |
//! | [`sim`] | Scripted and synthetic devices for offline use and tests |
//! | [`decode`] | Notification payload decoders |
//! | [`buffer`] | Bounded per-channel sample buffers |
//! | [`rolling`] | Trailing time-window average |
//! | [`stats`] | RMS, decibels, magnitude spectrum |
//! | [`command`] | Two-byte control commands and control settings |
//! | [`settings`] | JSON settings file holding the control values |
//! | [`cli`] | `clap` options shared by the binaries |
//! | [`protocol`] | GATT UUIDs, name filter, wire constants, defaults |
//! | [`types`] | Channels, device kinds, session ids, decoded readings |
//! | [`error`] | Transport and session error enums |

pub mod ble;
pub mod buffer;
pub mod cli;
pub mod command;
pub mod decode;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod rolling;
pub mod session;
pub mod settings;
pub mod sim;
pub mod stats;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Sessions ──────────────────────────────────────────────────────────────
    pub use crate::registry::{RegistryState, SessionSnapshot};
    pub use crate::session::{RawPayload, SessionConfig, SessionManager};

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::ble::BleTransport;
    pub use crate::sim::{SimController, SimDevice, SimTransport};
    pub use crate::transport::{DeviceFilter, DeviceLink, GattProfile, Transport, TransportEvent};

    // ── Data ──────────────────────────────────────────────────────────────────
    pub use crate::command::{Command, ControlSettings};
    pub use crate::decode::DecodeStrategy;
    pub use crate::settings::SettingsStore;
    pub use crate::types::{Channel, ChannelReadings, DeviceKind, SessionId};
}
