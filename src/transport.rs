//! The capability set the session core needs from a wireless transport.
//!
//! The core never talks to Bluetooth directly. It asks a [`Transport`] for a
//! device matching a [`DeviceFilter`], then drives the returned
//! [`DeviceLink`] through connect → resolve → subscribe, and later write and
//! disconnect. Notifications and link loss arrive as immutable
//! [`TransportEvent`] messages on a channel, so decoding and state updates run
//! on the session's own task instead of inside transport callbacks.
//!
//! | Implementation | Module |
//! |---|---|
//! | btleplug (BlueZ / CoreBluetooth / WinRT) | [`crate::ble`] |
//! | synthetic devices for offline use and tests | [`crate::sim`] |

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportResult;
use crate::protocol::{
    is_known_device_name, DEVICE_NAME_PREFIX, KNOWN_DEVICE_NAMES, NOTIFY_CHARACTERISTIC,
    SENSOR_SERVICE_UUID, WRITE_CHARACTERISTIC,
};

/// Depth of the per-link event channel.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Which advertised names are accepted during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Names accepted verbatim.
    pub names: Vec<String>,
    /// Names starting with any of these are accepted too.
    pub prefixes: Vec<String>,
    /// Service that matching devices must expose.
    pub service: Uuid,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            names: KNOWN_DEVICE_NAMES.iter().map(|s| s.to_string()).collect(),
            prefixes: vec![DEVICE_NAME_PREFIX.to_string()],
            service: SENSOR_SERVICE_UUID,
        }
    }
}

impl DeviceFilter {
    pub fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || self.prefixes.iter().any(|p| name.starts_with(p))
    }

    /// `true` when this is the stock filter; lets callers short-circuit to
    /// [`is_known_device_name`].
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    pub fn accepts(&self, name: &str) -> bool {
        if self.is_default() {
            is_known_device_name(name)
        } else {
            self.matches(name)
        }
    }
}

/// GATT identifiers a session resolves after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub notify: Uuid,
    /// Separate write characteristic; `None` means "write on notify".
    pub write: Option<Uuid>,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: SENSOR_SERVICE_UUID,
            notify: NOTIFY_CHARACTERISTIC,
            write: Some(WRITE_CHARACTERISTIC),
        }
    }
}

/// Characteristics found on a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub notify: Uuid,
    /// `None` when the device exposes nothing writable; sends to it fail.
    pub write: Option<Uuid>,
}

/// Something the transport observed on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw payload of one notification, in delivery order.
    Notification(Vec<u8>),
    /// The link dropped without the host asking for it.
    Disconnected,
}

/// Entry point into a wireless stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Find one device accepted by `filter`.
    ///
    /// May suspend for as long as discovery (or a user-facing pairing prompt)
    /// takes. Devices already handed out are skipped.
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Box<dyn DeviceLink>>;
}

/// One physical device, owned by at most one session.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Transport-assigned identifier, if the stack has one.
    fn id(&self) -> Option<String>;

    /// Advertised name, if known.
    fn name(&self) -> Option<String>;

    async fn connect(&self) -> TransportResult<()>;

    /// Locate the service and its notify/write characteristics.
    ///
    /// A missing service or notify characteristic is an error; a missing write
    /// characteristic falls back to the notify one when it is writable and is
    /// reported as `write: None` otherwise.
    async fn resolve(&self, profile: &GattProfile) -> TransportResult<Endpoints>;

    /// Start notifications on `notify` and return the event stream.
    ///
    /// The stream ends with [`TransportEvent::Disconnected`] (or closes) when
    /// the link is lost.
    async fn subscribe(&self, notify: uuid::Uuid)
        -> TransportResult<mpsc::Receiver<TransportEvent>>;

    async fn write(&self, endpoint: Uuid, payload: &[u8]) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_matches_known_names() {
        let f = DeviceFilter::default();
        assert!(f.accepts("AudioVisor"));
        assert!(f.accepts("AV-7"));
        assert!(!f.accepts("Headset-1234"));
    }

    #[test]
    fn custom_filter_uses_its_own_lists() {
        let f = DeviceFilter {
            names: vec!["Bench".into()],
            prefixes: vec![],
            ..DeviceFilter::default()
        };
        assert!(f.accepts("Bench"));
        assert!(!f.accepts("AV-7"));
    }
}
