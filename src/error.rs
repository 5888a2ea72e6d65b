//! Error types for the transport boundary and the session layer.
//!
//! Nothing here escapes [`crate::session::SessionManager`]: every failure is
//! logged and turned into the manager's status string.

use thiserror::Error;
use uuid::Uuid;

use crate::types::SessionId;

/// Failures reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The host has no usable Bluetooth stack or adapter.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// Discovery finished (or the user cancelled) without a matching device.
    #[error("no matching device found: {0}")]
    NoDevice(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("service {0} not found")]
    MissingService(Uuid),
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),
    #[error("write rejected: {0}")]
    Write(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The link is already torn down.
    #[error("link closed")]
    Closed,
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => {
                TransportError::Unavailable("Bluetooth permission denied".into())
            }
            btleplug::Error::DeviceNotFound => TransportError::NoDevice("device vanished".into()),
            btleplug::Error::NotConnected => TransportError::Closed,
            btleplug::Error::TimedOut(_) => TransportError::Timeout("BLE operation"),
            other => TransportError::Connection(other.to_string()),
        }
    }
}

/// Failures of session-level operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device {0} is already connected")]
    AlreadyConnected(SessionId),
    #[error("device {0} not connected")]
    UnknownSession(SessionId),
    #[error("device {0} has no write characteristic")]
    NoWriteEndpoint(SessionId),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
