//! Error types for the transport and layout layers.
//!
//! The frame and preset codecs never fail; only opening or writing the BLE
//! link and parsing a user-supplied layout table can produce an error.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host has no Bluetooth adapter.
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// No peripheral matching the configured name prefix was seen.
    #[error("No device matching \"{0}\" found")]
    DeviceNotFound(String),

    /// A BLE operation did not complete in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The peripheral does not expose the JamMate control characteristic.
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// A write was attempted without an open link.
    #[error("Not connected")]
    NotConnected,

    /// The link was closed while an operation was in flight.
    #[error("Connection closed")]
    Closed,

    /// Error reported by the platform BLE stack.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Errors raised while loading an effect layout table.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Effect table is empty")]
    Empty,

    #[error("Effect table has {0} entries, at most 254 are addressable")]
    TooManyEffects(usize),
}
