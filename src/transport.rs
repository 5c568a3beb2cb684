//! The seam between the session and the physical link.
//!
//! [`crate::ble::BleTransport`] is the production implementation. Tests drive
//! the session through an in-memory one.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One notification from the control characteristic.
    Notification(Vec<u8>),
    /// The peer went away. No further events follow on this receiver.
    Disconnected,
}

/// A connection to one JamMate unit.
///
/// `open` may be called again after a disconnect to re-establish the link;
/// each call returns a fresh event receiver.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Find the device, connect, subscribe to notifications and start
    /// watching for disconnection.
    ///
    /// A `LinkEvent::Disconnected` is delivered (or the receiver closes)
    /// when the link drops.
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError>;

    /// Write one packet to the control characteristic.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Tear the link down. Closing an already-closed link is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}
