//! Typed event surface towards the host application.
//!
//! The engine never calls back into the host directly; every callback of
//! the external interface is a variant of [`Event`] emitted on an
//! unbounded channel the host drains at its own pace.

use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::device::{DeviceInfo, DiscoveredDevice, Transfer};
use crate::transfer::TransferProgress;

/// An event emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection state changed
    ConnectionState(ConnectionState),
    /// Transfer progress update; `None` clears the progress display
    TransferProgress(Option<TransferProgress>),
    /// A transfer finished and was recorded in history
    TransferComplete(Transfer),
    /// A text message arrived
    TextReceived {
        /// Decrypted message body
        content: String,
        /// Sending device
        from: DeviceInfo,
    },
    /// The remote device asked to pair; the host must prompt for a
    /// passphrase and call `provide_passphrase`
    PairingRequest(DeviceInfo),
    /// A peer appeared (or refreshed) on the network
    DeviceFound(DiscoveredDevice),
    /// A peer disappeared from the network; carries the device id
    DeviceLost(String),
}

/// Sending half of the engine's event channel.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the engine's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create a fresh event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Emit an event, ignoring a disconnected host.
pub fn emit(tx: &EventSender, event: Event) {
    let _ = tx.send(event);
}
