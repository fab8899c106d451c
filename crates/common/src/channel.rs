//! Async channel bridge between the USB threads and the Tokio runtime
//!
//! Subscriber callbacks fire on whichever thread processed the hot-plug
//! notification or port change. They push into an [`EventSink`] without
//! blocking on the runtime; the daemon drains the matching [`EventBridge`].

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{PortInfo, UsbDeviceInfo};

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 256;

/// Events from the USB service to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbdEvent {
    /// Device attach/detach or gadget up/down
    Device(UsbDeviceInfo),
    /// Port role changed
    Port(PortInfo),
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct EventBridge {
    event_rx: Receiver<UsbdEvent>,
}

impl EventBridge {
    /// Receive the next event
    pub async fn recv_event(&self) -> crate::Result<UsbdEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without waiting
    pub fn try_recv_event(&self) -> Option<UsbdEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Handle for USB threads (never blocks)
#[derive(Clone)]
pub struct EventSink {
    event_tx: Sender<UsbdEvent>,
}

impl EventSink {
    /// Queue an event for the runtime
    ///
    /// Fails instead of blocking when the runtime has fallen behind.
    pub fn send_event(&self, event: UsbdEvent) -> crate::Result<()> {
        self.event_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::Channel("event channel full".to_string()),
            TrySendError::Closed(_) => crate::Error::Channel("event channel closed".to_string()),
        })
    }
}

/// Create the event bridge
///
/// Returns (EventBridge for Tokio, EventSink for USB threads)
pub fn create_event_bridge() -> (EventBridge, EventSink) {
    let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
    (EventBridge { event_rx }, EventSink { event_tx })
}
