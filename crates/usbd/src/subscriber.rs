//! Subscriber that forwards notifications into the Tokio runtime

use crate::usb::UsbdSubscriber;
use common::{EventSink, UsbdEvent};
use protocol::{PortInfo, Result, UsbDeviceInfo, UsbdError};
use tracing::warn;

/// Pushes every notification into an [`EventSink`]
pub struct ChannelSubscriber {
    sink: EventSink,
}

impl ChannelSubscriber {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    fn forward(&self, event: UsbdEvent) -> Result<()> {
        self.sink.send_event(event).map_err(|e| {
            warn!("Dropping subscriber event: {}", e);
            UsbdError::Failure
        })
    }
}

impl UsbdSubscriber for ChannelSubscriber {
    fn device_event(&self, info: UsbDeviceInfo) -> Result<()> {
        self.forward(UsbdEvent::Device(info))
    }

    fn port_changed_event(&self, info: PortInfo) -> Result<()> {
        self.forward(UsbdEvent::Port(info))
    }
}
