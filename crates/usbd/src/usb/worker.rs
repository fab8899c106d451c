//! Hot-plug worker thread
//!
//! Dedicated thread that runs the libusb event loop. libusb must not be
//! re-entered from its hot-plug callback, so the callback only queues a
//! [`PnpEvent`]; the loop applies queued events to the service between
//! `handle_events` calls.

use crate::usb::rusb_backend::{check_filter, pnp_info};
use crate::usb::service::UsbdService;
use async_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use protocol::{PnpDeviceInfo, PnpEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the hot-plug event queue
const PNP_QUEUE_CAPACITY: usize = 64;

/// Running hot-plug worker
pub struct HotplugWorker {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl HotplugWorker {
    /// Stop the loop and wait for the thread to exit
    pub fn shutdown(self) {
        // A closed channel stops the loop as well.
        let _ = self.shutdown_tx.try_send(());
        self.shutdown_tx.close();
        if let Err(e) = self.handle.join() {
            error!("Hot-plug worker panicked: {:?}", e);
        }
    }
}

/// Forwards libusb hot-plug callbacks into the event queue
struct HotplugForwarder {
    events: Sender<PnpEvent>,
    filters: Vec<String>,
}

impl HotplugForwarder {
    fn forward(&self, event: PnpEvent, info: PnpDeviceInfo) {
        if !check_filter(info.vendor_id, info.product_id, &self.filters) {
            debug!("Hot-plug of {} ignored by filter", info.dev());
            return;
        }
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping hot-plug event for {}: {}", info.dev(), e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let info = pnp_info(&device);
        debug!("Hot-plug callback: device {} arrived", info.dev());
        self.forward(PnpEvent::DeviceAdded(info), info);
    }

    fn device_left(&mut self, device: Device<T>) {
        let info = pnp_info(&device);
        debug!("Hot-plug callback: device {} left", info.dev());
        self.forward(PnpEvent::DeviceRemoved(info), info);
    }
}

/// Apply every queued event to the service
pub fn drain_events(service: &UsbdService, events: &Receiver<PnpEvent>) -> usize {
    let mut handled = 0;
    while let Ok(event) = events.try_recv() {
        if let Err(e) = service.handle_pnp_event(event) {
            warn!("Pnp event {:?} not delivered: {}", event, e);
        }
        handled += 1;
    }
    handled
}

fn run(
    service: Arc<UsbdService>,
    context: Context,
    filters: Vec<String>,
    poll: Duration,
    shutdown_rx: Receiver<()>,
) {
    info!("Hot-plug worker started");

    let (events_tx, events_rx) = bounded(PNP_QUEUE_CAPACITY);
    let forwarder = HotplugForwarder {
        events: events_tx,
        filters,
    };

    let _registration = if rusb::has_hotplug() {
        match HotplugBuilder::new()
            .enumerate(false)
            .register::<Context, &Context>(&context, Box::new(forwarder))
        {
            Ok(registration) => {
                debug!("Hot-plug callbacks registered");
                Some(registration)
            }
            Err(e) => {
                error!("Failed to register hot-plug callbacks: {}", e);
                None
            }
        }
    } else {
        warn!("libusb has no hot-plug support on this platform");
        None
    };

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => {
                info!("Hot-plug worker shutting down");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        match context.handle_events(Some(poll)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(poll);
            }
        }

        drain_events(&service, &events_rx);
    }

    info!("Hot-plug worker stopped");
}

/// Spawn the hot-plug worker thread
pub fn spawn_hotplug_worker(
    service: Arc<UsbdService>,
    context: Context,
    filters: Vec<String>,
    poll: Duration,
) -> std::io::Result<HotplugWorker> {
    let (shutdown_tx, shutdown_rx) = unbounded();
    let handle = std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || run(service, context, filters, poll, shutdown_rx))?;
    Ok(HotplugWorker {
        shutdown_tx,
        handle,
    })
}
