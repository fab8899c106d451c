//! Device registry
//!
//! Maps (bus, address) to the [`HostDevice`] of every attached device.
//! Lookups hand out a reference-counted handle, so a device detached while a
//! transfer is running stays alive until that transfer returns; only later
//! lookups miss.

use crate::usb::controller::HostController;
use crate::usb::device::HostDevice;
use crate::usb::lock;
use protocol::{Result, UsbDev};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Registry of attached devices
pub struct DeviceRegistry {
    controller: Arc<dyn HostController>,
    devices: Mutex<HashMap<UsbDev, Arc<HostDevice>>>,
    bulk_cancel_grace: Duration,
}

impl DeviceRegistry {
    pub fn new(controller: Arc<dyn HostController>, bulk_cancel_grace: Duration) -> Self {
        Self {
            controller,
            devices: Mutex::new(HashMap::new()),
            bulk_cancel_grace,
        }
    }

    pub fn find(&self, dev: UsbDev) -> Option<Arc<HostDevice>> {
        lock(&self.devices).get(&dev).cloned()
    }

    /// Open a newly attached device and register it
    ///
    /// Returns the registered device if the address is already known.
    pub fn create_and_attach(&self, dev: UsbDev) -> Result<Arc<HostDevice>> {
        let mut devices = lock(&self.devices);
        if let Some(existing) = devices.get(&dev) {
            debug!("Device {} already registered", dev);
            return Ok(existing.clone());
        }

        // Opened under the registry lock; opening takes no device lock.
        let device =
            HostDevice::open_with_grace(dev, self.controller.clone(), self.bulk_cancel_grace)?;
        devices.insert(dev, device.clone());
        info!("Device {} attached ({} registered)", dev, devices.len());
        Ok(device)
    }

    /// Unregister a device and release everything it owns
    pub fn detach(&self, dev: UsbDev) -> Option<Arc<HostDevice>> {
        let device = lock(&self.devices).remove(&dev)?;
        device.release();
        info!("Device {} detached", dev);
        Some(device)
    }

    /// Detach every device on a bus
    pub fn remove_bus(&self, bus_num: u8) -> Vec<UsbDev> {
        let removed: Vec<Arc<HostDevice>> = {
            let mut devices = lock(&self.devices);
            let ids: Vec<UsbDev> = devices
                .keys()
                .filter(|dev| dev.bus_num == bus_num)
                .copied()
                .collect();
            ids.iter().filter_map(|id| devices.remove(id)).collect()
        };

        for device in &removed {
            device.release();
        }
        if !removed.is_empty() {
            info!("Detached {} devices on bus {}", removed.len(), bus_num);
        }
        removed.iter().map(|d| d.id()).collect()
    }

    /// Detach everything
    pub fn release_all(&self) -> usize {
        let devices: Vec<Arc<HostDevice>> = lock(&self.devices).drain().map(|(_, d)| d).collect();
        for device in &devices {
            device.release();
        }
        debug!("Released {} devices", devices.len());
        devices.len()
    }

    pub fn devices(&self) -> Vec<UsbDev> {
        let mut devs: Vec<UsbDev> = lock(&self.devices).keys().copied().collect();
        devs.sort_by_key(|d| (d.bus_num, d.dev_addr));
        devs
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
