//! USB host service facade
//!
//! [`UsbdService`] is the entry point a dispatcher calls into. Every
//! device-scoped operation looks the device up in the registry first and
//! fails with `NoDevice` on a miss; the returned handle keeps the device
//! alive for the rest of the call even if it is detached meanwhile.
//!
//! Hot-plug notifications enter through [`UsbdService::handle_pnp_event`]
//! and are forwarded to the bound [`UsbdSubscriber`].

use crate::function::UsbdFunction;
use crate::port::UsbdPort;
use crate::usb::bulk_stream::BulkCallback;
use crate::usb::controller::HostController;
use crate::usb::device::HostDevice;
use crate::usb::registry::DeviceRegistry;
use crate::usb::shared_buffer::SharedMemory;
use protocol::constants::{GET_STRING_SET_TIMEOUT, USB_BULK_CANCEL_GRACE, USB_CTRL_SET_TIMEOUT, descriptor};
use protocol::{
    DeviceAction, PipeType, PnpEvent, PortInfo, Result, UsbCtrlTransfer, UsbDev, UsbDeviceInfo,
    UsbPipe, UsbdError,
};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receiver of device and port notifications
pub trait UsbdSubscriber: Send + Sync {
    fn device_event(&self, info: UsbDeviceInfo) -> Result<()>;
    fn port_changed_event(&self, info: PortInfo) -> Result<()>;
}

/// Service tuning
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound of the bulk-cancel quiescence wait
    pub bulk_cancel_grace: Duration,
    /// Where the port role mode is persisted
    pub port_mode_file: Option<PathBuf>,
    /// Where the enabled gadget functions are persisted
    pub function_state_file: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            bulk_cancel_grace: USB_BULK_CANCEL_GRACE,
            port_mode_file: None,
            function_state_file: None,
        }
    }
}

/// USB host driver service
pub struct UsbdService {
    controller: Arc<dyn HostController>,
    registry: DeviceRegistry,
    subscriber: RwLock<Option<Arc<dyn UsbdSubscriber>>>,
    port: UsbdPort,
    function: UsbdFunction,
}

impl UsbdService {
    pub fn new(controller: Arc<dyn HostController>, options: ServiceOptions) -> Self {
        Self {
            registry: DeviceRegistry::new(controller.clone(), options.bulk_cancel_grace),
            controller,
            subscriber: RwLock::new(None),
            port: UsbdPort::new(options.port_mode_file),
            function: UsbdFunction::new(options.function_state_file),
        }
    }

    pub fn controller(&self) -> &Arc<dyn HostController> {
        &self.controller
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn current_subscriber(&self) -> Option<Arc<dyn UsbdSubscriber>> {
        self.subscriber
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forward a device event; `Failure` when nobody is subscribed
    fn notify(&self, action: DeviceAction, dev: UsbDev) -> Result<()> {
        let info = UsbDeviceInfo::new(action, dev);
        match self.current_subscriber() {
            Some(subscriber) => subscriber.device_event(info),
            None => {
                error!("No subscriber for {:?} of device {}", action, dev);
                Err(UsbdError::Failure)
            }
        }
    }

    /// Bind the subscriber and report every device already attached
    pub fn bind_subscriber(&self, subscriber: Arc<dyn UsbdSubscriber>) -> Result<()> {
        *self
            .subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscriber.clone());
        info!("Subscriber bound");

        let devices = match self.controller.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Enumerating attached devices failed: {}", e);
                return Ok(());
            }
        };

        for info in devices.iter().filter(|info| !info.is_hub()) {
            let dev = info.dev();
            if let Err(e) = self.registry.create_and_attach(dev) {
                warn!("Failed to attach device {}: {}", dev, e);
                continue;
            }
            if let Err(e) = subscriber.device_event(UsbDeviceInfo::new(DeviceAction::DevUp, dev)) {
                warn!("Subscriber rejected DevUp of device {}: {}", dev, e);
            }
        }
        Ok(())
    }

    pub fn unbind_subscriber(&self) -> Result<()> {
        self.subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("Subscriber unbound");
        Ok(())
    }

    /// Apply a hot-plug notification and forward it
    ///
    /// Hubs are never registered: a hub arriving is ignored and a hub leaving
    /// takes every device on its bus with it, without notification.
    pub fn handle_pnp_event(&self, event: PnpEvent) -> Result<()> {
        debug!("Pnp event {:?}", event);
        match event {
            PnpEvent::GadgetAdded => self.notify(DeviceAction::UpDevice, UsbDev::new(0, 0)),
            PnpEvent::GadgetRemoved => self.notify(DeviceAction::DownDevice, UsbDev::new(0, 0)),
            PnpEvent::DeviceAdded(info) if info.is_hub() => {
                debug!("Ignoring hub {} arrival", info.dev());
                Ok(())
            }
            PnpEvent::DeviceRemoved(info) if info.is_hub() => {
                let removed = self.registry.remove_bus(info.bus_num);
                debug!(
                    "Hub {} left, detached {} devices",
                    info.dev(),
                    removed.len()
                );
                Ok(())
            }
            PnpEvent::DeviceAdded(info) => {
                let dev = info.dev();
                if let Err(e) = self.registry.create_and_attach(dev) {
                    warn!("Failed to attach device {}: {}", dev, e);
                }
                self.notify(DeviceAction::DevUp, dev)
            }
            PnpEvent::DeviceRemoved(info) => {
                let dev = info.dev();
                if self.registry.detach(dev).is_none() {
                    debug!("Device {} was not registered", dev);
                }
                self.notify(DeviceAction::DevDown, dev)
            }
        }
    }

    /// Registered device, or `NoDevice`
    pub fn device(&self, dev: UsbDev) -> Result<Arc<HostDevice>> {
        self.registry.find(dev).ok_or_else(|| {
            debug!("Device {} not registered", dev);
            UsbdError::NoDevice
        })
    }

    pub fn open_device(&self, dev: UsbDev) -> Result<()> {
        self.device(dev)?.set_open(true);
        Ok(())
    }

    pub fn close_device(&self, dev: UsbDev) -> Result<()> {
        self.device(dev)?.set_open(false);
        Ok(())
    }

    pub fn get_device_descriptor(&self, dev: UsbDev) -> Result<Vec<u8>> {
        self.device(dev)?
            .get_descriptor(descriptor::DEVICE, 0, USB_CTRL_SET_TIMEOUT)
    }

    pub fn get_string_descriptor(&self, dev: UsbDev, desc_id: u8) -> Result<Vec<u8>> {
        self.device(dev)?
            .get_descriptor(descriptor::STRING, desc_id, GET_STRING_SET_TIMEOUT)
    }

    pub fn get_config_descriptor(&self, dev: UsbDev, desc_id: u8) -> Result<Vec<u8>> {
        self.device(dev)?
            .get_descriptor(descriptor::CONFIG, desc_id, USB_CTRL_SET_TIMEOUT)
    }

    pub fn get_raw_descriptor(&self, dev: UsbDev) -> Result<Vec<u8>> {
        self.device(dev)?;
        self.controller.raw_descriptors(dev)
    }

    pub fn get_file_descriptor(&self, dev: UsbDev) -> Result<OwnedFd> {
        self.device(dev)?;
        self.controller.file_descriptor(dev)
    }

    pub fn get_config(&self, dev: UsbDev) -> Result<u8> {
        self.device(dev)?.get_config().map_err(|e| {
            warn!("GET_CONFIGURATION on device {} failed: {}", dev, e);
            UsbdError::Io
        })
    }

    /// Select a configuration
    ///
    /// A device that cannot be reopened after the switch is detached.
    pub fn set_config(&self, dev: UsbDev, config: u8) -> Result<()> {
        let device = self.device(dev)?;
        if device.apply_config(config)? && config != 0 {
            if let Err(e) = device.reopen() {
                error!("Reopening device {} after config {} failed: {}", dev, config, e);
                self.registry.detach(dev);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn claim_interface(&self, dev: UsbDev, interface: u8, force: bool) -> Result<()> {
        self.device(dev)?.claim_interface(interface, force)
    }

    pub fn release_interface(&self, dev: UsbDev, interface: u8) -> Result<()> {
        self.device(dev)?.release_interface(interface)
    }

    pub fn set_interface(&self, dev: UsbDev, interface: u8, alt_setting: u8) -> Result<()> {
        self.device(dev)?
            .select_interface_setting(interface, alt_setting)
    }

    pub fn bulk_transfer_read(&self, dev: UsbDev, pipe: UsbPipe, timeout_ms: i32) -> Result<Vec<u8>> {
        self.device(dev)?.pipe_read(pipe, PipeType::Bulk, timeout_ms)
    }

    pub fn bulk_transfer_write(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        timeout_ms: i32,
        data: &[u8],
    ) -> Result<()> {
        self.device(dev)?
            .pipe_write(pipe, PipeType::Bulk, timeout_ms, data)
    }

    pub fn interrupt_transfer_read(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        timeout_ms: i32,
    ) -> Result<Vec<u8>> {
        self.device(dev)?
            .pipe_read(pipe, PipeType::Interrupt, timeout_ms)
    }

    pub fn interrupt_transfer_write(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        timeout_ms: i32,
        data: &[u8],
    ) -> Result<()> {
        self.device(dev)?
            .pipe_write(pipe, PipeType::Interrupt, timeout_ms, data)
    }

    pub fn iso_transfer_read(&self, dev: UsbDev, pipe: UsbPipe, timeout_ms: i32) -> Result<Vec<u8>> {
        self.device(dev)?
            .pipe_read(pipe, PipeType::Isochronous, timeout_ms)
    }

    pub fn iso_transfer_write(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        timeout_ms: i32,
        data: &[u8],
    ) -> Result<()> {
        self.device(dev)?
            .pipe_write(pipe, PipeType::Isochronous, timeout_ms, data)
    }

    pub fn control_transfer_read(&self, dev: UsbDev, ctrl: &UsbCtrlTransfer) -> Result<Vec<u8>> {
        self.device(dev)?.control_read(ctrl)
    }

    pub fn control_transfer_write(
        &self,
        dev: UsbDev,
        ctrl: &UsbCtrlTransfer,
        data: &[u8],
    ) -> Result<()> {
        self.device(dev)?.control_write(ctrl, data)
    }

    pub fn request_queue(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        client_data: &[u8],
        buffer: &[u8],
    ) -> Result<()> {
        self.device(dev)?.request_queue(pipe, client_data, buffer)
    }

    /// Oldest queued request's (client data, transferred data)
    pub fn request_wait(&self, dev: UsbDev, timeout_ms: i32) -> Result<(Vec<u8>, Vec<u8>)> {
        self.device(dev)?.request_wait(timeout_ms)
    }

    pub fn request_cancel(&self, dev: UsbDev, pipe: UsbPipe) -> Result<()> {
        self.device(dev)?.request_cancel(pipe)
    }

    pub fn bulk_read(&self, dev: UsbDev, pipe: UsbPipe, memory: SharedMemory) -> Result<()> {
        self.device(dev)?.bulk_read(pipe, memory)
    }

    pub fn bulk_write(&self, dev: UsbDev, pipe: UsbPipe, memory: SharedMemory) -> Result<()> {
        self.device(dev)?.bulk_write(pipe, memory)
    }

    pub fn bulk_cancel(&self, dev: UsbDev, pipe: UsbPipe) -> Result<()> {
        self.device(dev)?.bulk_cancel(pipe)
    }

    pub fn reg_bulk_callback(
        &self,
        dev: UsbDev,
        pipe: UsbPipe,
        callback: Arc<dyn BulkCallback>,
    ) -> Result<()> {
        self.device(dev)?.reg_bulk_callback(pipe, callback)
    }

    pub fn unreg_bulk_callback(&self, dev: UsbDev, pipe: UsbPipe) -> Result<()> {
        self.device(dev)?.unreg_bulk_callback(pipe)
    }

    /// Switch port roles and tell the subscriber
    pub fn set_port_role(&self, port_id: i32, power_role: i32, data_role: i32) -> Result<()> {
        let info = self.port.set_port_role(port_id, power_role, data_role)?;
        match self.current_subscriber() {
            Some(subscriber) => {
                if let Err(e) = subscriber.port_changed_event(info) {
                    warn!("Subscriber rejected port change: {}", e);
                }
            }
            None => debug!("Port changed with no subscriber bound"),
        }
        Ok(())
    }

    pub fn query_port(&self) -> Result<PortInfo> {
        Ok(self.port.query_port())
    }

    pub fn get_current_functions(&self) -> Result<u32> {
        Ok(self.function.get_current_functions())
    }

    pub fn set_current_functions(&self, funcs: u32) -> Result<()> {
        self.function.set_current_functions(funcs)
    }

    /// Release every device
    pub fn shutdown(&self) -> usize {
        let released = self.registry.release_all();
        info!("USB service stopped, released {} devices", released);
        released
    }
}
