//! Attached device state
//!
//! A [`HostDevice`] owns everything the service keeps per attached device:
//! the claimed interfaces, the shared control request and the request pools.
//! Each pool sits behind its own mutex and no method holds two of them at
//! once; collections are taken out of their lock before being torn down.

use crate::usb::async_queue::AsyncRequest;
use crate::usb::bulk_stream::BulkStream;
use crate::usb::controller::HostController;
use crate::usb::lock;
use crate::usb::request::{
    CompletionInfo, ControlSetup, RequestParams, RequestStatus, RequestTarget, UsbRequest,
};
use crate::usb::transfers::SyncRequest;
use protocol::constants::{
    MAX_CONTROL_BUFF_SIZE, USB_BULK_CANCEL_GRACE, USB_CTRL_SET_TIMEOUT, USB_MAX_INTERFACES,
    request,
};
use protocol::{Direction, EndpointInfo, InterfaceInfo, Result, UsbDev, UsbPipe, UsbdError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// One attached device
pub struct HostDevice {
    id: UsbDev,
    controller: Arc<dyn HostController>,
    /// Set by OpenDevice, cleared by CloseDevice
    initialized: AtomicBool,
    /// Shared by every control transfer on the device
    ctrl_request: Mutex<Option<UsbRequest>>,
    /// Claimed interfaces, indexed by interface number
    interfaces: Mutex<Vec<Option<InterfaceInfo>>>,
    pub(crate) sync_requests: Mutex<HashMap<UsbPipe, Arc<SyncRequest>>>,
    pub(crate) async_requests: Mutex<Vec<Arc<AsyncRequest>>>,
    /// Submitted async requests awaiting retrieval, oldest first
    pub(crate) request_queue: Mutex<VecDeque<Arc<AsyncRequest>>>,
    pub(crate) bulk_streams: Mutex<HashMap<UsbPipe, Arc<BulkStream>>>,
    bulk_cancel_grace: Duration,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl HostDevice {
    /// Open the device's control pipe
    pub fn open(id: UsbDev, controller: Arc<dyn HostController>) -> Result<Arc<Self>> {
        Self::open_with_grace(id, controller, USB_BULK_CANCEL_GRACE)
    }

    /// Open with a custom upper bound on the bulk-cancel quiescence wait
    pub fn open_with_grace(
        id: UsbDev,
        controller: Arc<dyn HostController>,
        bulk_cancel_grace: Duration,
    ) -> Result<Arc<Self>> {
        controller.open_device(id)?;
        debug!("Opened device {}", id);

        Ok(Arc::new(Self {
            id,
            controller,
            initialized: AtomicBool::new(true),
            ctrl_request: Mutex::new(None),
            interfaces: Mutex::new(vec![None; USB_MAX_INTERFACES]),
            sync_requests: Mutex::new(HashMap::new()),
            async_requests: Mutex::new(Vec::new()),
            request_queue: Mutex::new(VecDeque::new()),
            bulk_streams: Mutex::new(HashMap::new()),
            bulk_cancel_grace,
        }))
    }

    pub fn id(&self) -> UsbDev {
        self.id
    }

    pub fn controller(&self) -> &Arc<dyn HostController> {
        &self.controller
    }

    pub fn bulk_cancel_grace(&self) -> Duration {
        self.bulk_cancel_grace
    }

    pub fn is_open(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_open(&self, open: bool) {
        self.initialized.store(open, Ordering::Release);
    }

    /// Claim an interface if it is not claimed yet
    pub fn claim_interface(&self, interface: u8, force: bool) -> Result<()> {
        let index = interface_index(interface)?;
        if lock(&self.interfaces)[index].is_some() {
            return Ok(());
        }

        let info = self
            .controller
            .claim_interface(self.id, interface, force)
            .map_err(|e| {
                warn!(
                    "Failed to claim interface {} on device {}: {}",
                    interface, self.id, e
                );
                UsbdError::Failure
            })?;

        debug!(
            "Claimed interface {} (alt {}) on device {}",
            interface, info.alt_setting, self.id
        );
        lock(&self.interfaces)[index] = Some(info);
        Ok(())
    }

    /// Release a claimed interface and drop its synchronous requests
    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let index = interface_index(interface)?;
        let Some(_info) = lock(&self.interfaces)[index].take() else {
            return Ok(());
        };

        lock(&self.sync_requests).retain(|pipe, _| pipe.interface_id != interface);

        if let Err(e) = self.controller.release_interface(self.id, interface) {
            warn!(
                "Failed to release interface {} on device {}: {}",
                interface, self.id, e
            );
        }
        debug!("Released interface {} on device {}", interface, self.id);
        Ok(())
    }

    /// Claimed interface state, if any
    pub fn interface(&self, interface: u8) -> Option<InterfaceInfo> {
        lock(&self.interfaces)
            .get(interface as usize)
            .and_then(|slot| slot.clone())
    }

    /// Select an alternate setting
    ///
    /// A no-op when the setting is already current. After a switch every
    /// pooled request is released since the endpoint layout may differ.
    pub fn select_interface_setting(&self, interface: u8, alt_setting: u8) -> Result<()> {
        let current = self.interface(interface).ok_or_else(|| {
            warn!(
                "Interface {} not claimed on device {}",
                interface, self.id
            );
            UsbdError::Failure
        })?;

        if current.alt_setting == alt_setting {
            debug!(
                "Interface {} on device {} already at alt setting {}",
                interface, self.id, alt_setting
            );
            return Ok(());
        }

        let info = self
            .controller
            .select_interface_setting(self.id, interface, alt_setting)?;
        lock(&self.interfaces)[interface as usize] = Some(info);

        self.release_requests();
        debug!(
            "Interface {} on device {} switched to alt setting {}",
            interface, self.id, alt_setting
        );
        Ok(())
    }

    /// Endpoint metadata of a pipe on a claimed interface
    pub fn resolve_pipe(&self, pipe: UsbPipe) -> Result<EndpointInfo> {
        let interfaces = lock(&self.interfaces);
        interfaces
            .get(pipe.interface_id as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(|info| info.find_endpoint(pipe.endpoint_id))
            .copied()
            .ok_or(UsbdError::InvalidParam)
    }

    /// Fill, submit and wait on a request
    pub(crate) fn submit_sync(
        &self,
        request: &mut UsbRequest,
        params: RequestParams,
    ) -> Result<CompletionInfo> {
        self.controller.fill_request(request, params)?;
        request.completion().reset();

        if let Err(e) = self.controller.submit_sync(request) {
            request.completion().force(RequestStatus::Failed(e));
            return Err(e);
        }
        Ok(request.completion().take())
    }

    /// Control transfer on the shared control request
    ///
    /// Returns the received bytes for IN transfers and nothing for OUT.
    pub fn control_transfer(
        &self,
        setup: ControlSetup,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let params = RequestParams {
            device: self.id,
            target: RequestTarget::Control(setup),
            data,
            length: setup.length as usize,
            timeout,
        };

        let mut slot = lock(&self.ctrl_request);
        let request = slot.get_or_insert_with(UsbRequest::new);
        let info = self.submit_sync(request, params)?;

        match setup.direction() {
            Direction::In => {
                let mut buffer = info.buffer;
                buffer.truncate(info.actual_length.min(setup.length as usize));
                Ok(buffer)
            }
            Direction::Out => Ok(Vec::new()),
        }
    }

    /// Release every pooled request of the device
    ///
    /// Outstanding asynchronous and streaming requests are cancelled first.
    pub fn release_requests(&self) {
        let sync = std::mem::take(&mut *lock(&self.sync_requests));

        let queued = std::mem::take(&mut *lock(&self.request_queue));
        for request in &queued {
            request.cancel_and_reset(self.controller.as_ref());
        }
        let pool = std::mem::take(&mut *lock(&self.async_requests));

        let streams = std::mem::take(&mut *lock(&self.bulk_streams));
        for stream in streams.values() {
            stream.shutdown();
        }

        debug!(
            "Released {} sync, {} async and {} bulk stream contexts on device {}",
            sync.len(),
            pool.len(),
            streams.len(),
            self.id
        );
    }

    /// Release claimed interfaces, pools and the control pipe
    pub fn release(&self) {
        self.release_requests();

        let claimed: Vec<u8> = lock(&self.interfaces)
            .iter_mut()
            .filter_map(|slot| slot.take().map(|info| info.number))
            .collect();
        for interface in claimed {
            if let Err(e) = self.controller.release_interface(self.id, interface) {
                warn!(
                    "Failed to release interface {} on device {}: {}",
                    interface, self.id, e
                );
            }
        }

        lock(&self.ctrl_request).take();
        self.controller.close_device(self.id);
        self.set_open(false);
        debug!("Released device {}", self.id);
    }

    /// Tear down all per-device state and open the control pipe again
    pub fn reopen(&self) -> Result<()> {
        self.release();
        self.controller.open_device(self.id)?;
        self.set_open(true);
        debug!("Reopened device {}", self.id);
        Ok(())
    }

    /// Standard GET_DESCRIPTOR read of the device
    pub fn get_descriptor(&self, kind: u8, index: u8, timeout: Duration) -> Result<Vec<u8>> {
        let setup = ControlSetup {
            request_type: Direction::In.bit(),
            request: request::GET_DESCRIPTOR,
            value: (u16::from(kind) << 8) | u16::from(index),
            index: 0,
            length: MAX_CONTROL_BUFF_SIZE as u16,
        };
        self.control_transfer(setup, Vec::new(), timeout)
    }

    /// Active configuration value
    pub fn get_config(&self) -> Result<u8> {
        let setup = ControlSetup {
            request_type: Direction::In.bit(),
            request: request::GET_CONFIGURATION,
            value: 0,
            index: 0,
            length: 1,
        };
        let data = self.control_transfer(setup, Vec::new(), USB_CTRL_SET_TIMEOUT)?;
        data.first().copied().ok_or(UsbdError::Io)
    }

    /// Switch the active configuration without touching pooled state
    ///
    /// Returns false when it was already active. A switch is verified by
    /// reading the configuration back.
    pub fn apply_config(&self, config: u8) -> Result<bool> {
        let current = self.get_config().map_err(|e| {
            warn!("Reading configuration of device {} failed: {}", self.id, e);
            UsbdError::InvalidParam
        })?;
        if current == config {
            debug!("Configuration {} already active on device {}", config, self.id);
            return Ok(false);
        }

        let setup = ControlSetup {
            request_type: Direction::Out.bit(),
            request: request::SET_CONFIGURATION,
            value: u16::from(config),
            index: 0,
            length: 0,
        };
        self.control_transfer(setup, Vec::new(), USB_CTRL_SET_TIMEOUT)
            .map_err(|e| {
                warn!("Setting configuration {} on device {} failed: {}", config, self.id, e);
                UsbdError::Io
            })?;

        match self.get_config() {
            Ok(active) if active == config => Ok(true),
            other => {
                warn!(
                    "Configuration {} on device {} not applied: {:?}",
                    config, self.id, other
                );
                Err(UsbdError::Io)
            }
        }
    }

    pub fn sync_request_count(&self) -> usize {
        lock(&self.sync_requests).len()
    }

    pub fn async_request_count(&self) -> usize {
        lock(&self.async_requests).len()
    }

    pub fn queued_request_count(&self) -> usize {
        lock(&self.request_queue).len()
    }

    pub fn bulk_stream_count(&self) -> usize {
        lock(&self.bulk_streams).len()
    }
}

fn interface_index(interface: u8) -> Result<usize> {
    let index = interface as usize;
    if index >= USB_MAX_INTERFACES {
        return Err(UsbdError::InvalidParam);
    }
    Ok(index)
}
