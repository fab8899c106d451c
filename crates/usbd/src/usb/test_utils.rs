//! Test utilities for the USB host engine
//!
//! [`MockHostController`] is a scripted, in-memory [`HostController`]. It
//! keeps a log of every submission, answers standard control requests from
//! synthetic descriptors and holds asynchronous submissions until the test
//! completes them with [`MockHostController::complete_next`], typically from
//! a thread of its own.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use protocol::{UsbDev, UsbPipe, PipeType};
//! use usbd::usb::HostDevice;
//! use usbd::usb::test_utils::{MockDevice, MockHostController, MockResponse};
//!
//! let mock = Arc::new(MockHostController::new());
//! mock.add_device(MockDevice::new(1, 5).with_interface(MockDevice::standard_interface(0, 64)));
//! mock.script(0x81, MockResponse::Data(vec![1, 2, 3]));
//!
//! let dev = HostDevice::open(UsbDev::new(1, 5), mock.clone()).unwrap();
//! dev.claim_interface(0, false).unwrap();
//! let data = dev.pipe_read(UsbPipe::new(0, 0x81), PipeType::Bulk, 100).unwrap();
//! assert_eq!(data, vec![1, 2, 3]);
//! ```

use crate::usb::controller::HostController;
use crate::usb::lock;
use crate::usb::request::{
    Completion, ControlSetup, RequestId, RequestParams, RequestStatus, RequestTarget, UsbRequest,
};
use protocol::constants::{descriptor, request};
use protocol::{
    Direction, EndpointInfo, InterfaceInfo, PipeType, PnpDeviceInfo, Result, UsbDev, UsbdError,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Bytes delivered to an IN transfer, truncated to the requested length
    Data(Vec<u8>),
    /// Transfer accepted in full
    Accept,
    Fail(UsbdError),
}

/// What [`HostController::cancel`] does with a held async submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Complete it right away as cancelled
    #[default]
    Complete,
    /// Leave it outstanding
    Ignore,
    /// Refuse the cancel
    Fail,
}

/// One logged submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub device: UsbDev,
    pub target: RequestTarget,
    pub data: Vec<u8>,
    pub length: usize,
    pub timeout: Duration,
    pub asynchronous: bool,
}

impl Submission {
    /// Endpoint address, or `None` for the control pipe
    pub fn endpoint(&self) -> Option<u8> {
        match self.target {
            RequestTarget::Pipe { endpoint, .. } => Some(endpoint.address),
            RequestTarget::Control(_) => None,
        }
    }

    pub fn setup(&self) -> Option<ControlSetup> {
        match self.target {
            RequestTarget::Control(setup) => Some(setup),
            RequestTarget::Pipe { .. } => None,
        }
    }
}

/// Simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    info: PnpDeviceInfo,
    /// Every alternate setting of every interface
    interfaces: Vec<InterfaceInfo>,
    config: u8,
}

impl MockDevice {
    pub fn new(bus_num: u8, dev_addr: u8) -> Self {
        Self {
            info: PnpDeviceInfo {
                bus_num,
                dev_addr,
                device_class: 0,
                vendor_id: 0x1234,
                product_id: 0x5678,
            },
            interfaces: Vec::new(),
            config: 1,
        }
    }

    /// Device with the hub class code
    pub fn hub(bus_num: u8, dev_addr: u8) -> Self {
        Self::new(bus_num, dev_addr).with_class(protocol::constants::BASE_CLASS_HUB)
    }

    pub fn with_class(mut self, device_class: u8) -> Self {
        self.info.device_class = device_class;
        self
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.info.vendor_id = vendor_id;
        self.info.product_id = product_id;
        self
    }

    /// Add an interface; several entries with one number are alternate settings
    pub fn with_interface(mut self, interface: InterfaceInfo) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_config(mut self, config: u8) -> Self {
        self.config = config;
        self
    }

    pub fn info(&self) -> PnpDeviceInfo {
        self.info
    }

    /// Vendor-class interface with bulk, interrupt and isochronous pairs
    ///
    /// Endpoints 0x81/0x01 are bulk, 0x82/0x02 interrupt and 0x83/0x03
    /// isochronous, all with `max_packet_size`.
    pub fn standard_interface(number: u8, max_packet_size: u16) -> InterfaceInfo {
        let endpoint = |address, pipe_type, interval| EndpointInfo {
            address,
            pipe_type,
            max_packet_size,
            interval,
        };
        InterfaceInfo {
            number,
            alt_setting: 0,
            class: 0xFF,
            subclass: 0,
            protocol: 0,
            endpoints: vec![
                endpoint(0x81, PipeType::Bulk, 0),
                endpoint(0x01, PipeType::Bulk, 0),
                endpoint(0x82, PipeType::Interrupt, 10),
                endpoint(0x02, PipeType::Interrupt, 10),
                endpoint(0x83, PipeType::Isochronous, 1),
                endpoint(0x03, PipeType::Isochronous, 1),
            ],
        }
    }

    fn setting(&self, number: u8, alt_setting: u8) -> Option<&InterfaceInfo> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alt_setting == alt_setting)
    }

    fn device_descriptor(&self) -> Vec<u8> {
        let [vid_lo, vid_hi] = self.info.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.info.product_id.to_le_bytes();
        vec![
            18,
            descriptor::DEVICE,
            0x00,
            0x02,
            self.info.device_class,
            0,
            0,
            64,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            0x00,
            0x01,
            1,
            2,
            3,
            1,
        ]
    }

    fn config_descriptor(&self) -> Vec<u8> {
        let numbers: BTreeSet<u8> = self.interfaces.iter().map(|i| i.number).collect();
        let mut body = Vec::new();
        for iface in &self.interfaces {
            body.extend_from_slice(&[
                9,
                0x04,
                iface.number,
                iface.alt_setting,
                iface.endpoints.len() as u8,
                iface.class,
                iface.subclass,
                iface.protocol,
                0,
            ]);
            for ep in &iface.endpoints {
                let attributes = match ep.pipe_type {
                    PipeType::Control => 0,
                    PipeType::Isochronous => 1,
                    PipeType::Bulk => 2,
                    PipeType::Interrupt => 3,
                };
                let [mps_lo, mps_hi] = ep.max_packet_size.to_le_bytes();
                body.extend_from_slice(&[7, 0x05, ep.address, attributes, mps_lo, mps_hi, ep.interval]);
            }
        }

        let total = (9 + body.len()) as u16;
        let [total_lo, total_hi] = total.to_le_bytes();
        let mut desc = vec![
            9,
            descriptor::CONFIG,
            total_lo,
            total_hi,
            numbers.len() as u8,
            self.config.max(1),
            0,
            0x80,
            50,
        ];
        desc.extend_from_slice(&body);
        desc
    }

    fn string_descriptor(index: u8) -> Vec<u8> {
        if index == 0 {
            return vec![4, descriptor::STRING, 0x09, 0x04];
        }
        let text = format!("Mock {}", index);
        let mut desc = vec![0, descriptor::STRING];
        for unit in text.encode_utf16() {
            desc.extend_from_slice(&unit.to_le_bytes());
        }
        desc[0] = desc.len() as u8;
        desc
    }

    fn descriptor(&self, kind: u8, index: u8) -> Option<Vec<u8>> {
        match kind {
            descriptor::DEVICE => Some(self.device_descriptor()),
            descriptor::CONFIG if index == 0 => Some(self.config_descriptor()),
            descriptor::STRING => Some(Self::string_descriptor(index)),
            _ => None,
        }
    }
}

/// Async submission held until the test completes it
struct HeldRequest {
    id: RequestId,
    completion: Arc<Completion>,
    generation: u64,
    params: RequestParams,
}

#[derive(Default)]
struct MockState {
    devices: HashMap<UsbDev, MockDevice>,
    open: HashSet<UsbDev>,
    claimed: HashMap<UsbDev, BTreeSet<u8>>,
    /// Selected alternate setting per (device, interface)
    alt_settings: HashMap<(UsbDev, u8), u8>,
    /// Scripted responses per endpoint address
    scripts: HashMap<u8, VecDeque<MockResponse>>,
    control_script: VecDeque<MockResponse>,
    submissions: Vec<Submission>,
    held: VecDeque<HeldRequest>,
    cancels: usize,
    cancel_mode: CancelMode,
    fail_open: bool,
    fail_claim: bool,
    fail_fill: Option<UsbdError>,
    fail_async: Option<UsbdError>,
    ignore_set_config: bool,
}

/// Scripted in-memory host controller
#[derive(Default)]
pub struct MockHostController {
    state: Mutex<MockState>,
}

impl MockHostController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: MockDevice) {
        let id = device.info.dev();
        lock(&self.state).devices.insert(id, device);
    }

    pub fn remove_device(&self, dev: UsbDev) {
        let mut state = lock(&self.state);
        state.devices.remove(&dev);
        state.open.remove(&dev);
        state.claimed.remove(&dev);
    }

    /// Queue a response for the next transfer on `endpoint`
    pub fn script(&self, endpoint: u8, response: MockResponse) {
        lock(&self.state)
            .scripts
            .entry(endpoint)
            .or_default()
            .push_back(response);
    }

    /// Queue `count` copies of a response
    pub fn script_n(&self, endpoint: u8, response: MockResponse, count: usize) {
        for _ in 0..count {
            self.script(endpoint, response.clone());
        }
    }

    /// Queue a response for the next control transfer, ahead of the
    /// built-in standard request handling
    pub fn script_control(&self, response: MockResponse) {
        lock(&self.state).control_script.push_back(response);
    }

    pub fn set_cancel_mode(&self, mode: CancelMode) {
        lock(&self.state).cancel_mode = mode;
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn fail_claim(&self, fail: bool) {
        lock(&self.state).fail_claim = fail;
    }

    pub fn fail_fill(&self, error: Option<UsbdError>) {
        lock(&self.state).fail_fill = error;
    }

    pub fn fail_async_submit(&self, error: Option<UsbdError>) {
        lock(&self.state).fail_async = error;
    }

    /// Accept SET_CONFIGURATION without applying it
    pub fn ignore_set_config(&self, ignore: bool) {
        lock(&self.state).ignore_set_config = ignore;
    }

    pub fn is_open(&self, dev: UsbDev) -> bool {
        lock(&self.state).open.contains(&dev)
    }

    pub fn claimed_interfaces(&self, dev: UsbDev) -> Vec<u8> {
        lock(&self.state)
            .claimed
            .get(&dev)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn active_config(&self, dev: UsbDev) -> Option<u8> {
        lock(&self.state).devices.get(&dev).map(|d| d.config)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.state).submissions.clone()
    }

    /// Logged submissions to one endpoint
    pub fn submissions_to(&self, endpoint: u8) -> Vec<Submission> {
        lock(&self.state)
            .submissions
            .iter()
            .filter(|s| s.endpoint() == Some(endpoint))
            .cloned()
            .collect()
    }

    pub fn clear_submissions(&self) {
        lock(&self.state).submissions.clear();
    }

    pub fn cancel_count(&self) -> usize {
        lock(&self.state).cancels
    }

    /// Async submissions not completed yet
    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Complete the oldest held submission from its endpoint script
    ///
    /// Returns false when nothing is held.
    pub fn complete_next(&self) -> bool {
        let next = {
            let mut state = lock(&self.state);
            state.held.pop_front().map(|held| {
                let response = state.next_response(&held.params);
                (held, response)
            })
        };
        match next {
            Some((held, response)) => {
                Self::finish(&held, response);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest held submission with an explicit response
    pub fn complete_next_with(&self, response: MockResponse) -> bool {
        let held = lock(&self.state).held.pop_front();
        match held {
            Some(held) => {
                Self::finish(&held, Some(response));
                true
            }
            None => false,
        }
    }

    /// Complete every held submission, including ones resubmitted meanwhile,
    /// up to `limit`
    pub fn complete_all(&self, limit: usize) -> usize {
        let mut done = 0;
        while done < limit && self.complete_next() {
            done += 1;
        }
        done
    }

    /// Signal a held submission outside the state lock
    fn finish(held: &HeldRequest, response: Option<MockResponse>) {
        let (status, length, buffer) = outcome(&held.params, response);
        held.completion
            .complete_for(held.generation, status, length, buffer);
    }

    fn params_of(request: &UsbRequest) -> Result<RequestParams> {
        request.params().cloned().ok_or(UsbdError::InvalidParam)
    }
}

impl MockState {
    fn log(&mut self, params: &RequestParams, asynchronous: bool) {
        self.submissions.push(Submission {
            device: params.device,
            target: params.target,
            data: params.data.clone(),
            length: params.length,
            timeout: params.timeout,
            asynchronous,
        });
    }

    /// Scripted response, or the built-in answer to a standard control request
    fn next_response(&mut self, params: &RequestParams) -> Option<MockResponse> {
        match params.target {
            RequestTarget::Pipe { endpoint, .. } => self
                .scripts
                .get_mut(&endpoint.address)
                .and_then(VecDeque::pop_front),
            RequestTarget::Control(setup) => {
                if let Some(response) = self.control_script.pop_front() {
                    return Some(response);
                }
                self.standard_request(params.device, setup)
            }
        }
    }

    fn standard_request(&mut self, dev: UsbDev, setup: ControlSetup) -> Option<MockResponse> {
        if setup.request_type & 0x60 != 0 {
            return None;
        }
        let ignore_set_config = self.ignore_set_config;
        let device = self.devices.get_mut(&dev)?;
        match setup.request {
            request::GET_CONFIGURATION => Some(MockResponse::Data(vec![device.config])),
            request::SET_CONFIGURATION => {
                if !ignore_set_config {
                    device.config = setup.value as u8;
                }
                Some(MockResponse::Accept)
            }
            request::GET_DESCRIPTOR => {
                let kind = (setup.value >> 8) as u8;
                let index = (setup.value & 0xFF) as u8;
                Some(match device.descriptor(kind, index) {
                    Some(bytes) => MockResponse::Data(bytes),
                    None => MockResponse::Fail(UsbdError::Io),
                })
            }
            _ => None,
        }
    }
}

/// Completion of a submission given its response
///
/// No script means IN transfers return nothing and OUT transfers are
/// accepted in full.
fn outcome(params: &RequestParams, response: Option<MockResponse>) -> (RequestStatus, usize, Vec<u8>) {
    match (response.unwrap_or(MockResponse::Accept), params.direction()) {
        (MockResponse::Fail(e), _) => (RequestStatus::Failed(e), 0, Vec::new()),
        (MockResponse::Data(mut bytes), Direction::In) => {
            bytes.truncate(params.length);
            (RequestStatus::Completed, bytes.len(), bytes)
        }
        (_, Direction::In) => (RequestStatus::Completed, 0, Vec::new()),
        (_, Direction::Out) => (RequestStatus::Completed, params.data.len(), Vec::new()),
    }
}

impl HostController for MockHostController {
    fn enumerate(&self) -> Result<Vec<PnpDeviceInfo>> {
        let mut devices: Vec<PnpDeviceInfo> =
            lock(&self.state).devices.values().map(|d| d.info).collect();
        devices.sort_by_key(|d| (d.bus_num, d.dev_addr));
        Ok(devices)
    }

    fn open_device(&self, dev: UsbDev) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(UsbdError::Io);
        }
        if !state.devices.contains_key(&dev) {
            return Err(UsbdError::NoDevice);
        }
        state.open.insert(dev);
        Ok(())
    }

    fn close_device(&self, dev: UsbDev) {
        let mut state = lock(&self.state);
        state.open.remove(&dev);
        state.claimed.remove(&dev);
        state.alt_settings.retain(|(d, _), _| *d != dev);
    }

    fn claim_interface(&self, dev: UsbDev, interface: u8, _force: bool) -> Result<InterfaceInfo> {
        let mut state = lock(&self.state);
        if state.fail_claim || !state.open.contains(&dev) {
            return Err(UsbdError::Io);
        }
        let alt = state.alt_settings.get(&(dev, interface)).copied().unwrap_or(0);
        let info = state
            .devices
            .get(&dev)
            .and_then(|d| d.setting(interface, alt))
            .cloned()
            .ok_or(UsbdError::InvalidParam)?;
        state.claimed.entry(dev).or_default().insert(interface);
        Ok(info)
    }

    fn release_interface(&self, dev: UsbDev, interface: u8) -> Result<()> {
        let mut state = lock(&self.state);
        let released = state
            .claimed
            .get_mut(&dev)
            .is_some_and(|set| set.remove(&interface));
        if released {
            Ok(())
        } else {
            Err(UsbdError::InvalidParam)
        }
    }

    fn select_interface_setting(
        &self,
        dev: UsbDev,
        interface: u8,
        alt_setting: u8,
    ) -> Result<InterfaceInfo> {
        let mut state = lock(&self.state);
        let info = state
            .devices
            .get(&dev)
            .and_then(|d| d.setting(interface, alt_setting))
            .cloned()
            .ok_or(UsbdError::InvalidParam)?;
        state.alt_settings.insert((dev, interface), alt_setting);
        Ok(info)
    }

    fn raw_descriptors(&self, dev: UsbDev) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        let device = state.devices.get(&dev).ok_or(UsbdError::NoDevice)?;
        let mut raw = device.device_descriptor();
        raw.extend_from_slice(&device.config_descriptor());
        Ok(raw)
    }

    fn file_descriptor(&self, dev: UsbDev) -> Result<OwnedFd> {
        if !self.is_open(dev) {
            return Err(UsbdError::NoDevice);
        }
        File::open("/dev/null")
            .map(OwnedFd::from)
            .map_err(|_| UsbdError::Io)
    }

    fn fill_request(&self, request: &mut UsbRequest, params: RequestParams) -> Result<()> {
        if let Some(e) = lock(&self.state).fail_fill {
            return Err(e);
        }
        request.fill(params);
        Ok(())
    }

    fn submit_sync(&self, request: &UsbRequest) -> Result<()> {
        let params = Self::params_of(request)?;
        let response = {
            let mut state = lock(&self.state);
            state.log(&params, false);
            state.next_response(&params)
        };

        match outcome(&params, response) {
            (RequestStatus::Failed(e), _, _) => Err(e),
            (status, length, buffer) => {
                request.completion().complete(status, length, buffer);
                Ok(())
            }
        }
    }

    fn submit_async(&self, request: &UsbRequest) -> Result<()> {
        let params = Self::params_of(request)?;
        let mut state = lock(&self.state);
        if let Some(e) = state.fail_async {
            return Err(e);
        }
        state.log(&params, true);
        let completion = request.completion().clone();
        state.held.push_back(HeldRequest {
            id: request.id(),
            generation: completion.generation(),
            completion,
            params,
        });
        Ok(())
    }

    fn cancel(&self, request: &UsbRequest) -> Result<()> {
        let cancelled = {
            let mut state = lock(&self.state);
            state.cancels += 1;
            match state.cancel_mode {
                CancelMode::Fail => return Err(UsbdError::Failure),
                CancelMode::Ignore => None,
                CancelMode::Complete => state
                    .held
                    .iter()
                    .position(|h| h.id == request.id())
                    .and_then(|index| state.held.remove(index)),
            }
        };

        if let Some(held) = cancelled {
            held.completion
                .complete_for(held.generation, RequestStatus::Cancelled, 0, Vec::new());
        }
        Ok(())
    }
}
