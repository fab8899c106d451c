//! Synchronous transfer engine
//!
//! Bulk, interrupt and isochronous transfers run in max-packet-size chunks on
//! a per-pipe [`SyncRequest`] that is created on first use and reused until
//! the device's pools are released. Control transfers share the device's
//! single control request.

use crate::usb::device::HostDevice;
use crate::usb::lock;
use crate::usb::request::{ControlSetup, RequestParams, RequestTarget, UsbRequest};
use protocol::constants::{MAX_CONTROL_BUFF_SIZE, READ_BUF_SIZE, READ_CHUNK_TIMEOUT};
use protocol::{
    Direction, EndpointInfo, PipeType, RequestKind, RequestRecipient, Result, UsbCtrlTransfer,
    UsbPipe, UsbdError,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pooled synchronous request of one pipe
///
/// The request mutex serializes transfers on the pipe.
pub struct SyncRequest {
    interface: u8,
    endpoint: EndpointInfo,
    request: Mutex<UsbRequest>,
}

impl SyncRequest {
    fn new(interface: u8, endpoint: EndpointInfo) -> Self {
        Self {
            interface,
            endpoint,
            request: Mutex::new(UsbRequest::new()),
        }
    }

    pub fn endpoint(&self) -> EndpointInfo {
        self.endpoint
    }

    fn params(&self, device: &HostDevice, data: Vec<u8>, length: usize, timeout: Duration) -> RequestParams {
        RequestParams {
            device: device.id(),
            target: RequestTarget::Pipe {
                interface: self.interface,
                endpoint: self.endpoint,
            },
            data,
            length,
            timeout,
        }
    }
}

/// Outcome of a chunked read
///
/// `data` holds whatever arrived before `result` was decided, so a failed
/// read still reports its partial progress.
#[derive(Debug)]
pub struct ChunkedRead {
    pub data: Vec<u8>,
    pub result: Result<()>,
}

/// Decoded bmRequestType plus request fields of a caller's control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlParams {
    pub request: u8,
    pub recipient: RequestRecipient,
    pub kind: RequestKind,
    pub direction: Direction,
    pub value: u16,
    pub index: u16,
}

impl From<&UsbCtrlTransfer> for ControlParams {
    fn from(ctrl: &UsbCtrlTransfer) -> Self {
        Self {
            request: ctrl.request_cmd,
            recipient: ctrl.recipient(),
            kind: ctrl.kind(),
            direction: ctrl.direction(),
            value: ctrl.value,
            index: ctrl.index,
        }
    }
}

impl ControlParams {
    pub fn setup(&self, length: u16) -> ControlSetup {
        ControlSetup {
            request_type: self.direction.bit() | self.kind.bits() | self.recipient.bits(),
            request: self.request,
            value: self.value,
            index: self.index,
            length,
        }
    }
}

/// Caller timeout in milliseconds; zero or negative waits forever
pub(crate) fn timeout_from_ms(timeout_ms: i32) -> Duration {
    Duration::from_millis(timeout_ms.max(0) as u64)
}

impl HostDevice {
    /// Cached sync request of a pipe, created on first use
    pub fn find_or_create_sync_request(&self, pipe: UsbPipe) -> Result<Arc<SyncRequest>> {
        if let Some(existing) = lock(&self.sync_requests).get(&pipe) {
            return Ok(existing.clone());
        }

        let endpoint = self.resolve_pipe(pipe).map_err(|e| {
            warn!(
                "Cannot resolve pipe {:#x} on interface {} of device {}",
                pipe.endpoint_id,
                pipe.interface_id,
                self.id()
            );
            e
        })?;

        let mut pool = lock(&self.sync_requests);
        let entry = pool
            .entry(pipe)
            .or_insert_with(|| Arc::new(SyncRequest::new(pipe.interface_id, endpoint)));
        debug!(
            "Sync request for pipe {}/{:#x} on device {}",
            pipe.interface_id,
            pipe.endpoint_id,
            self.id()
        );
        Ok(entry.clone())
    }

    /// Read max-packet-size chunks until `capacity` would overflow or a
    /// short packet arrives
    ///
    /// Each chunk waits at most [`READ_CHUNK_TIMEOUT`]. A chunk timeout ends
    /// the read successfully once any byte has arrived; with nothing read it
    /// is retried until `timeout_ms` elapses, or forever when `timeout_ms` is
    /// zero or negative.
    pub fn read_chunked(&self, entry: &SyncRequest, timeout_ms: i32, capacity: usize) -> ChunkedRead {
        let packet = entry.endpoint.max_packet_size as usize;
        if packet == 0 || capacity == 0 {
            return ChunkedRead {
                data: Vec::new(),
                result: Err(UsbdError::InvalidParam),
            };
        }

        let budget = timeout_from_ms(timeout_ms);
        let start = Instant::now();
        let mut data = Vec::with_capacity(capacity);
        let mut result = Err(UsbdError::Failure);
        let mut request = lock(&entry.request);

        while data.len() + packet < capacity {
            let params = entry.params(self, Vec::new(), packet, READ_CHUNK_TIMEOUT);
            match self.submit_sync(&mut request, params) {
                Ok(info) => {
                    let received = info.actual_length.min(info.buffer.len()).min(packet);
                    data.extend_from_slice(&info.buffer[..received]);
                    result = Ok(());
                    if received < packet {
                        break;
                    }
                }
                Err(UsbdError::Timeout) => {
                    if !data.is_empty() {
                        result = Ok(());
                        break;
                    }
                    if budget.is_zero() || start.elapsed() < budget {
                        continue;
                    }
                    result = Err(UsbdError::Timeout);
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        ChunkedRead { data, result }
    }

    /// Write `data` in max-packet-size chunks, stopping at the first failure
    pub fn write_chunked(&self, entry: &SyncRequest, timeout_ms: i32, data: &[u8]) -> Result<()> {
        let packet = entry.endpoint.max_packet_size as usize;
        if data.is_empty() || packet == 0 {
            return Err(UsbdError::InvalidParam);
        }

        let timeout = timeout_from_ms(timeout_ms);
        let mut request = lock(&entry.request);
        for (index, chunk) in data.chunks(packet).enumerate() {
            let params = entry.params(self, chunk.to_vec(), chunk.len(), timeout);
            if let Err(e) = self.submit_sync(&mut request, params) {
                warn!(
                    "Chunk {} of {}-byte write to endpoint {:#x} failed: {}",
                    index,
                    data.len(),
                    entry.endpoint.address,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Synchronous read on a pipe of the given transfer type
    pub fn pipe_read(&self, pipe: UsbPipe, pipe_type: PipeType, timeout_ms: i32) -> Result<Vec<u8>> {
        let entry = self.find_or_create_sync_request(pipe)?;
        check_endpoint(&entry.endpoint, Direction::In, pipe_type)?;

        let ChunkedRead { data, result } = self.read_chunked(&entry, timeout_ms, READ_BUF_SIZE);
        if let Err(e) = result {
            warn!(
                "{:?} read on endpoint {:#x} ended with {} after {} bytes",
                pipe_type,
                pipe.endpoint_id,
                e,
                data.len()
            );
            if data.is_empty() {
                return Err(e);
            }
        }
        Ok(data)
    }

    /// Synchronous write on a pipe of the given transfer type
    pub fn pipe_write(
        &self,
        pipe: UsbPipe,
        pipe_type: PipeType,
        timeout_ms: i32,
        data: &[u8],
    ) -> Result<()> {
        let entry = self.find_or_create_sync_request(pipe)?;
        check_endpoint(&entry.endpoint, Direction::Out, pipe_type)?;
        self.write_chunked(&entry, timeout_ms, data)
    }

    /// Control read with a caller-supplied setup
    pub fn control_read(&self, ctrl: &UsbCtrlTransfer) -> Result<Vec<u8>> {
        if ctrl.direction() != Direction::In {
            warn!("Control read called with an OUT request type {:#x}", ctrl.request_type);
            return Err(UsbdError::Failure);
        }

        let setup = ControlParams::from(ctrl).setup(MAX_CONTROL_BUFF_SIZE as u16);
        self.control_transfer(setup, Vec::new(), timeout_from_ms(ctrl.timeout_ms))
            .inspect_err(|e| warn!("Control read {:#x} failed: {}", ctrl.request_cmd, e))
    }

    /// Control write with a caller-supplied setup
    pub fn control_write(&self, ctrl: &UsbCtrlTransfer, data: &[u8]) -> Result<()> {
        if ctrl.direction() != Direction::Out {
            warn!("Control write called with an IN request type {:#x}", ctrl.request_type);
            return Err(UsbdError::Failure);
        }

        let length = u16::try_from(data.len()).map_err(|_| UsbdError::InvalidParam)?;
        let setup = ControlParams::from(ctrl).setup(length);
        self.control_transfer(setup, data.to_vec(), timeout_from_ms(ctrl.timeout_ms))
            .map(|_| ())
            .inspect_err(|e| warn!("Control write {:#x} failed: {}", ctrl.request_cmd, e))
    }
}

fn check_endpoint(endpoint: &EndpointInfo, direction: Direction, pipe_type: PipeType) -> Result<()> {
    if endpoint.direction() != direction || endpoint.pipe_type != pipe_type {
        warn!(
            "Endpoint {:#x} is {:?} {:?}, expected {:?} {:?}",
            endpoint.address,
            endpoint.pipe_type,
            endpoint.direction(),
            pipe_type,
            direction
        );
        return Err(UsbdError::InvalidParam);
    }
    Ok(())
}
