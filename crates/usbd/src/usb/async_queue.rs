//! Asynchronous request queue
//!
//! Callers queue transfers with opaque client data and later collect them,
//! oldest first, with [`HostDevice::request_wait`]. Request objects are pooled
//! per pipe up to [`MAX_REQUESTASYNC_NUM`] and handed out first-free-wins.

use crate::usb::controller::HostController;
use crate::usb::device::HostDevice;
use crate::usb::lock;
use crate::usb::request::{Completion, RequestParams, RequestStatus, RequestTarget, UsbRequest};
use protocol::constants::MAX_REQUESTASYNC_NUM;
use protocol::{Direction, EndpointInfo, Result, UsbPipe, UsbdError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Pooled asynchronous request of one pipe
pub struct AsyncRequest {
    pipe: UsbPipe,
    endpoint: EndpointInfo,
    in_use: AtomicBool,
    completion: Arc<Completion>,
    slot: Mutex<AsyncSlot>,
}

/// Data owned by an in-use request
struct AsyncSlot {
    client_data: Vec<u8>,
    buffer: Vec<u8>,
    request: UsbRequest,
}

impl AsyncRequest {
    fn new(pipe: UsbPipe, endpoint: EndpointInfo) -> Self {
        let request = UsbRequest::new();
        Self {
            pipe,
            endpoint,
            in_use: AtomicBool::new(false),
            completion: request.completion().clone(),
            slot: Mutex::new(AsyncSlot {
                client_data: Vec::new(),
                buffer: Vec::new(),
                request,
            }),
        }
    }

    pub fn pipe(&self) -> UsbPipe {
        self.pipe
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop owned allocations and hand the entry back to the pool
    fn free(&self) {
        {
            let mut slot = lock(&self.slot);
            slot.client_data = Vec::new();
            slot.buffer = Vec::new();
            slot.request.clear();
        }
        self.in_use.store(false, Ordering::Release);
    }

    /// Best-effort cancel of the outstanding transfer, then free the entry
    pub(crate) fn cancel_and_reset(&self, controller: &dyn HostController) {
        if self.completion.is_pending() {
            let slot = lock(&self.slot);
            if let Err(e) = controller.cancel(&slot.request) {
                warn!(
                    "Cancel of async request on endpoint {:#x} failed: {}",
                    self.pipe.endpoint_id, e
                );
            }
        }
        if self.completion.is_pending() {
            self.completion.force(RequestStatus::Cancelled);
        }
        self.free();
    }
}

impl HostDevice {
    /// Take a free pooled request of the pipe, or allocate one below the cap
    pub fn find_or_allocate_async_request(&self, pipe: UsbPipe) -> Result<Arc<AsyncRequest>> {
        if let Some(entry) = self.acquire_free_async(pipe)? {
            return Ok(entry);
        }

        let endpoint = self.resolve_pipe(pipe)?;

        let mut pool = lock(&self.async_requests);
        let count = pool.iter().filter(|e| e.pipe == pipe).count();
        if count >= MAX_REQUESTASYNC_NUM {
            return Err(UsbdError::Busy);
        }
        let entry = Arc::new(AsyncRequest::new(pipe, endpoint));
        entry.in_use.store(true, Ordering::Release);
        pool.push(entry.clone());
        debug!(
            "Allocated async request {} for pipe {}/{:#x} on device {}",
            count + 1,
            pipe.interface_id,
            pipe.endpoint_id,
            self.id()
        );
        Ok(entry)
    }

    /// First free entry of the pipe; `Busy` when the pipe is at its cap
    fn acquire_free_async(&self, pipe: UsbPipe) -> Result<Option<Arc<AsyncRequest>>> {
        let pool = lock(&self.async_requests);
        let mut count = 0;
        for entry in pool.iter().filter(|e| e.pipe == pipe) {
            if entry.try_acquire() {
                return Ok(Some(entry.clone()));
            }
            count += 1;
        }
        if count >= MAX_REQUESTASYNC_NUM {
            warn!(
                "Async pool of pipe {}/{:#x} on device {} exhausted",
                pipe.interface_id,
                pipe.endpoint_id,
                self.id()
            );
            return Err(UsbdError::Busy);
        }
        Ok(None)
    }

    /// Submit an asynchronous transfer tagged with `client_data`
    ///
    /// Both buffers are copied. For IN pipes `buffer.len()` is the number of
    /// bytes requested. On failure the entry goes back to the pool.
    pub fn request_queue(&self, pipe: UsbPipe, client_data: &[u8], buffer: &[u8]) -> Result<()> {
        let entry = self.find_or_allocate_async_request(pipe)?;

        let params = RequestParams {
            device: self.id(),
            target: RequestTarget::Pipe {
                interface: pipe.interface_id,
                endpoint: entry.endpoint,
            },
            data: match entry.endpoint.direction() {
                Direction::Out => buffer.to_vec(),
                Direction::In => Vec::new(),
            },
            length: buffer.len(),
            timeout: Duration::ZERO,
        };

        let submitted = {
            let mut slot = lock(&entry.slot);
            slot.client_data = client_data.to_vec();
            slot.buffer = buffer.to_vec();

            self.controller()
                .fill_request(&mut slot.request, params)
                .and_then(|()| {
                    entry.completion.reset();
                    self.controller().submit_async(&slot.request).inspect_err(|&e| {
                        entry.completion.force(RequestStatus::Failed(e));
                    })
                })
        };

        if let Err(e) = submitted {
            warn!(
                "Async submit on endpoint {:#x} of device {} failed: {}",
                pipe.endpoint_id,
                self.id(),
                e
            );
            entry.free();
            return Err(e);
        }

        lock(&self.request_queue).push_back(entry);
        Ok(())
    }

    /// Collect the oldest queued request
    ///
    /// Waits up to `timeout_ms` for it to complete; a negative timeout waits
    /// forever and zero only checks. On timeout the request stays at the
    /// head of the queue. Returns the client data and the transferred data:
    /// what was received for IN pipes, what was sent for OUT pipes.
    pub fn request_wait(&self, timeout_ms: i32) -> Result<(Vec<u8>, Vec<u8>)> {
        let entry = lock(&self.request_queue).pop_front().ok_or_else(|| {
            debug!("No queued async request on device {}", self.id());
            UsbdError::Failure
        })?;

        let timeout = (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64));
        let status = match entry.completion.wait(timeout) {
            Ok(status) => status,
            Err(e) => {
                debug!(
                    "Async request on endpoint {:#x} still pending after {}ms",
                    entry.pipe.endpoint_id, timeout_ms
                );
                lock(&self.request_queue).push_front(entry);
                return Err(e);
            }
        };

        let info = entry.completion.take();
        let (client_data, submitted) = {
            let mut slot = lock(&entry.slot);
            (
                std::mem::take(&mut slot.client_data),
                std::mem::take(&mut slot.buffer),
            )
        };
        entry.free();

        match status {
            RequestStatus::Failed(e) => Err(e),
            RequestStatus::Cancelled => Err(UsbdError::Io),
            _ => {
                let data = match entry.endpoint.direction() {
                    Direction::In => {
                        let mut data = info.buffer;
                        data.truncate(info.actual_length);
                        data
                    }
                    Direction::Out => submitted,
                };
                Ok((client_data, data))
            }
        }
    }

    /// Cancel and free every queued request
    ///
    /// The queue is per device, so this drains requests of every pipe.
    pub fn request_cancel(&self, pipe: UsbPipe) -> Result<()> {
        let drained: Vec<_> = lock(&self.request_queue).drain(..).collect();
        debug!(
            "Cancelling {} queued requests on device {} (pipe {:#x})",
            drained.len(),
            self.id(),
            pipe.endpoint_id
        );
        for entry in drained {
            entry.cancel_and_reset(self.controller().as_ref());
        }
        Ok(())
    }

    /// In-use async requests of a pipe
    pub fn async_in_use_count(&self, pipe: UsbPipe) -> usize {
        lock(&self.async_requests)
            .iter()
            .filter(|e| e.pipe == pipe && e.is_in_use())
            .count()
    }
}
