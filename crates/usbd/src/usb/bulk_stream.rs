//! Bulk streaming over shared memory
//!
//! A [`BulkStream`] keeps up to [`USBD_BULKASYNCREQ_NUM_MAX`] asynchronous
//! bulk requests in flight against one pipe, each moving a chunk of the
//! caller's shared memory region. Completions land on the controller's
//! thread: the chunk is copied in (IN pipes), the registered
//! [`BulkCallback`] is told which byte range finished, and the freed ring
//! slot is resubmitted while the region is still mapped and not exhausted.
//!
//! Lock order is ring, then completion state. The per-node request mutex is
//! never held together with the ring lock.

use crate::usb::controller::HostController;
use crate::usb::device::HostDevice;
use crate::usb::lock;
use crate::usb::request::{Completion, RequestParams, RequestStatus, RequestTarget, UsbRequest};
use crate::usb::shared_buffer::{SharedBuffer, SharedMemory};
use protocol::constants::{BULK_ASYNC_PACKETS_PER_REQ, USBD_BULKASYNCREQ_NUM_MAX};
use protocol::{Direction, EndpointInfo, Result, UsbDev, UsbPipe, UsbdError};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Finished chunk of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkCompletion {
    pub status: RequestStatus,
    /// Offset of the chunk in the shared region
    pub offset: usize,
    /// Bytes actually transferred
    pub length: usize,
}

/// Receiver of streaming completions
///
/// Called on the controller's completion thread.
pub trait BulkCallback: Send + Sync {
    fn on_bulk_read(&self, completion: BulkCompletion);
    fn on_bulk_write(&self, completion: BulkCompletion);
}

/// State of one ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    /// Claimed, chunk not yet submitted
    Queued,
    Submitted,
    /// Completion being processed
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct RingNode {
    state: NodeState,
    offset: usize,
    length: usize,
    /// Completion generation of the current submission
    generation: u64,
}

impl RingNode {
    const IDLE: RingNode = RingNode {
        state: NodeState::Idle,
        offset: 0,
        length: 0,
        generation: 0,
    };

    fn in_flight(&self) -> bool {
        matches!(self.state, NodeState::Queued | NodeState::Submitted)
    }
}

/// Mapped region plus its cursors
#[derive(Default)]
struct BufferCursor {
    mapping: Option<SharedBuffer>,
    /// Next offset handed to a submission
    cur: usize,
    /// Bytes that completed
    rcur: usize,
}

impl BufferCursor {
    fn reset(&mut self) {
        self.mapping = None;
        self.cur = 0;
        self.rcur = 0;
    }
}

/// Streaming context of one pipe
pub struct BulkStream {
    device: UsbDev,
    interface: u8,
    endpoint: EndpointInfo,
    controller: Arc<dyn HostController>,
    ring: Mutex<Vec<RingNode>>,
    /// Signaled whenever a slot leaves the in-flight states
    quiescent: Condvar,
    requests: Vec<Mutex<UsbRequest>>,
    completions: Vec<Arc<Completion>>,
    buffer: Mutex<BufferCursor>,
    callback: Mutex<Option<Arc<dyn BulkCallback>>>,
    grace: Duration,
}

impl BulkStream {
    pub fn new(
        device: UsbDev,
        interface: u8,
        endpoint: EndpointInfo,
        controller: Arc<dyn HostController>,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<BulkStream>| {
            let requests: Vec<UsbRequest> =
                (0..USBD_BULKASYNCREQ_NUM_MAX).map(|_| UsbRequest::new()).collect();
            let completions: Vec<Arc<Completion>> =
                requests.iter().map(|r| r.completion().clone()).collect();

            for (index, completion) in completions.iter().enumerate() {
                let weak = weak.clone();
                completion.set_hook(Arc::new(move |completion: &Completion, generation| {
                    if let Some(stream) = weak.upgrade() {
                        stream.on_complete(index, completion, generation);
                    }
                }));
            }

            Self {
                device,
                interface,
                endpoint,
                controller,
                ring: Mutex::new(vec![RingNode::IDLE; USBD_BULKASYNCREQ_NUM_MAX]),
                quiescent: Condvar::new(),
                requests: requests.into_iter().map(Mutex::new).collect(),
                completions,
                buffer: Mutex::new(BufferCursor::default()),
                callback: Mutex::new(None),
                grace,
            }
        })
    }

    pub fn endpoint(&self) -> EndpointInfo {
        self.endpoint
    }

    /// Bytes carried by one request
    fn chunk_size(&self) -> usize {
        self.endpoint.max_packet_size as usize * BULK_ASYNC_PACKETS_PER_REQ
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn BulkCallback>>) {
        *lock(&self.callback) = callback;
    }

    pub fn has_callback(&self) -> bool {
        lock(&self.callback).is_some()
    }

    pub fn is_mapped(&self) -> bool {
        lock(&self.buffer).mapping.is_some()
    }

    /// Bytes that completed since the region was mapped
    pub fn transferred(&self) -> usize {
        lock(&self.buffer).rcur
    }

    /// Slots currently queued or submitted
    pub fn in_flight(&self) -> usize {
        lock(&self.ring).iter().filter(|n| n.in_flight()).count()
    }

    pub fn node_states(&self) -> Vec<NodeState> {
        lock(&self.ring).iter().map(|n| n.state).collect()
    }

    /// Map a new region and fill the ring
    ///
    /// Any previous mapping is released first. Running out of ring slots or
    /// of region to hand out is not an error. An endpoint without a packet
    /// size can never make progress and is rejected.
    pub fn start(&self, memory: SharedMemory) -> Result<()> {
        if self.chunk_size() == 0 {
            warn!(
                "Endpoint {:#x} of device {} reports a zero max packet size",
                self.endpoint.address, self.device
            );
            return Err(UsbdError::InvalidParam);
        }
        lock(&self.buffer).reset();
        let mapping = SharedBuffer::map(memory)?;
        lock(&self.buffer).mapping = Some(mapping);

        let mut submitted = 0;
        let result = loop {
            if submitted >= USBD_BULKASYNCREQ_NUM_MAX {
                break Ok(());
            }
            match self.submit_next() {
                Ok(()) => submitted += 1,
                Err(e) => break Err(e),
            }
        };

        debug!(
            "Primed {} bulk requests on endpoint {:#x} of device {}",
            submitted, self.endpoint.address, self.device
        );
        match result {
            Err(e) if e.is_stream_idle() => Ok(()),
            other => other,
        }
    }

    /// Submit the next chunk on a free slot
    ///
    /// `Busy` when no slot is free, `NoMemory` when nothing is mapped and
    /// `NoData` when the region is used up.
    fn submit_next(&self) -> Result<()> {
        let index = {
            let mut ring = lock(&self.ring);
            let index = ring
                .iter()
                .position(|n| n.state == NodeState::Idle)
                .ok_or(UsbdError::Busy)?;
            ring[index].state = NodeState::Queued;
            index
        };

        let chunk = {
            let mut buf = lock(&self.buffer);
            let cur = buf.cur;
            match buf.mapping.as_ref() {
                None => Err(UsbdError::NoMemory),
                Some(mapping) if cur >= mapping.len() => Err(UsbdError::NoData),
                Some(mapping) => {
                    let length = self.chunk_size().min(mapping.len() - cur);
                    let data = match self.endpoint.direction() {
                        Direction::Out => mapping.read_at(cur, length),
                        Direction::In => Vec::new(),
                    };
                    buf.cur += length;
                    Ok((cur, length, data))
                }
            }
        };

        let (offset, length, data) = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                self.set_idle(index);
                return Err(e);
            }
        };

        let generation = self.completions[index].reset();
        {
            let mut ring = lock(&self.ring);
            ring[index] = RingNode {
                state: NodeState::Submitted,
                offset,
                length,
                generation,
            };
        }

        let params = RequestParams {
            device: self.device,
            target: RequestTarget::Pipe {
                interface: self.interface,
                endpoint: self.endpoint,
            },
            data,
            length,
            timeout: Duration::ZERO,
        };

        let submitted = {
            let mut request = lock(&self.requests[index]);
            self.controller
                .fill_request(&mut request, params)
                .and_then(|()| self.controller.submit_async(&request))
                .inspect_err(|&e| self.completions[index].force(RequestStatus::Failed(e)))
        };

        if let Err(e) = submitted {
            warn!(
                "Bulk submit of {} bytes at {} on endpoint {:#x} failed: {}",
                length, offset, self.endpoint.address, e
            );
            {
                let mut buf = lock(&self.buffer);
                if buf.cur == offset + length {
                    buf.cur = offset;
                }
            }
            self.set_idle(index);
            return Err(e);
        }
        Ok(())
    }

    fn set_idle(&self, index: usize) {
        lock(&self.ring)[index] = RingNode::IDLE;
        self.quiescent.notify_all();
    }

    /// Completion hook of slot `index`
    ///
    /// Results of a submission the slot no longer carries are dropped.
    fn on_complete(&self, index: usize, completion: &Completion, generation: u64) {
        let (offset, length) = {
            let mut ring = lock(&self.ring);
            let node = &mut ring[index];
            if node.state != NodeState::Submitted || node.generation != generation {
                debug!(
                    "Dropping stale completion of bulk slot {} on endpoint {:#x}",
                    index, self.endpoint.address
                );
                return;
            }
            node.state = NodeState::Completed;
            (node.offset, node.length)
        };

        let info = completion.take();
        let landed = match info.status {
            RequestStatus::Completed => info.actual_length.min(length),
            _ => 0,
        };

        let mapped = {
            let mut buf = lock(&self.buffer);
            let direction = self.endpoint.direction();
            match buf.mapping.as_mut() {
                Some(mapping) => {
                    if direction == Direction::In && landed > 0 {
                        let received = landed.min(info.buffer.len());
                        mapping.write_at(offset, &info.buffer[..received]);
                    }
                    buf.rcur += landed;
                    true
                }
                None => false,
            }
        };

        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            let done = BulkCompletion {
                status: info.status,
                offset,
                length: landed,
            };
            match self.endpoint.direction() {
                Direction::In => callback.on_bulk_read(done),
                Direction::Out => callback.on_bulk_write(done),
            }
        }

        self.set_idle(index);

        if info.status == RequestStatus::Completed && mapped {
            if let Err(e) = self.submit_next() {
                if !e.is_stream_idle() {
                    warn!(
                        "Bulk resubmit on endpoint {:#x} of device {} failed: {}",
                        self.endpoint.address, self.device, e
                    );
                }
            }
        }
    }

    /// Stop streaming and reset the ring
    ///
    /// The callback is detached while in-flight requests are cancelled so
    /// their completions are not reported, and restored afterwards. Slots
    /// still in flight once the grace period ends are forced idle.
    pub fn cancel(&self) {
        let saved = self.stop();
        let mut callback = lock(&self.callback);
        if callback.is_none() {
            *callback = saved;
        }
    }

    /// Cancel everything and drop the callback for good
    pub fn shutdown(&self) {
        self.stop();
    }

    fn stop(&self) -> Option<Arc<dyn BulkCallback>> {
        let saved = lock(&self.callback).take();
        lock(&self.buffer).reset();

        let active: Vec<usize> = lock(&self.ring)
            .iter()
            .enumerate()
            .filter(|(_, n)| n.in_flight())
            .map(|(i, _)| i)
            .collect();
        if active.is_empty() {
            return saved;
        }

        for &index in &active {
            let request = lock(&self.requests[index]);
            if let Err(e) = self.controller.cancel(&request) {
                warn!(
                    "Cancel of bulk slot {} on endpoint {:#x} failed: {}",
                    index, self.endpoint.address, e
                );
            }
        }

        let ring = lock(&self.ring);
        let (mut ring, wait) = self
            .quiescent
            .wait_timeout_while(ring, self.grace, |ring| {
                ring.iter().any(|n| n.state != NodeState::Idle)
            })
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() {
            warn!(
                "Bulk stream on endpoint {:#x} of device {} not quiescent after {:?}, forcing idle",
                self.endpoint.address, self.device, self.grace
            );
        }

        for (index, node) in ring.iter_mut().enumerate() {
            if node.state != NodeState::Idle {
                self.completions[index].force(RequestStatus::Completed);
                *node = RingNode::IDLE;
            }
        }
        drop(ring);
        self.quiescent.notify_all();

        debug!(
            "Cancelled {} bulk requests on endpoint {:#x} of device {}",
            active.len(),
            self.endpoint.address,
            self.device
        );
        saved
    }
}

impl HostDevice {
    pub fn find_bulk_stream(&self, pipe: UsbPipe) -> Option<Arc<BulkStream>> {
        lock(&self.bulk_streams).get(&pipe).cloned()
    }

    /// Streaming context of a pipe, created on first use
    pub fn bulk_stream(&self, pipe: UsbPipe) -> Result<Arc<BulkStream>> {
        if let Some(stream) = self.find_bulk_stream(pipe) {
            return Ok(stream);
        }

        let endpoint = self.resolve_pipe(pipe)?;
        let mut streams = lock(&self.bulk_streams);
        let stream = streams.entry(pipe).or_insert_with(|| {
            BulkStream::new(
                self.id(),
                pipe.interface_id,
                endpoint,
                self.controller().clone(),
                self.bulk_cancel_grace(),
            )
        });
        Ok(stream.clone())
    }

    /// Stream from an IN pipe into shared memory
    pub fn bulk_read(&self, pipe: UsbPipe, memory: SharedMemory) -> Result<()> {
        self.start_stream(pipe, Direction::In, memory)
    }

    /// Stream shared memory out of an OUT pipe
    pub fn bulk_write(&self, pipe: UsbPipe, memory: SharedMemory) -> Result<()> {
        self.start_stream(pipe, Direction::Out, memory)
    }

    fn start_stream(&self, pipe: UsbPipe, direction: Direction, memory: SharedMemory) -> Result<()> {
        let stream = self.bulk_stream(pipe)?;
        if stream.endpoint().direction() != direction {
            warn!(
                "Endpoint {:#x} cannot stream {:?}",
                pipe.endpoint_id, direction
            );
            return Err(UsbdError::InvalidParam);
        }
        stream.start(memory).inspect_err(|e| {
            warn!(
                "Bulk stream on endpoint {:#x} of device {} failed to start: {}",
                pipe.endpoint_id,
                self.id(),
                e
            )
        })
    }

    /// Cancel streaming on a pipe; a no-op when it never streamed
    pub fn bulk_cancel(&self, pipe: UsbPipe) -> Result<()> {
        match self.find_bulk_stream(pipe) {
            Some(stream) => stream.cancel(),
            None => debug!(
                "No bulk stream on pipe {}/{:#x} of device {}",
                pipe.interface_id,
                pipe.endpoint_id,
                self.id()
            ),
        }
        Ok(())
    }

    pub fn reg_bulk_callback(&self, pipe: UsbPipe, callback: Arc<dyn BulkCallback>) -> Result<()> {
        self.bulk_stream(pipe)?.set_callback(Some(callback));
        Ok(())
    }

    pub fn unreg_bulk_callback(&self, pipe: UsbPipe) -> Result<()> {
        if let Some(stream) = self.find_bulk_stream(pipe) {
            stream.set_callback(None);
        }
        Ok(())
    }
}
