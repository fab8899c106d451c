//! Transfer request objects
//!
//! A [`UsbRequest`] is the reusable unit the pools hand to the host
//! controller: it carries the filled parameters of the next submission and a
//! shared [`Completion`] that the controller signals, possibly from its own
//! completion thread. Waiters block on the completion; streaming contexts
//! attach a hook to it instead.

use crate::usb::lock;
use protocol::{Direction, EndpointInfo, Result, UsbDev, UsbdError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }
}

/// What a request is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    /// Default control pipe
    Control(ControlSetup),
    /// Data endpoint of a claimed interface
    Pipe { interface: u8, endpoint: EndpointInfo },
}

/// Parameters of one submission
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub device: UsbDev,
    pub target: RequestTarget,
    /// OUT payload, empty for IN
    pub data: Vec<u8>,
    /// Bytes requested by an IN transfer
    pub length: usize,
    /// Zero waits forever
    pub timeout: Duration,
}

impl RequestParams {
    pub fn direction(&self) -> Direction {
        match &self.target {
            RequestTarget::Control(setup) => setup.direction(),
            RequestTarget::Pipe { endpoint, .. } => endpoint.direction(),
        }
    }

    /// Bytes moved by this submission when it completes in full
    pub fn transfer_length(&self) -> usize {
        match self.direction() {
            Direction::In => self.length,
            Direction::Out => self.data.len(),
        }
    }
}

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Never submitted
    Idle,
    /// Submitted, completion not yet signaled
    Pending,
    Completed,
    Cancelled,
    Failed(UsbdError),
}

/// Result of the last submission
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    pub status: RequestStatus,
    /// Bumped on every reset so results of an earlier submission can be told apart
    pub generation: u64,
    pub actual_length: usize,
    /// Data received by an IN transfer
    pub buffer: Vec<u8>,
}

impl Default for CompletionInfo {
    fn default() -> Self {
        Self {
            status: RequestStatus::Idle,
            generation: 0,
            actual_length: 0,
            buffer: Vec::new(),
        }
    }
}

/// Invoked after a completion is signaled, outside the completion lock
///
/// Receives the generation that completed; the request may have been
/// re-armed by the time the hook runs.
pub type CompletionHook = Arc<dyn Fn(&Completion, u64) + Send + Sync>;

/// Completion signal shared between a request and its controller
pub struct Completion {
    info: Mutex<CompletionInfo>,
    done: Condvar,
    hook: Mutex<Option<CompletionHook>>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            info: Mutex::new(CompletionInfo::default()),
            done: Condvar::new(),
            hook: Mutex::new(None),
        }
    }

    /// Arm for a new submission, returning its generation
    pub fn reset(&self) -> u64 {
        let mut info = lock(&self.info);
        info.status = RequestStatus::Pending;
        info.generation = info.generation.wrapping_add(1);
        info.actual_length = 0;
        info.buffer.clear();
        info.generation
    }

    pub fn generation(&self) -> u64 {
        lock(&self.info).generation
    }

    /// Signal the outcome of the current pending submission
    ///
    /// Returns false when the request was not pending, e.g. a late result
    /// after a cancel already completed it.
    pub fn complete(&self, status: RequestStatus, actual_length: usize, buffer: Vec<u8>) -> bool {
        self.complete_generation(None, status, actual_length, buffer)
    }

    /// Signal the outcome of the submission armed as `generation`
    ///
    /// Ignored when the request has been re-armed since.
    pub fn complete_for(
        &self,
        generation: u64,
        status: RequestStatus,
        actual_length: usize,
        buffer: Vec<u8>,
    ) -> bool {
        self.complete_generation(Some(generation), status, actual_length, buffer)
    }

    fn complete_generation(
        &self,
        generation: Option<u64>,
        status: RequestStatus,
        actual_length: usize,
        buffer: Vec<u8>,
    ) -> bool {
        let completed = {
            let mut info = lock(&self.info);
            if info.status != RequestStatus::Pending {
                return false;
            }
            if generation.is_some_and(|g| g != info.generation) {
                return false;
            }
            info.status = status;
            info.actual_length = actual_length;
            info.buffer = buffer;
            info.generation
        };
        self.done.notify_all();

        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(self, completed);
        }
        true
    }

    /// Overwrite the status without running the hook
    pub fn force(&self, status: RequestStatus) {
        lock(&self.info).status = status;
        self.done.notify_all();
    }

    pub fn status(&self) -> RequestStatus {
        lock(&self.info).status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending
    }

    /// Block until the submission completes
    ///
    /// `None` waits forever. Fails with `Timeout` if still pending.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<RequestStatus> {
        let info = lock(&self.info);
        let info = match timeout {
            Some(timeout) => {
                let (info, _) = self
                    .done
                    .wait_timeout_while(info, timeout, |i| i.status == RequestStatus::Pending)
                    .unwrap_or_else(|e| e.into_inner());
                info
            }
            None => self
                .done
                .wait_while(info, |i| i.status == RequestStatus::Pending)
                .unwrap_or_else(|e| e.into_inner()),
        };

        match info.status {
            RequestStatus::Pending => Err(UsbdError::Timeout),
            status => Ok(status),
        }
    }

    /// Take the completion data, leaving the status in place
    pub fn take(&self) -> CompletionInfo {
        let mut info = lock(&self.info);
        CompletionInfo {
            status: info.status,
            generation: info.generation,
            actual_length: std::mem::take(&mut info.actual_length),
            buffer: std::mem::take(&mut info.buffer),
        }
    }

    pub fn set_hook(&self, hook: CompletionHook) {
        *lock(&self.hook) = Some(hook);
    }

    pub fn clear_hook(&self) {
        lock(&self.hook).take();
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Reusable transfer request
pub struct UsbRequest {
    id: RequestId,
    params: Option<RequestParams>,
    completion: Arc<Completion>,
}

impl UsbRequest {
    pub fn new() -> Self {
        Self {
            id: RequestId::next(),
            params: None,
            completion: Arc::new(Completion::new()),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Parameters of the next (or last) submission
    pub fn params(&self) -> Option<&RequestParams> {
        self.params.as_ref()
    }

    pub fn fill(&mut self, params: RequestParams) {
        self.params = Some(params);
    }

    /// Drop the parameters, releasing any payload copy
    pub fn clear(&mut self) {
        self.params = None;
    }

    pub fn completion(&self) -> &Arc<Completion> {
        &self.completion
    }
}

impl Default for UsbRequest {
    fn default() -> Self {
        Self::new()
    }
}
