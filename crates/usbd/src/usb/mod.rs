//! USB host subsystem
//!
//! Manages the per-device request pools and the transfer engine on top of a
//! [`HostController`], plus the registry of attached devices.
//!
//! This module implements:
//! - Device registry keyed by (bus, address), fed by hot-plug events
//! - Synchronous chunked transfers over pooled per-pipe requests
//! - Asynchronous request queue with FIFO completion retrieval
//! - Bulk streaming into caller-supplied shared memory
//! - The rusb backend and the hot-plug worker thread
//!
//! Transfers run on the calling thread; completions of asynchronous and
//! streaming requests arrive on the controller's own threads.

pub mod async_queue;
pub mod bulk_stream;
pub mod controller;
pub mod device;
pub mod registry;
pub mod request;
pub mod rusb_backend;
pub mod service;
pub mod shared_buffer;
/// Scripted host controller, only built for tests or with the `test-utils`
/// feature
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfers;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bulk_stream::{BulkCallback, BulkCompletion};
pub use controller::HostController;
pub use device::HostDevice;
pub use registry::DeviceRegistry;
pub use rusb_backend::RusbController;
pub use service::{ServiceOptions, UsbdService, UsbdSubscriber};
pub use shared_buffer::SharedMemory;
pub use worker::{HotplugWorker, spawn_hotplug_worker};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
