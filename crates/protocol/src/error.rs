//! Service error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the USB host service
///
/// Every transfer-engine operation returns one of these instead of panicking.
/// [`UsbdError::status_code`] gives the integer a dispatcher puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbdError {
    /// Null/out-of-range argument or a pipe that cannot be resolved
    #[error("Invalid parameter")]
    InvalidParam,

    /// Registry miss, or the device vanished under us
    #[error("No such device")]
    NoDevice,

    /// Request pool exhausted or no free ring slot
    #[error("Device busy")]
    Busy,

    /// No data before the deadline
    #[error("Transfer timed out")]
    Timeout,

    /// Submission or verification failure on the bus
    #[error("I/O error")]
    Io,

    /// Generic failure
    #[error("Operation failed")]
    Failure,

    /// Request object could not be allocated
    #[error("Allocation failed")]
    MallocFail,

    /// Streaming buffer has nothing left to hand out
    #[error("No data available")]
    NoData,

    /// Streaming buffer not mapped
    #[error("Out of memory")]
    NoMemory,
}

impl UsbdError {
    /// HDF-compatible integer status code
    pub const fn status_code(self) -> i32 {
        match self {
            UsbdError::Failure => -1,
            UsbdError::InvalidParam => -3,
            UsbdError::MallocFail => -6,
            UsbdError::Timeout => -7,
            UsbdError::Busy => -16,
            UsbdError::Io => -17,
            UsbdError::NoMemory => -201,
            UsbdError::NoDevice => -202,
            UsbdError::NoData => -207,
        }
    }

    /// Whether a bulk-streaming submission may ignore this outcome
    ///
    /// Streaming keeps going through completion callbacks when the ring is
    /// full, the buffer is exhausted or not mapped.
    pub const fn is_stream_idle(self) -> bool {
        matches!(
            self,
            UsbdError::Busy | UsbdError::NoData | UsbdError::NoMemory
        )
    }
}

/// Status code for a whole result, `0` on success
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}

/// Type alias for service results
pub type Result<T> = std::result::Result<T, UsbdError>;
