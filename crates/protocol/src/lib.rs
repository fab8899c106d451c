//! Data model for the USB host driver service
//!
//! This crate holds the identities, endpoint metadata, events and error
//! taxonomy shared by the host engine, its backends and the daemon.
//!
//! # Example
//!
//! ```
//! use protocol::{Direction, UsbDev, UsbPipe};
//!
//! let dev = UsbDev::new(1, 5);
//! let pipe = UsbPipe::new(0, 0x81);
//! assert_eq!(pipe.direction(), Direction::In);
//! assert_eq!(dev.to_string(), "001:005");
//! ```

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Result, UsbdError, status_code};
pub use types::*;
