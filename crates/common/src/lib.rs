//! Common utilities for the USB host service
//!
//! This crate provides functionality shared by the engine and the daemon:
//! logging setup, ambient error handling and the event bridge that carries
//! subscriber notifications from USB threads into the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{EventBridge, EventSink, UsbdEvent, create_event_bridge};
pub use error::{Error, Result};
pub use logging::{LogFormat, setup_logging};
