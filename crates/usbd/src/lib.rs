//! USB host driver service
//!
//! Per-device request pools and the transfer engine for attached USB
//! devices: synchronous chunked transfers, an asynchronous request queue
//! with FIFO retrieval and bulk streaming into caller-supplied shared
//! memory, all on top of a pluggable host controller. Port role and gadget
//! function state, the subscriber adapter and configuration live alongside.

pub mod config;
pub mod function;
pub mod port;
pub mod subscriber;
pub mod usb;

pub use config::UsbdConfig;
pub use subscriber::ChannelSubscriber;
pub use usb::{HostController, ServiceOptions, UsbdService, UsbdSubscriber};
