//! Limits and wire constants shared by the service

use std::time::Duration;

/// Number of interface slots per device
pub const USB_MAX_INTERFACES: usize = 32;

/// Async request objects allowed per (interface, endpoint)
pub const MAX_REQUESTASYNC_NUM: usize = 20;

/// Outstanding requests in one bulk streaming ring
pub const USBD_BULKASYNCREQ_NUM_MAX: usize = 64;

/// Packets carried by one bulk streaming request
pub const BULK_ASYNC_PACKETS_PER_REQ: usize = 4;

/// Scratch capacity of a synchronous read
pub const READ_BUF_SIZE: usize = 8192;

/// Data stage capacity of a control read
pub const MAX_CONTROL_BUFF_SIZE: usize = 1024;

/// Sub-timeout of one chunk in a synchronous read
pub const READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound of the quiescence wait in bulk cancel
pub const USB_BULK_CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Timeout of standard control requests issued by the service
pub const USB_CTRL_SET_TIMEOUT: Duration = Duration::from_millis(5000);

/// Timeout of string descriptor reads
pub const GET_STRING_SET_TIMEOUT: Duration = Duration::from_millis(50);

/// USB device class code of hubs
pub const BASE_CLASS_HUB: u8 = 0x09;

/// Endpoint / bmRequestType direction bit
pub const USB_ENDPOINT_DIR_MASK: u8 = 0x80;

/// bmRequestType recipient bits
pub const USB_RECIP_MASK: u8 = 0x1F;

/// Standard requests used by the service
pub mod request {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// Descriptor types for GET_DESCRIPTOR
pub mod descriptor {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const STRING: u8 = 0x03;
}
