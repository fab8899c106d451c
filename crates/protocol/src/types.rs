//! USB and service type definitions
//!
//! This module defines the identities callers use to address devices and
//! pipes, the endpoint/interface metadata resolved from claimed interfaces,
//! the control transfer descriptor and the events delivered to subscribers.

use crate::constants::{BASE_CLASS_HUB, USB_ENDPOINT_DIR_MASK, USB_RECIP_MASK};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identity of an attached device
///
/// Not unique across replug: the bus may hand out the same address again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDev {
    /// Bus number
    pub bus_num: u8,
    /// Device address on the bus
    pub dev_addr: u8,
}

impl UsbDev {
    pub const fn new(bus_num: u8, dev_addr: u8) -> Self {
        Self { bus_num, dev_addr }
    }
}

impl fmt::Display for UsbDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_num, self.dev_addr)
    }
}

/// One communication pipe within a device
///
/// Direction is encoded in the high bit of `endpoint_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbPipe {
    /// Interface number
    pub interface_id: u8,
    /// Endpoint address (includes direction bit)
    pub endpoint_id: u8,
}

impl UsbPipe {
    pub const fn new(interface_id: u8, endpoint_id: u8) -> Self {
        Self {
            interface_id,
            endpoint_id,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint_id)
    }
}

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction from an endpoint address or bmRequestType byte
    pub const fn from_address(value: u8) -> Self {
        if value & USB_ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn bit(self) -> u8 {
        match self {
            Direction::Out => 0,
            Direction::In => USB_ENDPOINT_DIR_MASK,
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint metadata taken from a claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint address (includes direction bit)
    pub address: u8,
    pub pipe_type: PipeType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub number: u8,
    /// Currently selected alternate setting
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    /// Find an endpoint by its full address
    pub fn find_endpoint(&self, address: u8) -> Option<&EndpointInfo> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }
}

/// Recipient field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl RequestRecipient {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & USB_RECIP_MASK {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            _ => RequestRecipient::Other,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            RequestRecipient::Device => 0,
            RequestRecipient::Interface => 1,
            RequestRecipient::Endpoint => 2,
            RequestRecipient::Other => 3,
        }
    }
}

/// Type field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

impl RequestKind {
    pub const fn from_request_type(request_type: u8) -> Self {
        match (request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub const fn bits(self) -> u8 {
        let value = match self {
            RequestKind::Standard => 0,
            RequestKind::Class => 1,
            RequestKind::Vendor => 2,
            RequestKind::Reserved => 3,
        };
        value << 5
    }
}

/// Caller-supplied control transfer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbCtrlTransfer {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request_cmd: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Timeout in milliseconds (0 or negative waits forever)
    pub timeout_ms: i32,
}

impl UsbCtrlTransfer {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    pub fn recipient(&self) -> RequestRecipient {
        RequestRecipient::from_bits(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from_request_type(self.request_type)
    }
}

/// Attach/detach notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAction {
    /// Host-side device attached
    DevUp,
    /// Host-side device removed
    DevDown,
    /// Gadget function came up
    UpDevice,
    /// Gadget function went down
    DownDevice,
}

/// Event delivered to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub action: DeviceAction,
    pub bus_num: u8,
    pub dev_addr: u8,
}

impl UsbDeviceInfo {
    pub const fn new(action: DeviceAction, dev: UsbDev) -> Self {
        Self {
            action,
            bus_num: dev.bus_num,
            dev_addr: dev.dev_addr,
        }
    }
}

/// Port role snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_id: i32,
    pub power_role: i32,
    pub data_role: i32,
    pub mode: i32,
}

/// Device as reported by enumeration or a pnp notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnpDeviceInfo {
    pub bus_num: u8,
    pub dev_addr: u8,
    pub device_class: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl PnpDeviceInfo {
    pub fn dev(&self) -> UsbDev {
        UsbDev::new(self.bus_num, self.dev_addr)
    }

    pub fn is_hub(&self) -> bool {
        self.device_class == BASE_CLASS_HUB
    }
}

/// Hot-plug notification from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnpEvent {
    DeviceAdded(PnpDeviceInfo),
    DeviceRemoved(PnpDeviceInfo),
    GadgetAdded,
    GadgetRemoved,
}
