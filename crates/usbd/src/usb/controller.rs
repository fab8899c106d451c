//! Host-controller transfer primitive
//!
//! The engine never touches the bus directly. Everything it needs from the
//! platform goes through [`HostController`]: opening devices, claiming
//! interfaces and submitting or cancelling [`UsbRequest`]s.

use crate::usb::request::{RequestParams, UsbRequest};
use protocol::{InterfaceInfo, PnpDeviceInfo, Result, UsbDev};
use std::os::fd::OwnedFd;

/// Platform USB host primitive
///
/// Implementations must be callable from any thread. Asynchronous
/// submissions signal the request's completion later, from a thread of the
/// controller's choosing, and never before `submit_async` returns.
pub trait HostController: Send + Sync {
    /// Devices currently attached
    fn enumerate(&self) -> Result<Vec<PnpDeviceInfo>>;

    /// Open the control pipe of a device
    fn open_device(&self, dev: UsbDev) -> Result<()>;

    fn close_device(&self, dev: UsbDev);

    /// Claim an interface, detaching a bound kernel driver when `force` is set
    ///
    /// Returns the interface with its currently selected alternate setting.
    fn claim_interface(&self, dev: UsbDev, interface: u8, force: bool) -> Result<InterfaceInfo>;

    fn release_interface(&self, dev: UsbDev, interface: u8) -> Result<()>;

    /// Select an alternate setting of a claimed interface
    fn select_interface_setting(
        &self,
        dev: UsbDev,
        interface: u8,
        alt_setting: u8,
    ) -> Result<InterfaceInfo>;

    /// Device descriptor followed by every configuration descriptor
    fn raw_descriptors(&self, dev: UsbDev) -> Result<Vec<u8>>;

    /// Duplicate of the device node descriptor
    fn file_descriptor(&self, dev: UsbDev) -> Result<OwnedFd>;

    /// Bind parameters to a request ahead of submission
    fn fill_request(&self, request: &mut UsbRequest, params: RequestParams) -> Result<()> {
        request.fill(params);
        Ok(())
    }

    /// Submit and block until the transfer finishes
    ///
    /// On success the request's completion holds the received data and the
    /// actual length. Transfer failures are returned directly.
    fn submit_sync(&self, request: &UsbRequest) -> Result<()>;

    /// Submit without waiting for the transfer
    fn submit_async(&self, request: &UsbRequest) -> Result<()>;

    /// Best-effort cancel of an outstanding asynchronous submission
    fn cancel(&self, request: &UsbRequest) -> Result<()>;
}
