//! Service facade integration tests
//!
//! Tests hot-plug handling, descriptor access and the port/function
//! settings through [`UsbdService`], including:
//! - Hub arrival and removal
//! - Attach failures during pnp handling
//! - Descriptor and configuration queries
//! - Alternate interface settings
//! - Persisted port role and gadget functions
//!
//! Run with: `cargo test -p usbd --test service_tests`

use common::{EventBridge, UsbdEvent, create_event_bridge};
use protocol::constants::descriptor;
use protocol::{
    DeviceAction, InterfaceInfo, PipeType, PnpDeviceInfo, PnpEvent, PortInfo, UsbDev,
    UsbDeviceInfo, UsbPipe, UsbdError,
};
use std::sync::Arc;
use usbd::function::{FUNCTION_ACM, FUNCTION_ECM, FUNCTION_HDC, FUNCTION_MTP, FUNCTION_PTP};
use usbd::port::{
    DATA_ROLE_DEVICE, DATA_ROLE_HOST, PORT_MODE_DFP, PORT_MODE_UFP, POWER_ROLE_SINK,
    POWER_ROLE_SOURCE,
};
use usbd::usb::test_utils::{MockDevice, MockHostController};
use usbd::{ChannelSubscriber, ServiceOptions, UsbdService};

const DEV: UsbDev = UsbDev::new(1, 5);

struct Harness {
    mock: Arc<MockHostController>,
    service: UsbdService,
    bridge: EventBridge,
}

impl Harness {
    fn new(options: ServiceOptions) -> Self {
        let mock = Arc::new(MockHostController::new());
        let service = UsbdService::new(mock.clone(), options);
        let (bridge, sink) = create_event_bridge();
        service
            .bind_subscriber(Arc::new(ChannelSubscriber::new(sink)))
            .unwrap();
        Self {
            mock,
            service,
            bridge,
        }
    }

    fn plug(&self, device: MockDevice) -> PnpDeviceInfo {
        let info = device.info();
        self.mock.add_device(device);
        info
    }

    fn device_events(&self) -> Vec<UsbDeviceInfo> {
        std::iter::from_fn(|| self.bridge.try_recv_event())
            .filter_map(|event| match event {
                UsbdEvent::Device(info) => Some(info),
                UsbdEvent::Port(_) => None,
            })
            .collect()
    }

    fn port_events(&self) -> Vec<PortInfo> {
        std::iter::from_fn(|| self.bridge.try_recv_event())
            .filter_map(|event| match event {
                UsbdEvent::Port(info) => Some(info),
                UsbdEvent::Device(_) => None,
            })
            .collect()
    }
}

fn harness() -> Harness {
    Harness::new(ServiceOptions::default())
}

// ============================================================================
// Hot-plug
// ============================================================================

#[test]
fn test_bind_reports_attached_devices_except_hubs() {
    let mock = Arc::new(MockHostController::new());
    mock.add_device(MockDevice::hub(1, 1));
    mock.add_device(MockDevice::new(1, 5));
    mock.add_device(MockDevice::new(2, 4));
    let service = UsbdService::new(mock.clone(), ServiceOptions::default());

    let (bridge, sink) = create_event_bridge();
    service
        .bind_subscriber(Arc::new(ChannelSubscriber::new(sink)))
        .unwrap();

    let mut devices = service.registry().devices();
    devices.sort_by_key(|d| (d.bus_num, d.dev_addr));
    assert_eq!(devices, vec![UsbDev::new(1, 5), UsbDev::new(2, 4)]);
    assert!(!mock.is_open(UsbDev::new(1, 1)));

    let mut count = 0;
    while let Some(UsbdEvent::Device(info)) = bridge.try_recv_event() {
        assert_eq!(info.action, DeviceAction::DevUp);
        count += 1;
    }
    assert_eq!(count, 2);
}

#[test]
fn test_device_add_and_remove() {
    let h = harness();
    let info = h.plug(MockDevice::new(1, 5));

    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    assert!(h.service.device(DEV).is_ok());
    assert!(h.mock.is_open(DEV));

    h.service.handle_pnp_event(PnpEvent::DeviceRemoved(info)).unwrap();
    assert_eq!(h.service.device(DEV).unwrap_err(), UsbdError::NoDevice);
    assert!(!h.mock.is_open(DEV));

    assert_eq!(
        h.device_events(),
        vec![
            UsbDeviceInfo::new(DeviceAction::DevUp, DEV),
            UsbDeviceInfo::new(DeviceAction::DevDown, DEV),
        ]
    );
}

#[test]
fn test_repeated_add_keeps_one_entry() {
    let h = harness();
    let info = h.plug(MockDevice::new(1, 5));
    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    let first = h.service.device(DEV).unwrap();
    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();

    assert!(Arc::ptr_eq(&first, &h.service.device(DEV).unwrap()));
    assert_eq!(h.service.registry().len(), 1);
}

#[test]
fn test_attach_failure_still_notifies() {
    let h = harness();
    let info = h.plug(MockDevice::new(1, 5));
    h.mock.fail_open(true);

    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    assert!(h.service.registry().is_empty());
    assert_eq!(
        h.device_events(),
        vec![UsbDeviceInfo::new(DeviceAction::DevUp, DEV)]
    );
}

#[test]
fn test_hub_arrival_is_ignored() {
    let h = harness();
    let hub = h.plug(MockDevice::hub(3, 1));

    h.service.handle_pnp_event(PnpEvent::DeviceAdded(hub)).unwrap();
    assert!(h.service.registry().is_empty());
    assert!(h.device_events().is_empty());
}

#[test]
fn test_hub_removal_detaches_its_bus_silently() {
    let h = harness();
    let hub = h.plug(MockDevice::hub(3, 1));
    let on_bus = [h.plug(MockDevice::new(3, 2)), h.plug(MockDevice::new(3, 7))];
    let elsewhere = h.plug(MockDevice::new(4, 2));
    for info in on_bus.iter().chain(std::iter::once(&elsewhere)) {
        h.service.handle_pnp_event(PnpEvent::DeviceAdded(*info)).unwrap();
    }
    h.device_events();

    h.service.handle_pnp_event(PnpEvent::DeviceRemoved(hub)).unwrap();
    assert_eq!(h.service.registry().devices(), vec![UsbDev::new(4, 2)]);
    assert!(!h.mock.is_open(UsbDev::new(3, 2)));
    assert!(h.device_events().is_empty());
}

#[test]
fn test_gadget_events_use_zero_address() {
    let h = harness();
    h.service.handle_pnp_event(PnpEvent::GadgetAdded).unwrap();
    h.service.handle_pnp_event(PnpEvent::GadgetRemoved).unwrap();

    let zero = UsbDev::new(0, 0);
    assert_eq!(
        h.device_events(),
        vec![
            UsbDeviceInfo::new(DeviceAction::UpDevice, zero),
            UsbDeviceInfo::new(DeviceAction::DownDevice, zero),
        ]
    );
}

#[test]
fn test_unbound_subscriber_fails_delivery() {
    let h = harness();
    h.service.unbind_subscriber().unwrap();
    let info = h.plug(MockDevice::new(1, 5));

    assert_eq!(
        h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)),
        Err(UsbdError::Failure)
    );
    // The registry change happens regardless.
    assert!(h.service.device(DEV).is_ok());
}

#[test]
fn test_shutdown_releases_everything() {
    let h = harness();
    for addr in 2..5 {
        let info = h.plug(MockDevice::new(1, addr));
        h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    }

    assert_eq!(h.service.shutdown(), 3);
    assert!(h.service.registry().is_empty());
    assert!(!h.mock.is_open(UsbDev::new(1, 3)));
}

// ============================================================================
// Descriptors and Configuration
// ============================================================================

fn attached() -> Harness {
    let h = harness();
    let info = h.plug(
        MockDevice::new(1, 5)
            .with_ids(0x046d, 0xc52b)
            .with_interface(MockDevice::standard_interface(0, 64)),
    );
    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    h
}

#[test]
fn test_device_descriptor() {
    let h = attached();
    let desc = h.service.get_device_descriptor(DEV).unwrap();
    assert_eq!(desc.len(), 18);
    assert_eq!(desc[1], descriptor::DEVICE);
    assert_eq!(u16::from_le_bytes([desc[8], desc[9]]), 0x046d);
    assert_eq!(u16::from_le_bytes([desc[10], desc[11]]), 0xc52b);
}

#[test]
fn test_string_descriptor_uses_short_timeout() {
    let h = attached();
    let desc = h.service.get_string_descriptor(DEV, 2).unwrap();
    assert_eq!(desc[1], descriptor::STRING);
    assert_eq!(desc[0] as usize, desc.len());

    let submission = h.mock.submissions().last().unwrap().clone();
    assert_eq!(submission.timeout, protocol::constants::GET_STRING_SET_TIMEOUT);
    assert_eq!(submission.setup().unwrap().value, 0x0302);
}

#[test]
fn test_config_descriptor_total_length() {
    let h = attached();
    let desc = h.service.get_config_descriptor(DEV, 0).unwrap();
    assert_eq!(desc[1], descriptor::CONFIG);
    assert_eq!(u16::from_le_bytes([desc[2], desc[3]]) as usize, desc.len());
}

#[test]
fn test_unknown_config_descriptor_fails() {
    let h = attached();
    assert_eq!(
        h.service.get_config_descriptor(DEV, 4),
        Err(UsbdError::Io)
    );
}

#[test]
fn test_raw_descriptor_starts_with_device_descriptor() {
    let h = attached();
    let raw = h.service.get_raw_descriptor(DEV).unwrap();
    assert_eq!(&raw[..18], &h.service.get_device_descriptor(DEV).unwrap()[..]);
    assert_eq!(raw[19], descriptor::CONFIG);
}

#[test]
fn test_file_descriptor_requires_registered_device() {
    let h = attached();
    assert!(h.service.get_file_descriptor(DEV).is_ok());
    assert_eq!(
        h.service.get_file_descriptor(UsbDev::new(7, 7)).unwrap_err(),
        UsbdError::NoDevice
    );
}

#[test]
fn test_get_and_set_config() {
    let h = attached();
    assert_eq!(h.service.get_config(DEV).unwrap(), 1);

    h.service.set_config(DEV, 2).unwrap();
    assert_eq!(h.service.get_config(DEV).unwrap(), 2);
    assert!(h.service.device(DEV).unwrap().is_open());
}

#[test]
fn test_set_config_zero_does_not_reopen() {
    let h = attached();
    h.service.claim_interface(DEV, 0, false).unwrap();

    h.service.set_config(DEV, 0).unwrap();
    assert_eq!(h.mock.active_config(DEV), Some(0));
    assert!(h.service.device(DEV).unwrap().interface(0).is_some());
}

// ============================================================================
// Interfaces
// ============================================================================

fn alternate_setting() -> InterfaceInfo {
    let mut alt = MockDevice::standard_interface(0, 512);
    alt.alt_setting = 1;
    alt
}

#[test]
fn test_claim_failure_is_failure() {
    let h = attached();
    h.mock.fail_claim(true);
    assert_eq!(
        h.service.claim_interface(DEV, 0, true),
        Err(UsbdError::Failure)
    );
}

#[test]
fn test_claim_is_idempotent() {
    let h = attached();
    h.service.claim_interface(DEV, 0, false).unwrap();
    h.mock.fail_claim(true);
    h.service.claim_interface(DEV, 0, false).unwrap();
    assert_eq!(h.mock.claimed_interfaces(DEV), vec![0]);
}

#[test]
fn test_release_of_unclaimed_interface_is_ok() {
    let h = attached();
    h.service.release_interface(DEV, 3).unwrap();
    assert_eq!(
        h.service.release_interface(DEV, 200),
        Err(UsbdError::InvalidParam)
    );
}

#[test]
fn test_set_interface_switches_endpoints() {
    let h = harness();
    let info = h.plug(
        MockDevice::new(1, 5)
            .with_interface(MockDevice::standard_interface(0, 64))
            .with_interface(alternate_setting()),
    );
    h.service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    h.service.claim_interface(DEV, 0, false).unwrap();

    let pipe = UsbPipe::new(0, 0x01);
    h.service.bulk_transfer_write(DEV, pipe, 100, &[0; 512]).unwrap();
    assert_eq!(h.mock.submissions_to(0x01).len(), 8);
    let device = h.service.device(DEV).unwrap();
    assert_eq!(device.sync_request_count(), 1);

    h.service.set_interface(DEV, 0, 1).unwrap();
    assert_eq!(device.sync_request_count(), 0);
    assert_eq!(device.interface(0).unwrap().alt_setting, 1);

    h.mock.clear_submissions();
    h.service.bulk_transfer_write(DEV, pipe, 100, &[0; 512]).unwrap();
    assert_eq!(h.mock.submissions_to(0x01).len(), 1);
}

#[test]
fn test_set_interface_requires_claim() {
    let h = attached();
    assert_eq!(h.service.set_interface(DEV, 0, 1), Err(UsbdError::Failure));
}

#[test]
fn test_set_interface_unknown_setting() {
    let h = attached();
    h.service.claim_interface(DEV, 0, false).unwrap();
    assert_eq!(
        h.service.set_interface(DEV, 0, 5),
        Err(UsbdError::InvalidParam)
    );
    // Current setting is a no-op.
    h.service.set_interface(DEV, 0, 0).unwrap();
}

#[test]
fn test_interrupt_and_iso_pipes() {
    let h = attached();
    h.service.claim_interface(DEV, 0, false).unwrap();

    h.service
        .interrupt_transfer_write(DEV, UsbPipe::new(0, 0x02), 100, &[1, 2])
        .unwrap();
    assert!(h
        .service
        .interrupt_transfer_read(DEV, UsbPipe::new(0, 0x82), 100)
        .unwrap()
        .is_empty());
    assert_eq!(
        h.service.iso_transfer_read(DEV, UsbPipe::new(0, 0x82), 100),
        Err(UsbdError::InvalidParam)
    );
    h.service
        .iso_transfer_write(DEV, UsbPipe::new(0, 0x03), 100, &[0; 10])
        .unwrap();

    let device = h.service.device(DEV).unwrap();
    let entry = device.find_or_create_sync_request(UsbPipe::new(0, 0x03)).unwrap();
    assert_eq!(entry.endpoint().pipe_type, PipeType::Isochronous);
}

// ============================================================================
// Port Roles and Gadget Functions
// ============================================================================

#[test]
fn test_port_defaults_to_device_mode() {
    let h = harness();
    let port = h.service.query_port().unwrap();
    assert_eq!(port.mode, PORT_MODE_UFP);
    assert_eq!(port.power_role, POWER_ROLE_SINK);
    assert_eq!(port.data_role, DATA_ROLE_DEVICE);
}

#[test]
fn test_port_role_is_persisted_and_notified() {
    let dir = tempfile::tempdir().unwrap();
    let mode_file = dir.path().join("port_mode");
    let h = Harness::new(ServiceOptions {
        port_mode_file: Some(mode_file.clone()),
        ..ServiceOptions::default()
    });

    h.service
        .set_port_role(1, POWER_ROLE_SOURCE, DATA_ROLE_HOST)
        .unwrap();
    assert_eq!(std::fs::read_to_string(&mode_file).unwrap(), "host");
    let events = h.port_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].mode, PORT_MODE_DFP);

    // A fresh service picks the mode back up.
    let reloaded = UsbdService::new(
        Arc::new(MockHostController::new()),
        ServiceOptions {
            port_mode_file: Some(mode_file),
            ..ServiceOptions::default()
        },
    );
    assert_eq!(reloaded.query_port().unwrap().mode, PORT_MODE_DFP);
}

#[test]
fn test_invalid_port_roles() {
    let h = harness();
    assert_eq!(
        h.service.set_port_role(2, POWER_ROLE_SOURCE, DATA_ROLE_HOST),
        Err(UsbdError::InvalidParam)
    );
    assert_eq!(
        h.service.set_port_role(1, POWER_ROLE_SOURCE, DATA_ROLE_DEVICE),
        Err(UsbdError::InvalidParam)
    );
    assert!(h.port_events().is_empty());
}

#[test]
fn test_functions_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("functions");
    let options = ServiceOptions {
        function_state_file: Some(state_file.clone()),
        ..ServiceOptions::default()
    };
    let h = Harness::new(options.clone());
    assert_eq!(h.service.get_current_functions().unwrap(), FUNCTION_HDC);

    h.service
        .set_current_functions(FUNCTION_ACM | FUNCTION_ECM)
        .unwrap();
    assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "acm,ecm");

    let reloaded = UsbdService::new(Arc::new(MockHostController::new()), options);
    assert_eq!(
        reloaded.get_current_functions().unwrap(),
        FUNCTION_ACM | FUNCTION_ECM
    );
}

#[test]
fn test_conflicting_functions_are_rejected() {
    let h = harness();
    assert_eq!(
        h.service.set_current_functions(FUNCTION_MTP | FUNCTION_PTP),
        Err(UsbdError::InvalidParam)
    );
    assert_eq!(h.service.get_current_functions().unwrap(), FUNCTION_HDC);
}
