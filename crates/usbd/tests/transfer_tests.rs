//! Synchronous transfer integration tests
//!
//! Exercises the chunked transfer engine against the scripted mock
//! controller:
//! - Sync request reuse per pipe
//! - Max-packet-size chunking of writes
//! - Chunked reads, short packets and per-chunk timeout retries
//! - Control transfers and configuration switching
//! - A device disappearing between two transfers
//!
//! Run with: `cargo test -p usbd --test transfer_tests`

use common::{UsbdEvent, create_event_bridge};
use proptest::prelude::*;
use protocol::constants::request;
use protocol::{
    DeviceAction, PipeType, PnpEvent, UsbCtrlTransfer, UsbDev, UsbPipe, UsbdError,
};
use std::sync::Arc;
use usbd::usb::HostDevice;
use usbd::usb::test_utils::{MockDevice, MockHostController, MockResponse};
use usbd::{ChannelSubscriber, ServiceOptions, UsbdService};

const DEV: UsbDev = UsbDev::new(1, 5);
const BULK_IN: UsbPipe = UsbPipe::new(0, 0x81);
const BULK_OUT: UsbPipe = UsbPipe::new(0, 0x01);

/// Open device 1:5 with interface 0 claimed
fn claimed_device(max_packet_size: u16) -> (Arc<MockHostController>, Arc<HostDevice>) {
    let mock = Arc::new(MockHostController::new());
    mock.add_device(
        MockDevice::new(1, 5).with_interface(MockDevice::standard_interface(0, max_packet_size)),
    );
    let device = HostDevice::open(DEV, mock.clone()).unwrap();
    device.claim_interface(0, false).unwrap();
    (mock, device)
}

fn chunk_lengths(mock: &MockHostController, endpoint: u8) -> Vec<usize> {
    mock.submissions_to(endpoint)
        .iter()
        .map(|s| s.data.len())
        .collect()
}

// ============================================================================
// Sync Request Pool
// ============================================================================

#[test]
fn test_sync_request_is_reused_per_pipe() {
    let (_mock, device) = claimed_device(64);

    device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert_eq!(device.sync_request_count(), 1);

    let first = device.find_or_create_sync_request(BULK_IN).unwrap();
    let second = device.find_or_create_sync_request(BULK_IN).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    device.pipe_write(BULK_OUT, PipeType::Bulk, 100, &[1, 2, 3]).unwrap();
    assert_eq!(device.sync_request_count(), 2);
}

#[test]
fn test_pipe_on_out_of_range_interface_is_rejected() {
    let (_mock, device) = claimed_device(64);
    for interface in [1, 31, 32, 0xFF] {
        assert_eq!(
            device.resolve_pipe(UsbPipe::new(interface, 0x81)),
            Err(UsbdError::InvalidParam)
        );
    }
    assert_eq!(device.sync_request_count(), 0);
}

#[test]
fn test_release_interface_drops_sync_requests() {
    let (mock, device) = claimed_device(64);
    device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();

    device.release_interface(0).unwrap();
    assert_eq!(device.sync_request_count(), 0);
    assert!(mock.claimed_interfaces(DEV).is_empty());
    assert_eq!(
        device.pipe_read(BULK_IN, PipeType::Bulk, 100),
        Err(UsbdError::InvalidParam)
    );
}

#[test]
fn test_unresolvable_pipe_is_invalid_param() {
    let (_mock, device) = claimed_device(64);
    assert_eq!(
        device.pipe_read(UsbPipe::new(0, 0x8F), PipeType::Bulk, 100),
        Err(UsbdError::InvalidParam)
    );
    assert_eq!(
        device.pipe_read(UsbPipe::new(3, 0x81), PipeType::Bulk, 100),
        Err(UsbdError::InvalidParam)
    );
}

#[test]
fn test_pipe_type_and_direction_are_checked() {
    let (_mock, device) = claimed_device(64);
    assert_eq!(
        device.pipe_read(BULK_IN, PipeType::Interrupt, 100),
        Err(UsbdError::InvalidParam)
    );
    assert_eq!(
        device.pipe_read(BULK_OUT, PipeType::Bulk, 100),
        Err(UsbdError::InvalidParam)
    );
    assert_eq!(
        device.pipe_write(UsbPipe::new(0, 0x03), PipeType::Interrupt, 100, &[0]),
        Err(UsbdError::InvalidParam)
    );
    assert!(
        device
            .pipe_write(UsbPipe::new(0, 0x02), PipeType::Interrupt, 100, &[0])
            .is_ok()
    );
}

// ============================================================================
// Chunked Writes
// ============================================================================

#[test]
fn test_write_of_exact_multiple() {
    let (mock, device) = claimed_device(64);
    device.pipe_write(BULK_OUT, PipeType::Bulk, 100, &[7u8; 128]).unwrap();
    assert_eq!(chunk_lengths(&mock, 0x01), vec![64, 64]);
}

#[test]
fn test_write_stops_at_first_failed_chunk() {
    let (mock, device) = claimed_device(64);
    mock.script(0x01, MockResponse::Accept);
    mock.script(0x01, MockResponse::Fail(UsbdError::Io));

    assert_eq!(
        device.pipe_write(BULK_OUT, PipeType::Bulk, 100, &[0u8; 300]),
        Err(UsbdError::Io)
    );
    assert_eq!(mock.submissions_to(0x01).len(), 2);
}

#[test]
fn test_empty_write_is_invalid_param() {
    let (mock, device) = claimed_device(64);
    assert_eq!(
        device.pipe_write(BULK_OUT, PipeType::Bulk, 100, &[]),
        Err(UsbdError::InvalidParam)
    );
    assert!(mock.submissions_to(0x01).is_empty());
}

proptest! {
    #[test]
    fn prop_write_is_split_into_max_packet_chunks(len in 1usize..2048, mps in prop::sample::select(vec![8u16, 64, 512])) {
        let (mock, device) = claimed_device(mps);
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        device.pipe_write(BULK_OUT, PipeType::Bulk, 100, &data).unwrap();

        let packet = mps as usize;
        let lengths = chunk_lengths(&mock, 0x01);
        prop_assert_eq!(lengths.len(), len.div_ceil(packet));
        let (last, full) = lengths.split_last().unwrap();
        prop_assert!(full.iter().all(|&l| l == packet));
        prop_assert_eq!(*last, len - packet * full.len());

        let sent: Vec<u8> = mock
            .submissions_to(0x01)
            .into_iter()
            .flat_map(|s| s.data)
            .collect();
        prop_assert_eq!(sent, data);
    }
}

// ============================================================================
// Chunked Reads
// ============================================================================

#[test]
fn test_read_ends_on_short_packet() {
    let (mock, device) = claimed_device(64);
    mock.script(0x81, MockResponse::Data(vec![1; 64]));
    mock.script(0x81, MockResponse::Data(vec![2; 10]));

    let data = device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert_eq!(data.len(), 74);
    assert_eq!(&data[64..], &[2; 10]);
    assert_eq!(mock.submissions_to(0x81).len(), 2);
}

#[test]
fn test_read_chunk_requests_one_packet() {
    let (mock, device) = claimed_device(64);
    mock.script(0x81, MockResponse::Data(vec![9; 100]));

    let data = device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert_eq!(data.len(), 64);
    assert!(mock.submissions_to(0x81).iter().all(|s| s.length == 64));
}

#[test]
fn test_read_timeout_after_data_is_success() {
    let (mock, device) = claimed_device(64);
    mock.script(0x81, MockResponse::Data(vec![5; 64]));
    mock.script(0x81, MockResponse::Fail(UsbdError::Timeout));

    let data = device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert_eq!(data, vec![5; 64]);
}

#[test]
fn test_read_retries_timeouts_until_an_error() {
    let (mock, device) = claimed_device(64);
    mock.script_n(0x81, MockResponse::Fail(UsbdError::Timeout), 5);
    mock.script(0x81, MockResponse::Fail(UsbdError::Io));

    assert_eq!(
        device.pipe_read(BULK_IN, PipeType::Bulk, 0),
        Err(UsbdError::Io)
    );
    assert_eq!(mock.submissions_to(0x81).len(), 6);
}

#[test]
fn test_read_error_after_data_keeps_data() {
    let (mock, device) = claimed_device(64);
    mock.script(0x81, MockResponse::Data(vec![3; 64]));
    mock.script(0x81, MockResponse::Fail(UsbdError::Io));

    let data = device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert_eq!(data, vec![3; 64]);
}

#[test]
fn test_read_stops_below_capacity() {
    let (mock, device) = claimed_device(512);
    mock.script_n(0x81, MockResponse::Data(vec![0; 512]), 32);

    let data = device.pipe_read(BULK_IN, PipeType::Bulk, 100).unwrap();
    assert!(data.len() < protocol::constants::READ_BUF_SIZE);
    assert_eq!(data.len(), 15 * 512);
}

// ============================================================================
// Control Transfers
// ============================================================================

fn vendor_ctrl(request_type: u8) -> UsbCtrlTransfer {
    UsbCtrlTransfer {
        request_type,
        request_cmd: 0x42,
        value: 0x0102,
        index: 3,
        timeout_ms: 100,
    }
}

#[test]
fn test_control_read_direction_is_checked() {
    let (_mock, device) = claimed_device(64);
    assert_eq!(device.control_read(&vendor_ctrl(0x40)), Err(UsbdError::Failure));
    assert_eq!(
        device.control_write(&vendor_ctrl(0xC0), &[1]),
        Err(UsbdError::Failure)
    );
}

#[test]
fn test_vendor_control_read() {
    let (mock, device) = claimed_device(64);
    mock.script_control(MockResponse::Data(vec![0xAA, 0xBB]));

    let data = device.control_read(&vendor_ctrl(0xC0)).unwrap();
    assert_eq!(data, vec![0xAA, 0xBB]);

    let setup = mock.submissions().last().unwrap().setup().unwrap();
    assert_eq!(setup.request, 0x42);
    assert_eq!(setup.value, 0x0102);
    assert_eq!(setup.index, 3);
}

#[test]
fn test_vendor_control_write_carries_data() {
    let (mock, device) = claimed_device(64);
    device.control_write(&vendor_ctrl(0x40), &[1, 2, 3, 4]).unwrap();

    let submission = mock.submissions().last().unwrap().clone();
    assert_eq!(submission.data, vec![1, 2, 3, 4]);
    assert_eq!(submission.setup().unwrap().length, 4);
}

#[test]
fn test_get_config_reads_active_value() {
    let mock = Arc::new(MockHostController::new());
    mock.add_device(MockDevice::new(1, 5).with_config(3));
    let device = HostDevice::open(DEV, mock).unwrap();
    assert_eq!(device.get_config().unwrap(), 3);
}

fn set_config_count(mock: &MockHostController) -> usize {
    mock.submissions()
        .iter()
        .filter_map(|s| s.setup())
        .filter(|setup| setup.request == request::SET_CONFIGURATION)
        .count()
}

/// Service with device 1:5 attached and interface 0 claimed
fn attached_service() -> (Arc<MockHostController>, UsbdService) {
    let mock = Arc::new(MockHostController::new());
    mock.add_device(MockDevice::new(1, 5).with_interface(MockDevice::standard_interface(0, 64)));
    let service = UsbdService::new(mock.clone(), ServiceOptions::default());
    service.registry().create_and_attach(DEV).unwrap();
    service.claim_interface(DEV, 0, false).unwrap();
    (mock, service)
}

#[test]
fn test_set_config_twice_switches_once() {
    let (mock, service) = attached_service();

    service.set_config(DEV, 2).unwrap();
    assert_eq!(mock.active_config(DEV), Some(2));
    assert_eq!(set_config_count(&mock), 1);
    // The reopen dropped the claim.
    let device = service.device(DEV).unwrap();
    assert!(device.interface(0).is_none());
    assert!(device.is_open());

    service.set_config(DEV, 2).unwrap();
    assert_eq!(set_config_count(&mock), 1);
}

#[test]
fn test_set_config_unapplied_is_io() {
    let (mock, service) = attached_service();
    mock.ignore_set_config(true);
    assert_eq!(service.set_config(DEV, 2), Err(UsbdError::Io));
    assert_eq!(mock.active_config(DEV), Some(1));
    assert!(service.device(DEV).is_ok());
}

#[test]
fn test_set_config_unreadable_is_invalid_param() {
    let (mock, service) = attached_service();
    mock.script_control(MockResponse::Fail(UsbdError::Io));
    assert_eq!(service.set_config(DEV, 2), Err(UsbdError::InvalidParam));
}

// ============================================================================
// End to End Through the Service
// ============================================================================

#[test]
fn test_write_then_detach_through_service() {
    let mock = Arc::new(MockHostController::new());
    let service = UsbdService::new(mock.clone(), ServiceOptions::default());
    let (bridge, sink) = create_event_bridge();
    service
        .bind_subscriber(Arc::new(ChannelSubscriber::new(sink)))
        .unwrap();

    let device = MockDevice::new(1, 5).with_interface(MockDevice::standard_interface(0, 64));
    let info = device.info();
    mock.add_device(device);
    service.handle_pnp_event(PnpEvent::DeviceAdded(info)).unwrap();
    service.claim_interface(DEV, 0, false).unwrap();

    service
        .bulk_transfer_write(DEV, BULK_OUT, 1000, &[0x5A; 300])
        .unwrap();
    assert_eq!(chunk_lengths(&mock, 0x01), vec![64, 64, 64, 64, 44]);

    service.handle_pnp_event(PnpEvent::DeviceRemoved(info)).unwrap();
    assert_eq!(
        service.bulk_transfer_write(DEV, BULK_OUT, 1000, &[0x5A; 300]),
        Err(UsbdError::NoDevice)
    );
    assert!(!mock.is_open(DEV));

    let actions: Vec<DeviceAction> = std::iter::from_fn(|| bridge.try_recv_event())
        .filter_map(|event| match event {
            UsbdEvent::Device(info) => Some(info.action),
            UsbdEvent::Port(_) => None,
        })
        .collect();
    assert_eq!(actions, vec![DeviceAction::DevUp, DeviceAction::DevDown]);
}

#[test]
fn test_detached_handle_outlives_registry_entry() {
    let mock = Arc::new(MockHostController::new());
    mock.add_device(MockDevice::new(1, 5).with_interface(MockDevice::standard_interface(0, 64)));
    let service = UsbdService::new(mock.clone(), ServiceOptions::default());
    service.registry().create_and_attach(DEV).unwrap();

    let held = service.device(DEV).unwrap();
    service.registry().detach(DEV);

    assert_eq!(service.device(DEV).unwrap_err(), UsbdError::NoDevice);
    assert_eq!(held.id(), DEV);
    assert!(!held.is_open());
}
