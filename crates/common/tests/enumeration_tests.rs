//! Endpoint enumeration integration tests
//!
//! Runs `query_endpoints` against simulated interfaces.
//!
//! # Test Scenarios
//! - Pairing of bulk IN/OUT pipes into logical endpoints
//! - Fail-fast on unsupported transfer types and directions
//! - Propagation of platform errors
//! - Truncation beyond the endpoint table
//!
//! Run with: `cargo test -p common --test enumeration_tests`

use common::test_utils::SimulatedInterface;
use pipe::{MAX_ENDPOINTS, PipeDirection, PipeError, PipeProps, PipeType, query_endpoints};

// ============================================================================
// Pairing
// ============================================================================

#[test]
fn test_two_channel_adapter() {
    let interface = SimulatedInterface::can_adapter_two_channels();
    let endpoints = query_endpoints(&interface).unwrap();

    assert_eq!(endpoints.num_endpoints(), 3);

    let first = endpoints.endpoint(1).unwrap();
    assert_eq!(
        first.pipe_in,
        PipeProps {
            pipe_ref: 1,
            packet_size: 64
        }
    );
    assert_eq!(
        first.pipe_out,
        PipeProps {
            pipe_ref: 2,
            packet_size: 64
        }
    );

    assert_eq!(endpoints.pipe_ref_in(2), 3);
    assert_eq!(endpoints.packet_size_in(2), 512);
    assert_eq!(endpoints.pipe_ref_out(2), 4);
    assert_eq!(endpoints.packet_size_out(2), 512);

    for number in 3..=MAX_ENDPOINTS {
        assert_eq!(endpoints.pipe_ref_in(number), 0);
        assert_eq!(endpoints.pipe_ref_out(number), 0);
    }

    let numbers: Vec<u8> = endpoints.iter().map(|(n, _)| n).collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[test]
fn test_no_pipes() {
    let interface = SimulatedInterface::new();
    let endpoints = query_endpoints(&interface).unwrap();

    assert_eq!(endpoints.num_endpoints(), 1);
    assert_eq!(endpoints.iter().count(), 0);
}

#[test]
fn test_odd_pipe_count() {
    let interface = SimulatedInterface::new()
        .with_bulk_pair(64)
        .with_pipe(PipeType::Bulk, PipeDirection::In, 64);
    let endpoints = query_endpoints(&interface).unwrap();

    assert_eq!(endpoints.num_endpoints(), 2);
    assert_eq!(endpoints.pipe_ref_in(2), 3);
    assert_eq!(endpoints.pipe_ref_out(2), 0);
    assert_eq!(endpoints.packet_size_out(2), 0);
}

#[test]
fn test_pair_order_does_not_matter() {
    let interface = SimulatedInterface::new()
        .with_pipe(PipeType::Bulk, PipeDirection::Out, 32)
        .with_pipe(PipeType::Bulk, PipeDirection::In, 64);
    let endpoints = query_endpoints(&interface).unwrap();

    assert_eq!(endpoints.pipe_ref_out(1), 1);
    assert_eq!(endpoints.packet_size_out(1), 32);
    assert_eq!(endpoints.pipe_ref_in(1), 2);
    assert_eq!(endpoints.packet_size_in(1), 64);
}

#[test]
fn test_same_direction_twice_keeps_last() {
    let interface = SimulatedInterface::new()
        .with_pipe(PipeType::Bulk, PipeDirection::In, 64)
        .with_pipe(PipeType::Bulk, PipeDirection::In, 128);
    let endpoints = query_endpoints(&interface).unwrap();

    assert_eq!(endpoints.pipe_ref_in(1), 2);
    assert_eq!(endpoints.packet_size_in(1), 128);
    assert_eq!(endpoints.pipe_ref_out(1), 0);
}

#[test]
fn test_pipes_beyond_table_are_ignored() {
    let mut interface = SimulatedInterface::new();
    for _ in 0..10 {
        interface = interface.with_bulk_pair(64);
    }
    let endpoints = query_endpoints(&interface).unwrap();

    // The count reflects every pipe, the table only the first eight pairs
    assert_eq!(endpoints.num_endpoints(), 11);
    assert_eq!(endpoints.pipe_ref_in(MAX_ENDPOINTS), 15);
    assert_eq!(endpoints.pipe_ref_out(MAX_ENDPOINTS), 16);
    assert_eq!(endpoints.iter().count(), MAX_ENDPOINTS as usize);
    assert!(endpoints.endpoint(MAX_ENDPOINTS + 1).is_none());
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_interrupt_pipe_not_supported() {
    let interface = SimulatedInterface::new()
        .with_bulk_pair(64)
        .with_pipe(PipeType::Interrupt, PipeDirection::In, 8);

    let err = query_endpoints(&interface).unwrap_err();
    assert!(matches!(err, PipeError::NotSupported(_)));
    assert_eq!(err.code(), -98);
}

#[test]
fn test_undefined_direction_is_illegal() {
    let interface =
        SimulatedInterface::new().with_pipe(PipeType::Bulk, PipeDirection::None, 64);

    let err = query_endpoints(&interface).unwrap_err();
    assert!(matches!(err, PipeError::IllegalParameter(_)));
    assert_eq!(err.code(), -93);
}

#[test]
fn test_pipe_count_error_propagated() {
    let interface =
        SimulatedInterface::can_adapter_two_channels().fail_num_pipes(rusb::Error::NoDevice);

    let err = query_endpoints(&interface).unwrap_err();
    assert!(matches!(err, PipeError::Usb(rusb::Error::NoDevice)));
}

#[test]
fn test_pipe_query_error_propagated() {
    let interface =
        SimulatedInterface::can_adapter_two_channels().fail_pipe_queries(3, rusb::Error::Io);

    let err = query_endpoints(&interface).unwrap_err();
    assert!(matches!(err, PipeError::Usb(rusb::Error::Io)));
}
