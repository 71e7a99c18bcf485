mod util;

use usb_conformance::error::{TransactionError, Violation};
use usb_conformance::scenario::{all_scenarios, ScenarioError, ScenarioFailure};
use usb_conformance::session::DeviceState;
use usb_conformance::sim::SimFaults;
use util::{device, faulty_device, oracle, run_scenario};

fn transaction_error(failure: ScenarioFailure) -> TransactionError {
    match failure.cause {
        ScenarioError::Transaction(e) => e,
        other => panic!("expected a transaction failure, got {}", other),
    }
}

#[tokio::test]
async fn every_runnable_scenario_passes() {
    let oracle = oracle();
    for scenario in all_scenarios().iter().filter(|s| s.is_runnable()) {
        let mut device = device(&oracle);
        if let Err(failure) = run_scenario(scenario.name, &oracle, &mut device).await {
            panic!("{}", failure);
        }
    }
}

#[tokio::test]
async fn device_descriptor_at_default_address() {
    let oracle = oracle();
    let mut device = device(&oracle);
    let session = run_scenario("device_descriptor_at_default_address", &oracle, &mut device)
        .await
        .unwrap();
    assert_eq!(session.address(), 0);
    assert_eq!(session.state(), DeviceState::Reset);
}

#[tokio::test]
async fn control_transfer_in_uses_the_assigned_address() {
    let oracle = oracle();
    let mut device = device(&oracle);
    let session = run_scenario("control_transfer_in", &oracle, &mut device)
        .await
        .unwrap();
    assert_eq!(session.address(), 20);
    assert_eq!(device.address(), 20);
}

#[tokio::test]
async fn control_setup_halts_endpoint_zero_until_next_setup() {
    let oracle = oracle();
    let mut device = device(&oracle);
    let session = run_scenario("control_setup", &oracle, &mut device)
        .await
        .unwrap();
    assert_eq!(session.endpoints().halted().count(), 2);
    assert!(device.is_halted(usb_conformance::EndpointAddress::from(0x80)));
}

#[tokio::test]
async fn enumeration_ends_configured() {
    let oracle = oracle();
    let mut device = device(&oracle);
    let session = run_scenario("enumeration", &oracle, &mut device)
        .await
        .unwrap();
    assert_eq!(
        session.state(),
        DeviceState::Configured {
            address: 10,
            configuration: 1
        }
    );
    assert_eq!(device.configuration(), 1);
    assert!(!device.is_suspended());
}

#[tokio::test]
async fn bulk_loopback_round_trips() {
    let oracle = oracle();
    let mut device = device(&oracle);
    run_scenario("bulk_loopback", &oracle, &mut device)
        .await
        .unwrap();
}

#[tokio::test]
async fn stall_clearing_passes_against_a_conforming_device() {
    let oracle = oracle();
    let mut device = device(&oracle);
    run_scenario("control_setup_clears_stall", &oracle, &mut device)
        .await
        .unwrap();
}

#[tokio::test]
async fn unlatched_halt_fails_the_stall_scenarios() {
    let oracle = oracle();
    let faults = SimFaults {
        ignore_endpoint_halt: true,
        ..Default::default()
    };

    let mut device = faulty_device(&oracle, faults.clone());
    let failure = run_scenario("control_setup_clears_stall", &oracle, &mut device)
        .await
        .unwrap_err();
    assert_eq!(failure.step, "STALL on halted endpoint 0");
    match transaction_error(failure) {
        TransactionError::Timeout { waiting_for, .. } => assert_eq!(waiting_for, "STALL"),
        other => panic!("unexpected {:?}", other),
    }

    let mut device = faulty_device(&oracle, faults);
    let failure = run_scenario("clear_feature_recovers_bulk_endpoint", &oracle, &mut device)
        .await
        .unwrap_err();
    assert_eq!(failure.step, "STALL on halted endpoint");
    match transaction_error(failure) {
        TransactionError::UnexpectedHandshake { received, .. } => {
            assert_eq!(received, usb_conformance::packet::Pid::Nak)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn corrupted_descriptor_reports_first_divergence() {
    let oracle = oracle();
    let mut device = faulty_device(
        &oracle,
        SimFaults {
            corrupt_descriptor_byte: Some(4),
            ..Default::default()
        },
    );
    let failure = run_scenario("device_descriptor_at_default_address", &oracle, &mut device)
        .await
        .unwrap_err();
    assert_eq!(failure.scenario, "device_descriptor_at_default_address");
    match transaction_error(failure) {
        TransactionError::DataMismatch { offset, .. } => assert_eq!(offset, 4),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn truncated_descriptor_is_a_short_read() {
    let oracle = oracle();
    let mut device = faulty_device(
        &oracle,
        SimFaults {
            truncate_descriptors: 2,
            ..Default::default()
        },
    );
    let failure = run_scenario("control_transfer_in", &oracle, &mut device)
        .await
        .unwrap_err();
    match transaction_error(failure) {
        TransactionError::ShortRead { expected, received } => {
            assert_eq!((expected, received), (18, 16))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn repeated_toggle_breaks_multi_packet_reads() {
    let oracle = oracle();
    let mut device = faulty_device(
        &oracle,
        SimFaults {
            repeat_data_toggle: true,
            ..Default::default()
        },
    );
    let failure = run_scenario("enumeration", &oracle, &mut device)
        .await
        .unwrap_err();
    assert_eq!(failure.step, "GET_DESCRIPTOR(CONFIGURATION) full");
    match transaction_error(failure) {
        TransactionError::ProtocolViolation(Violation::DataToggle { endpoint, .. }) => {
            assert_eq!(endpoint, 0)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn a_few_naks_are_tolerated() {
    let oracle = oracle();
    let faults = SimFaults {
        nak_before_data: 3,
        ..Default::default()
    };
    for scenario in all_scenarios().iter().filter(|s| s.is_runnable()) {
        let mut device = faulty_device(&oracle, faults.clone());
        if let Err(failure) = run_scenario(scenario.name, &oracle, &mut device).await {
            panic!("{}", failure);
        }
    }
}

#[tokio::test]
async fn endless_naks_time_out() {
    let oracle = oracle();
    let mut device = faulty_device(
        &oracle,
        SimFaults {
            nak_before_data: u32::max_value(),
            ..Default::default()
        },
    );
    let failure = run_scenario("device_descriptor_at_default_address", &oracle, &mut device)
        .await
        .unwrap_err();
    match transaction_error(failure) {
        TransactionError::Timeout {
            waiting_for,
            endpoint,
            ..
        } => assert_eq!((waiting_for, endpoint), ("IN data", 0)),
        other => panic!("unexpected {:?}", other),
    }
}
