mod util;

use std::env;
use std::fs;
use std::time::Duration;
use usb_conformance::config::{
    HarnessConfig, MAX_PACKET_TIME_VAR, STALL_WINDOW_VAR, TARGET_CONFIG_VAR,
};
use usb_conformance::oracle::DeviceOracle;
use usb_conformance::scenario::{ScenarioContext, ScenarioRunner};
use usb_conformance::sim::SimulatedDevice;
use util::oracle;

// Everything that touches the process environment lives in this one test.
#[test]
fn descriptor_file_from_environment_drives_the_runner() {
    let reference = oracle();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fomu-cdc.bin");
    fs::write(&path, reference.to_blob()).unwrap();

    env::remove_var(TARGET_CONFIG_VAR);
    assert!(HarnessConfig::from_env().is_err());

    env::set_var(TARGET_CONFIG_VAR, &path);
    env::set_var(MAX_PACKET_TIME_VAR, "250");
    env::set_var(STALL_WINDOW_VAR, "2000");
    let config = HarnessConfig::from_env().unwrap();
    assert_eq!(config.descriptor_path, path);
    assert_eq!(config.timing.max_packet_time, Duration::from_micros(250));
    assert_eq!(config.timing.stall_window, Duration::from_millis(2));

    let loaded = config.load_oracle().unwrap();
    assert_eq!(loaded.to_blob(), reference.to_blob());
    assert_eq!(loaded.device_descriptor(), reference.device_descriptor());

    let context = ScenarioContext {
        oracle: &loaded,
        timing: config.timing,
    };
    let outcomes = ScenarioRunner::new()
        .run_blocking(&context, || SimulatedDevice::new(loaded.clone()))
        .unwrap();
    for outcome in &outcomes {
        assert!(
            outcome.passed() || outcome.name == "control_setup_clears_stall",
            "{:?}",
            outcome
        );
    }

    env::set_var(MAX_PACKET_TIME_VAR, "soon");
    let err = HarnessConfig::from_env().unwrap_err();
    assert!(err.to_string().contains(MAX_PACKET_TIME_VAR));

    env::remove_var(MAX_PACKET_TIME_VAR);
    env::remove_var(STALL_WINDOW_VAR);
    env::remove_var(TARGET_CONFIG_VAR);
}

#[test]
fn corrupt_descriptor_file_is_rejected() {
    let reference = oracle();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.bin");

    let mut blob = reference.to_blob();
    // wTotalLength of the first configuration now overruns the file
    blob[18 + 2] = 0xff;
    fs::write(&path, &blob).unwrap();
    let err = DeviceOracle::load(&path).unwrap_err();
    assert!(err.to_string().contains("broken.bin"));

    fs::write(&path, &blob[..10]).unwrap();
    assert!(DeviceOracle::load(&path).is_err());
}
