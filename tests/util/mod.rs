#![allow(dead_code)]

use usb_conformance::bus::BusChannel;
use usb_conformance::cdc::cdc_loopback_device;
use usb_conformance::config::Timing;
use usb_conformance::engine::TransactionEngine;
use usb_conformance::oracle::DeviceOracle;
use usb_conformance::scenario::{find_scenario, ScenarioContext, ScenarioFailure};
use usb_conformance::session::Session;
use usb_conformance::sim::{SimFaults, SimulatedDevice};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn oracle() -> DeviceOracle {
    init_logger();
    cdc_loopback_device().unwrap()
}

pub fn device(oracle: &DeviceOracle) -> SimulatedDevice {
    SimulatedDevice::new(oracle.clone())
}

pub fn faulty_device(oracle: &DeviceOracle, faults: SimFaults) -> SimulatedDevice {
    SimulatedDevice::with_faults(oracle.clone(), faults)
}

pub async fn run_scenario(
    name: &str,
    oracle: &DeviceOracle,
    device: &mut SimulatedDevice,
) -> Result<Session, ScenarioFailure> {
    let scenario = find_scenario(name).unwrap();
    scenario.run(device, &ScenarioContext::new(oracle)).await
}

pub fn engine<'b, B: BusChannel>(bus: &'b mut B, oracle: &DeviceOracle) -> TransactionEngine<'b, B> {
    let session = Session::new(oracle.device_descriptor().max_packet_size_0.into());
    TransactionEngine::new(bus, session, Timing::default())
}

/// Reset, connect, settle and SOF 1, like every scenario.
pub async fn attach<B: BusChannel>(engine: &mut TransactionEngine<'_, B>) {
    let timing = *engine.timing();
    engine.reset(timing.port_reset).await;
    engine.connect().await;
    engine.wait(timing.settle).await;
    engine.send_start_of_frame(1).await;
}
