//! Conformance scenarios: fixed, named scripts over a [`TransactionEngine`] whose every read is
//! checked against the [`DeviceOracle`].
//!
//! Every scenario starts the same way: bus reset, connect, a settle wait and SOF 1. A scenario
//! either completes or stops at the first failing step.

use crate::bus::BusChannel;
use crate::config::Timing;
use crate::engine::TransactionEngine;
use crate::error::TransactionError;
use crate::oracle::{ConfigurationImage, DeviceOracle};
use crate::session::Session;
use crate::setup::{get_descriptor_request, set_feature_request};
use crate::usb::{UsbDescriptorType, CONFIGURATION_DESCRIPTOR_LEN, DEVICE_DESCRIPTOR_LEN};
use failure::{Error, Fail, ResultExt};
use log::{info, warn};
use usb_device::control::{Recipient, Request};
use usb_device::endpoint::EndpointAddress;

/// Bytes pushed through the bulk loopback.
const LOOPBACK_PAYLOAD: &[u8] = b"ABCD";

/// Whether a scenario runs by default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioStatus {
    Runnable,
    Skipped { reason: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Script {
    ControlSetup,
    ControlTransferIn,
    DeviceDescriptorAtDefaultAddress,
    ControlSetupClearsStall,
    ClearFeatureRecoversBulkEndpoint,
    Enumeration,
    BulkLoopback,
}

#[derive(Clone, Debug)]
pub struct ConformanceScenario {
    pub name: &'static str,
    pub status: ScenarioStatus,
    pub script: Script,
}

/// What every scenario borrows: the shared descriptor model and the time budgets.
#[derive(Clone, Copy, Debug)]
pub struct ScenarioContext<'o> {
    pub oracle: &'o DeviceOracle,
    pub timing: Timing,
}

impl<'o> ScenarioContext<'o> {
    pub fn new(oracle: &'o DeviceOracle) -> Self {
        ScenarioContext {
            oracle,
            timing: Timing::default(),
        }
    }
}

#[derive(Debug, Fail)]
pub enum ScenarioError {
    #[fail(display = "{}", _0)]
    Transaction(#[cause] TransactionError),

    #[fail(display = "descriptor model has no {}", what)]
    Oracle { what: String },
}

#[derive(Debug, Fail)]
#[fail(display = "scenario {} failed at {}: {}", scenario, step, cause)]
pub struct ScenarioFailure {
    pub scenario: &'static str,
    pub step: &'static str,
    #[cause]
    pub cause: ScenarioError,
}

/// A failed step, before the scenario name is attached.
struct Failed {
    step: &'static str,
    cause: ScenarioError,
}

trait StepExt<T> {
    fn at(self, step: &'static str) -> Result<T, Failed>;
}

impl<T> StepExt<T> for Result<T, TransactionError> {
    fn at(self, step: &'static str) -> Result<T, Failed> {
        self.map_err(|e| Failed {
            step,
            cause: ScenarioError::Transaction(e),
        })
    }
}

impl<T> StepExt<T> for Option<T> {
    fn at(self, step: &'static str) -> Result<T, Failed> {
        self.ok_or_else(|| Failed {
            step,
            cause: ScenarioError::Oracle {
                what: step.to_string(),
            },
        })
    }
}

pub fn all_scenarios() -> Vec<ConformanceScenario> {
    let runnable = |name: &'static str, script: Script| ConformanceScenario {
        name,
        status: ScenarioStatus::Runnable,
        script,
    };
    vec![
        runnable("control_setup", Script::ControlSetup),
        runnable("control_transfer_in", Script::ControlTransferIn),
        runnable(
            "device_descriptor_at_default_address",
            Script::DeviceDescriptorAtDefaultAddress,
        ),
        ConformanceScenario {
            name: "control_setup_clears_stall",
            status: ScenarioStatus::Skipped {
                reason: "the reference gateware does not latch ENDPOINT_HALT on endpoint 0",
            },
            script: Script::ControlSetupClearsStall,
        },
        runnable(
            "clear_feature_recovers_bulk_endpoint",
            Script::ClearFeatureRecoversBulkEndpoint,
        ),
        runnable("enumeration", Script::Enumeration),
        runnable("bulk_loopback", Script::BulkLoopback),
    ]
}

pub fn find_scenario(name: &str) -> Option<ConformanceScenario> {
    all_scenarios().into_iter().find(|s| s.name == name)
}

impl ConformanceScenario {
    pub fn is_runnable(&self) -> bool {
        self.status == ScenarioStatus::Runnable
    }

    /// Runs the script against `bus` with a fresh session and returns the final session state.
    pub async fn run<B: BusChannel>(
        &self,
        bus: &mut B,
        context: &ScenarioContext<'_>,
    ) -> Result<Session, ScenarioFailure> {
        info!("scenario {}", self.name);
        let oracle = context.oracle;
        let session = Session::new(oracle.device_descriptor().max_packet_size_0.into());
        let mut engine = TransactionEngine::new(bus, session, context.timing);
        let result = match self.script {
            Script::ControlSetup => control_setup(&mut engine).await,
            Script::ControlTransferIn => control_transfer_in(&mut engine, oracle).await,
            Script::DeviceDescriptorAtDefaultAddress => {
                device_descriptor_at_default_address(&mut engine, oracle).await
            }
            Script::ControlSetupClearsStall => control_setup_clears_stall(&mut engine, oracle).await,
            Script::ClearFeatureRecoversBulkEndpoint => {
                clear_feature_recovers_bulk_endpoint(&mut engine, oracle).await
            }
            Script::Enumeration => enumeration(&mut engine, oracle).await,
            Script::BulkLoopback => bulk_loopback(&mut engine, oracle).await,
        };
        match result {
            Ok(()) => {
                info!("scenario {} passed at {}", self.name, engine.now());
                Ok(engine.into_session())
            }
            Err(Failed { step, cause }) => {
                let failure = ScenarioFailure {
                    scenario: self.name,
                    step,
                    cause,
                };
                warn!("{}", failure);
                Err(failure)
            }
        }
    }
}

async fn attach<B: BusChannel>(engine: &mut TransactionEngine<'_, B>) {
    let timing = *engine.timing();
    engine.reset(timing.port_reset).await;
    engine.connect().await;
    engine.wait(timing.settle).await;
    // SOF right away so the device does not see an idle bus
    engine.send_start_of_frame(1).await;
}

fn first_configuration<'o>(oracle: &'o DeviceOracle) -> Result<&'o ConfigurationImage, Failed> {
    oracle.configuration_at(0).at("configuration descriptor 0")
}

async fn configure<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    configuration: &ConfigurationImage,
) -> Result<(), Failed> {
    engine
        .set_configuration(configuration.value())
        .await
        .at("SET_CONFIGURATION")?;
    engine.declare_endpoints(configuration);
    Ok(())
}

fn halt_request(endpoint: EndpointAddress) -> Request {
    set_feature_request(
        Request::FEATURE_ENDPOINT_HALT,
        Recipient::Endpoint,
        u8::from(endpoint).into(),
    )
}

fn ep0_out() -> EndpointAddress {
    EndpointAddress::from(0)
}

async fn control_setup<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
) -> Result<(), Failed> {
    attach(engine).await;
    engine
        .transaction_setup(0, &halt_request(ep0_out()))
        .await
        .at("SETUP SET_FEATURE(ENDPOINT_HALT)")?;
    let budget = engine.timing().max_packet_time;
    engine.arm_deadline(budget);
    engine
        .transaction_data_in(0, 0, &[])
        .await
        .at("status stage")
}

async fn control_transfer_in<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    const ADDRESS: u8 = 20;
    attach(engine).await;
    engine
        .set_device_address(ADDRESS, true)
        .await
        .at("SET_ADDRESS")?;
    let length = DEVICE_DESCRIPTOR_LEN as u16;
    let request = get_descriptor_request(UsbDescriptorType::Device, 0, 0, length);
    let expected = oracle
        .read(UsbDescriptorType::Device, 0, 0, length)
        .at("device descriptor")?;
    engine
        .control_transfer_in(ADDRESS, &request, expected)
        .await
        .at("GET_DESCRIPTOR(DEVICE)")
}

async fn device_descriptor_at_default_address<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    attach(engine).await;
    let length = DEVICE_DESCRIPTOR_LEN as u16;
    let request = get_descriptor_request(UsbDescriptorType::Device, 0, 0, length);
    engine
        .control_transfer_in(0, &request, oracle.device_bytes())
        .await
        .at("GET_DESCRIPTOR(DEVICE)")
}

async fn control_setup_clears_stall<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    const ADDRESS: u8 = 13;
    attach(engine).await;
    engine
        .set_device_address(ADDRESS, false)
        .await
        .at("SET_ADDRESS")?;
    let configuration = first_configuration(oracle)?;
    configure(engine, configuration).await?;
    let settle = engine.timing().settle;
    engine.wait(settle).await;

    // the control pipe works, twice in a row
    for _ in 0..2 {
        engine
            .get_configuration(configuration.value())
            .await
            .at("GET_CONFIGURATION")?;
    }

    engine
        .transaction_setup(ADDRESS, &halt_request(ep0_out()))
        .await
        .at("SETUP SET_FEATURE(ENDPOINT_HALT)")?;
    let budget = engine.timing().max_packet_time;
    engine.arm_deadline(budget);
    engine
        .transaction_data_in(ADDRESS, 0, &[])
        .await
        .at("status stage")?;

    let window = engine.timing().stall_window;
    engine
        .await_stall(ADDRESS, 0, window)
        .await
        .at("STALL on halted endpoint 0")?;

    // the SETUP of the first fetch clears the halt
    for _ in 0..2 {
        engine
            .get_device_descriptor(oracle.device_bytes())
            .await
            .at("GET_DESCRIPTOR(DEVICE) after halt")?;
    }
    Ok(())
}

async fn clear_feature_recovers_bulk_endpoint<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    const ADDRESS: u8 = 13;
    attach(engine).await;
    engine
        .set_device_address(ADDRESS, false)
        .await
        .at("SET_ADDRESS")?;
    let configuration = first_configuration(oracle)?;
    configure(engine, configuration).await?;
    let (sink, source) = configuration
        .loopback_pair()
        .at("bulk OUT/IN endpoint pair")?;
    let source_number = source.index() as u8;

    engine
        .set_endpoint_halt(source)
        .await
        .at("SET_FEATURE(ENDPOINT_HALT)")?;
    for _ in 0..2 {
        engine
            .expect_stall(ADDRESS, source_number)
            .await
            .at("STALL on halted endpoint")?;
    }
    engine
        .clear_endpoint_halt(source)
        .await
        .at("CLEAR_FEATURE(ENDPOINT_HALT)")?;

    for _ in 0..2 {
        engine
            .get_device_descriptor(oracle.device_bytes())
            .await
            .at("GET_DESCRIPTOR(DEVICE) after recovery")?;
    }

    // both ends restart at DATA0
    engine
        .transaction_data_out(ADDRESS, sink.index() as u8, LOOPBACK_PAYLOAD)
        .await
        .at("bulk OUT after recovery")?;
    engine
        .transaction_data_in(ADDRESS, source_number, LOOPBACK_PAYLOAD)
        .await
        .at("bulk IN after recovery")
}

async fn enumeration<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    const ADDRESS: u8 = 10;
    attach(engine).await;
    engine
        .get_device_descriptor(oracle.device_bytes())
        .await
        .at("GET_DESCRIPTOR(DEVICE)")?;

    engine
        .set_device_address(ADDRESS, true)
        .await
        .at("SET_ADDRESS")?;
    // keep the device awake through the recovery interval
    engine.send_start_of_frame(2).await;

    let configuration = first_configuration(oracle)?;
    let header_len = CONFIGURATION_DESCRIPTOR_LEN as u16;
    let header = oracle
        .read(UsbDescriptorType::Configuration, 0, 0, header_len)
        .at("configuration descriptor header")?;
    engine
        .get_configuration_descriptor(0, header_len, header)
        .await
        .at("GET_DESCRIPTOR(CONFIGURATION) header")?;
    engine
        .get_configuration_descriptor(0, configuration.total_length(), configuration.bytes())
        .await
        .at("GET_DESCRIPTOR(CONFIGURATION) full")?;

    let indices = oracle.device_descriptor().string_indices();
    if !indices.is_empty() {
        let string_zero = oracle.string_zero().at("string descriptor zero")?;
        engine
            .get_string_descriptor(0, 0, string_zero)
            .await
            .at("GET_DESCRIPTOR(STRING 0)")?;
        let lang_id = *oracle.lang_ids().first().at("language ID")?;
        for index in indices {
            let expected = oracle.string(lang_id, index).at("string descriptor")?;
            engine
                .get_string_descriptor(lang_id, index, expected)
                .await
                .at("GET_DESCRIPTOR(STRING)")?;
        }
    }

    configure(engine, configuration).await?;
    engine
        .get_configuration(configuration.value())
        .await
        .at("GET_CONFIGURATION")
}

async fn bulk_loopback<B: BusChannel>(
    engine: &mut TransactionEngine<'_, B>,
    oracle: &DeviceOracle,
) -> Result<(), Failed> {
    const ADDRESS: u8 = 10;
    attach(engine).await;
    engine
        .set_device_address(ADDRESS, false)
        .await
        .at("SET_ADDRESS")?;
    let configuration = first_configuration(oracle)?;
    configure(engine, configuration).await?;
    let (sink, source) = configuration
        .loopback_pair()
        .at("bulk OUT/IN endpoint pair")?;
    engine
        .transaction_data_out(ADDRESS, sink.index() as u8, LOOPBACK_PAYLOAD)
        .await
        .at("bulk OUT")?;
    engine
        .transaction_data_in(ADDRESS, source.index() as u8, LOOPBACK_PAYLOAD)
        .await
        .at("bulk IN")
}

#[derive(Debug)]
pub enum Outcome {
    Passed,
    Failed(ScenarioFailure),
    Skipped { reason: &'static str },
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: &'static str,
    pub outcome: Outcome,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        match self.outcome {
            Outcome::Passed => true,
            _ => false,
        }
    }
}

/// Runs the registry, one fresh bus per scenario.
#[derive(Clone, Debug, Default)]
pub struct ScenarioRunner {
    include_skipped: bool,
}

impl ScenarioRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also run scenarios tagged as skipped.
    pub fn include_skipped(mut self, include_skipped: bool) -> Self {
        self.include_skipped = include_skipped;
        self
    }

    pub async fn run_all<B, F>(
        &self,
        context: &ScenarioContext<'_>,
        mut new_bus: F,
    ) -> Vec<ScenarioOutcome>
    where
        B: BusChannel,
        F: FnMut() -> B,
    {
        let mut outcomes = Vec::new();
        for scenario in all_scenarios() {
            let outcome = match scenario.status {
                ScenarioStatus::Skipped { reason } if !self.include_skipped => {
                    info!("scenario {} skipped: {}", scenario.name, reason);
                    Outcome::Skipped { reason }
                }
                _ => {
                    let mut bus = new_bus();
                    match scenario.run(&mut bus, context).await {
                        Ok(_) => Outcome::Passed,
                        Err(failure) => Outcome::Failed(failure),
                    }
                }
            };
            outcomes.push(ScenarioOutcome {
                name: scenario.name,
                outcome,
            });
        }
        let passed = outcomes.iter().filter(|o| o.passed()).count();
        info!("{} of {} scenarios passed", passed, outcomes.len());
        outcomes
    }

    /// [`run_all`](Self::run_all) on a single-threaded executor.
    pub fn run_blocking<B, F>(
        &self,
        context: &ScenarioContext<'_>,
        new_bus: F,
    ) -> Result<Vec<ScenarioOutcome>, Error>
    where
        B: BusChannel,
        F: FnMut() -> B,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("Can't start the scenario executor")?;
        Ok(runtime.block_on(self.run_all(context, new_bus)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::cdc_loopback_device;
    use crate::sim::SimulatedDevice;

    #[test]
    fn registry_is_complete_and_unique() {
        let scenarios = all_scenarios();
        assert_eq!(scenarios.len(), 7);
        let mut names: Vec<_> = scenarios.iter().map(|s| s.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn stall_clearing_scenario_is_discoverable_but_skipped() {
        let scenario = find_scenario("control_setup_clears_stall").unwrap();
        assert!(!scenario.is_runnable());
        match scenario.status {
            ScenarioStatus::Skipped { reason } => assert!(reason.contains("ENDPOINT_HALT")),
            ScenarioStatus::Runnable => panic!("expected a skipped scenario"),
        }
        assert!(find_scenario("no_such_scenario").is_none());
    }

    #[test]
    fn runner_skips_tagged_scenarios_by_default() {
        let oracle = cdc_loopback_device().unwrap();
        let context = ScenarioContext::new(&oracle);
        let outcomes = ScenarioRunner::new()
            .run_blocking(&context, || SimulatedDevice::new(oracle.clone()))
            .unwrap();
        assert_eq!(outcomes.len(), 7);
        for outcome in &outcomes {
            match &outcome.outcome {
                Outcome::Passed => {}
                Outcome::Skipped { .. } => assert_eq!(outcome.name, "control_setup_clears_stall"),
                Outcome::Failed(failure) => panic!("{}", failure),
            }
        }
    }

    #[test]
    fn skipped_scenarios_can_be_enabled() {
        let oracle = cdc_loopback_device().unwrap();
        let context = ScenarioContext::new(&oracle);
        let outcomes = ScenarioRunner::new()
            .include_skipped(true)
            .run_blocking(&context, || SimulatedDevice::new(oracle.clone()))
            .unwrap();
        assert!(outcomes.iter().all(ScenarioOutcome::passed));
    }
}
