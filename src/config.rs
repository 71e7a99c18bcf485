//! Harness configuration: where the descriptor file lives and the simulated-time budgets.

use crate::oracle::DeviceOracle;
use failure::{format_err, Error, Fail, ResultExt};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the descriptor file of the device under test.
pub const TARGET_CONFIG_VAR: &str = "TARGET_CONFIG";
pub const MAX_PACKET_TIME_VAR: &str = "USB_MAX_PACKET_TIME_US";
pub const STALL_WINDOW_VAR: &str = "USB_STALL_WINDOW_US";

/// Simulated-time budgets used by the engine and the scenario scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Retry budget of one token/handshake exchange.
    pub max_packet_time: Duration,
    /// Settle window the device gets after SET_ADDRESS.
    pub set_address_recovery: Duration,
    /// Length of the SE0 reset pulse. Accelerated for simulation.
    pub port_reset: Duration,
    /// Bus idle after reset and after connect.
    pub settle: Duration,
    /// How long a halted endpoint may take before it has to answer STALL.
    pub stall_window: Duration,
    /// Nominal full-speed frame period.
    pub sof_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            max_packet_time: Duration::from_micros(100),
            set_address_recovery: Duration::from_millis(2),
            port_reset: Duration::from_micros(10),
            settle: Duration::from_micros(10),
            stall_window: Duration::from_millis(1),
            sof_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub descriptor_path: PathBuf,
    pub timing: Timing,
}

fn micros_var(name: &str) -> Result<Option<Duration>, Error> {
    match env::var(name) {
        Ok(value) => {
            let micros = value
                .trim()
                .parse::<u64>()
                .with_context(|_| format!("{} must be a whole number of microseconds", name))?;
            Ok(Some(Duration::from_micros(micros)))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.context(format!("Can't read {}", name)).into()),
    }
}

impl HarnessConfig {
    pub fn new(descriptor_path: impl Into<PathBuf>) -> Self {
        HarnessConfig {
            descriptor_path: descriptor_path.into(),
            timing: Timing::default(),
        }
    }

    /// Reads `TARGET_CONFIG` plus the optional timing overrides.
    pub fn from_env() -> Result<Self, Error> {
        let path = env::var_os(TARGET_CONFIG_VAR)
            .ok_or_else(|| format_err!("{} is not set", TARGET_CONFIG_VAR))?;
        let mut config = HarnessConfig::new(path);
        if let Some(budget) = micros_var(MAX_PACKET_TIME_VAR)? {
            config.timing.max_packet_time = budget;
        }
        if let Some(window) = micros_var(STALL_WINDOW_VAR)? {
            config.timing.stall_window = window;
        }
        Ok(config)
    }

    pub fn load_oracle(&self) -> Result<DeviceOracle, Error> {
        DeviceOracle::load(&self.descriptor_path)
    }
}
