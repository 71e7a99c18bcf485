//! Per-scenario mutable state: device address, configuration, packet deadline, endpoint
//! halt table and control pipe stage.

use crate::bus::SimTime;
use crate::endpoint::{Endpoint, EndpointTable};
use crate::error::Violation;
use std::time::Duration;
use log::{debug, info};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Host view of the device state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Unattached,
    Reset,
    Addressed(u8),
    Configured { address: u8, configuration: u8 },
}

/// Where the endpoint 0 control pipe stands between phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    Idle,
    DataIn { remaining: u16 },
    DataOut { remaining: u16 },
    /// Device-to-host zero-length status (after a no-data or OUT transfer).
    StatusIn,
    /// Host-to-device zero-length status (after an IN transfer).
    StatusOut,
}

#[derive(Clone, Debug)]
pub struct Session {
    state: DeviceState,
    max_packet_size: u16,
    packet_deadline: SimTime,
    armed_deadline: Option<SimTime>,
    endpoints: EndpointTable,
    control: ControlStage,
    pending_request: Option<Request>,
}

impl Session {
    /// A fresh session: unattached, address 0, `max_packet_size` for endpoint 0.
    pub fn new(max_packet_size: u16) -> Self {
        Session {
            state: DeviceState::Unattached,
            max_packet_size,
            packet_deadline: SimTime::ZERO,
            armed_deadline: None,
            endpoints: EndpointTable::new(),
            control: ControlStage::Idle,
            pending_request: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Address used for transactions; 0 until SET_ADDRESS completes.
    pub fn address(&self) -> u8 {
        match self.state {
            DeviceState::Addressed(address) | DeviceState::Configured { address, .. } => address,
            DeviceState::Unattached | DeviceState::Reset => 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configuration().is_some()
    }

    pub fn configuration(&self) -> Option<u8> {
        match self.state {
            DeviceState::Configured { configuration, .. } => Some(configuration),
            _ => None,
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn set_max_packet_size(&mut self, max_packet_size: u16) {
        self.max_packet_size = max_packet_size;
    }

    /// Packet size limit of an endpoint: its declared size, or endpoint 0's.
    pub fn packet_size_for(&self, address: EndpointAddress) -> u16 {
        if address.index() == 0 {
            return self.max_packet_size;
        }
        self.endpoints
            .get(address)
            .max_packet_size()
            .unwrap_or(self.max_packet_size)
    }

    /// Deadline of the packet exchange in progress (or the last one).
    pub fn packet_deadline(&self) -> SimTime {
        self.packet_deadline
    }

    /// Overrides the deadline of the next packet exchange only.
    pub fn arm_deadline(&mut self, deadline: SimTime) {
        self.armed_deadline = Some(deadline);
    }

    /// Starts a packet exchange at `now`, consuming a caller-armed deadline if present.
    pub(crate) fn start_packet(&mut self, now: SimTime, budget: Duration) -> SimTime {
        self.packet_deadline = self.armed_deadline.take().unwrap_or(now + budget);
        self.packet_deadline
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn endpoint(&self, address: EndpointAddress) -> &Endpoint {
        self.endpoints.get(address)
    }

    pub(crate) fn endpoints_mut(&mut self) -> &mut EndpointTable {
        &mut self.endpoints
    }

    pub fn control_stage(&self) -> ControlStage {
        self.control
    }

    pub(crate) fn on_reset(&mut self) {
        self.state = DeviceState::Reset;
        self.endpoints.reset_all();
        self.control = ControlStage::Idle;
        self.pending_request = None;
        self.armed_deadline = None;
    }

    pub(crate) fn on_address_assigned(&mut self, address: u8) {
        info!("device address is now {}", address);
        self.state = if address == 0 {
            DeviceState::Reset
        } else {
            DeviceState::Addressed(address)
        };
    }

    pub(crate) fn on_configured(&mut self, configuration: u8) {
        let address = self.address();
        self.state = if configuration == 0 {
            DeviceState::Addressed(address)
        } else {
            DeviceState::Configured {
                address,
                configuration,
            }
        };
        self.endpoints.reset_all();
    }

    pub(crate) fn check_setup_allowed(&self) -> Result<(), Violation> {
        if self.control != ControlStage::Idle {
            return Err(Violation::SetupMidTransaction);
        }
        Ok(())
    }

    /// Records an acknowledged SETUP.
    pub(crate) fn begin_control(&mut self, request: &Request) -> Result<(), Violation> {
        self.check_setup_allowed()?;
        self.pending_request = Some(*request);
        self.control = match (request.length, request.direction) {
            (0, _) => ControlStage::StatusIn,
            (remaining, UsbDirection::In) => ControlStage::DataIn { remaining },
            (remaining, UsbDirection::Out) => ControlStage::DataOut { remaining },
        };
        self.endpoints.setup_received();
        Ok(())
    }

    /// Bytes an IN phase on endpoint 0 may carry at this stage.
    pub(crate) fn control_in_allowance(&self) -> Result<u16, Violation> {
        match self.control {
            ControlStage::DataIn { remaining } => Ok(remaining),
            ControlStage::StatusIn => Ok(0),
            ControlStage::DataOut { remaining } => {
                Err(Violation::StatusBeforeDataComplete { remaining })
            }
            ControlStage::StatusOut => Err(Violation::OutOfOrder {
                expected: "OUT status",
            }),
            ControlStage::Idle => Err(Violation::NoControlTransfer { endpoint: 0 }),
        }
    }

    pub(crate) fn control_in_done(&mut self, received: usize, ended_short: bool) {
        self.control = match self.control {
            ControlStage::DataIn { remaining } => {
                let remaining = remaining.saturating_sub(received as u16);
                if remaining == 0 || ended_short {
                    ControlStage::StatusOut
                } else {
                    ControlStage::DataIn { remaining }
                }
            }
            _ => return self.finish_control(),
        };
    }

    /// Bytes an OUT phase on endpoint 0 may carry at this stage.
    pub(crate) fn control_out_allowance(&self) -> Result<u16, Violation> {
        match self.control {
            ControlStage::DataOut { remaining } => Ok(remaining),
            ControlStage::StatusOut => Ok(0),
            ControlStage::DataIn { remaining } => {
                Err(Violation::StatusBeforeDataComplete { remaining })
            }
            ControlStage::StatusIn => Err(Violation::OutOfOrder {
                expected: "IN status",
            }),
            ControlStage::Idle => Err(Violation::NoControlTransfer { endpoint: 0 }),
        }
    }

    pub(crate) fn control_out_done(&mut self, sent: usize) {
        self.control = match self.control {
            ControlStage::DataOut { remaining } => {
                let remaining = remaining.saturating_sub(sent as u16);
                if remaining == 0 {
                    ControlStage::StatusIn
                } else {
                    ControlStage::DataOut { remaining }
                }
            }
            _ => return self.finish_control(),
        };
    }

    /// Status stage done: the device has accepted the request, so its standard side effects
    /// now apply on the host side as well.
    fn finish_control(&mut self) {
        self.control = ControlStage::Idle;
        let request = match self.pending_request.take() {
            Some(request) => request,
            None => return,
        };
        if request.request_type != RequestType::Standard {
            return;
        }
        let halt = request.value == Request::FEATURE_ENDPOINT_HALT;
        match (request.recipient, request.request) {
            (Recipient::Device, Request::SET_ADDRESS) => {
                self.on_address_assigned((request.value & 0x7f) as u8)
            }
            (Recipient::Device, Request::SET_CONFIGURATION) => {
                self.on_configured(request.value as u8)
            }
            (Recipient::Endpoint, Request::SET_FEATURE) if halt => {
                let endpoint = EndpointAddress::from(request.index as u8);
                debug!("endpoint {:#04x} halted", request.index as u8);
                self.endpoints.halt(endpoint);
            }
            (Recipient::Endpoint, Request::CLEAR_FEATURE) if halt => {
                let endpoint = EndpointAddress::from(request.index as u8);
                debug!("endpoint {:#04x} halt cleared", request.index as u8);
                self.endpoints.clear_halt(endpoint);
            }
            _ => {}
        }
    }
}
