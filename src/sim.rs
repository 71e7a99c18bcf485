//! A simulated full-speed device on the other end of a [`BusChannel`].
//!
//! The device answers from its own copy of a descriptor tree, keeps its own endpoint halt and
//! data toggle state, and charges every packet the time it would take on a 12 Mbit/s bus.
//! Bulk data written to the OUT endpoint of a data interface comes back on the IN endpoint of
//! the same interface. [`SimFaults`] makes it misbehave in controlled ways.

use crate::bus::{BusChannel, SimTime};
use crate::compare::Hex;
use crate::endpoint::EndpointTable;
use crate::oracle::DeviceOracle;
use crate::packet::{Packet, Pid};
use crate::setup::{decode_request, request_name};
use crate::usb::UsbDescriptorType;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::mem;
use std::time::Duration;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// SYNC, PID, address and endpoint, CRC5, EOP
const TOKEN_BITS: u64 = 35;
const HANDSHAKE_BITS: u64 = 19;
/// How long the host listens for a response before giving up on it.
const RESPONSE_TIMEOUT_BITS: u64 = 18;
const CONNECT_TIME: Duration = Duration::from_micros(1);
/// A device suspends after this much bus idle.
pub const SUSPEND_AFTER: Duration = Duration::from_millis(3);
const LOOPBACK_CAPACITY: usize = 512;

/// Full-speed bit time is 1/12 µs.
fn bus_time(bits: u64) -> Duration {
    Duration::from_nanos(bits * 250 / 3)
}

fn data_bits(length: usize) -> u64 {
    // SYNC, PID, payload, CRC16, EOP
    35 + 8 * length as u64
}

fn packet_bits(packet: &Packet) -> u64 {
    match &packet.data {
        Some(data) => data_bits(data.len()),
        None => HANDSHAKE_BITS,
    }
}

/// Deliberate deviations from correct device behavior.
#[derive(Clone, Debug, Default)]
pub struct SimFaults {
    /// SET_FEATURE(ENDPOINT_HALT) is acknowledged but never latched.
    pub ignore_endpoint_halt: bool,
    /// Answer NAK this many times before every IN data packet.
    pub nak_before_data: u32,
    /// Invert the byte at this offset of every descriptor returned.
    pub corrupt_descriptor_byte: Option<usize>,
    /// Never advance the IN data toggle.
    pub repeat_data_toggle: bool,
    /// Drop this many bytes from the tail of every descriptor returned.
    pub truncate_descriptors: usize,
}

/// What a control request does once its status stage completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effect {
    SetAddress(u8),
    SetConfiguration(u8),
    SetHalt(EndpointAddress),
    ClearHalt(EndpointAddress),
}

#[derive(Clone, Debug)]
enum ControlPipe {
    Idle,
    DataIn {
        reply: Vec<u8>,
        sent: usize,
        /// The reply is shorter than wLength and a multiple of the packet size.
        zlp: bool,
    },
    StatusOut,
    StatusIn(Effect),
    /// Request error: STALL until the next SETUP.
    Stalled,
}

#[derive(Clone, Copy, Debug)]
enum Token {
    None,
    Ignored,
    Setup,
    Out(u8),
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    endpoint: u8,
    length: usize,
}

pub struct SimulatedDevice {
    now: SimTime,
    descriptors: DeviceOracle,
    faults: SimFaults,
    connected: bool,
    suspended: bool,
    last_activity: SimTime,
    frame_number: u16,
    address: u8,
    configuration: u8,
    endpoints: EndpointTable,
    control: ControlPipe,
    token: Token,
    response: Option<Packet>,
    in_flight: Option<InFlight>,
    loopback: Option<(EndpointAddress, EndpointAddress)>,
    fifo: VecDeque<u8>,
    naks_sent: u32,
}

impl SimulatedDevice {
    pub fn new(descriptors: DeviceOracle) -> Self {
        Self::with_faults(descriptors, SimFaults::default())
    }

    pub fn with_faults(descriptors: DeviceOracle, faults: SimFaults) -> Self {
        SimulatedDevice {
            now: SimTime::ZERO,
            descriptors,
            faults,
            connected: false,
            suspended: false,
            last_activity: SimTime::ZERO,
            frame_number: 0,
            address: 0,
            configuration: 0,
            endpoints: EndpointTable::new(),
            control: ControlPipe::Idle,
            token: Token::None,
            response: None,
            in_flight: None,
            loopback: None,
            fifo: VecDeque::new(),
            naks_sent: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    pub fn is_halted(&self, endpoint: EndpointAddress) -> bool {
        self.endpoints.get(endpoint).is_halted()
    }

    fn elapse(&mut self, bits: u64) {
        self.now += bus_time(bits);
    }

    /// Marks bus activity, entering suspend first if the bus sat idle for too long.
    fn bus_activity(&mut self) {
        if self.connected && !self.suspended && self.now - self.last_activity >= SUSPEND_AFTER {
            info!(
                "device suspended: bus idle since {}",
                self.last_activity
            );
            self.suspended = true;
        }
        self.last_activity = self.now;
    }

    fn max_packet_size_0(&self) -> usize {
        usize::from(self.descriptors.device_descriptor().max_packet_size_0).max(1)
    }

    fn max_packet_size(&self, endpoint: EndpointAddress) -> usize {
        if endpoint.index() == 0 {
            return self.max_packet_size_0();
        }
        let size = self.endpoints.get(endpoint).max_packet_size().unwrap_or(64);
        usize::from(size).max(1)
    }

    /// Endpoint 0 always; others only when the active configuration declares them.
    fn endpoint_active(&self, endpoint: EndpointAddress) -> bool {
        if endpoint.index() == 0 {
            return true;
        }
        self.configuration != 0
            && self
                .descriptors
                .configuration(self.configuration)
                .map_or(false, |config| config.endpoints().any(|ep| ep.address == endpoint))
    }

    fn reset_device(&mut self) {
        self.address = 0;
        self.configuration = 0;
        self.endpoints = EndpointTable::new();
        self.control = ControlPipe::Idle;
        self.token = Token::None;
        self.response = None;
        self.in_flight = None;
        self.loopback = None;
        self.fifo.clear();
        self.naks_sent = 0;
        self.suspended = false;
        self.last_activity = self.now;
    }

    fn configure(&mut self, value: u8) {
        self.configuration = value;
        self.endpoints = EndpointTable::new();
        self.loopback = None;
        self.fifo.clear();
        if let Some(config) = self.descriptors.configuration(value) {
            for endpoint in config.endpoints() {
                self.endpoints.declare(endpoint);
            }
            self.loopback = config.loopback_pair();
        }
        info!("device configuration is now {}", value);
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::SetAddress(address) => {
                info!("device takes address {}", address);
                self.address = address;
            }
            Effect::SetConfiguration(value) => self.configure(value),
            Effect::SetHalt(endpoint) => {
                if self.faults.ignore_endpoint_halt {
                    warn!(
                        "endpoint {:#04x} halt acknowledged but not latched",
                        u8::from(endpoint)
                    );
                } else {
                    self.endpoints.halt(endpoint);
                }
            }
            Effect::ClearHalt(endpoint) => self.endpoints.clear_halt(endpoint),
        }
    }

    fn descriptor_reply(&self, request: &Request) -> Option<Vec<u8>> {
        let kind = UsbDescriptorType::from_u8((request.value >> 8) as u8)?;
        let index = request.value as u8;
        let mut reply = self.descriptors.descriptor(kind, index, request.index)?.to_vec();
        if let Some(offset) = self.faults.corrupt_descriptor_byte {
            if let Some(byte) = reply.get_mut(offset) {
                *byte = !*byte;
            }
        }
        let keep = reply.len().saturating_sub(self.faults.truncate_descriptors);
        reply.truncate(keep);
        Some(reply)
    }

    fn data_in(&self, mut reply: Vec<u8>, w_length: u16) -> ControlPipe {
        reply.truncate(usize::from(w_length));
        let zlp = reply.len() < usize::from(w_length) && reply.len() % self.max_packet_size_0() == 0;
        ControlPipe::DataIn {
            reply,
            sent: 0,
            zlp,
        }
    }

    fn dispatch(&self, request: &Request) -> ControlPipe {
        if request.request_type != RequestType::Standard {
            return ControlPipe::Stalled;
        }
        let endpoint = EndpointAddress::from(request.index as u8);
        let halt = request.value == Request::FEATURE_ENDPOINT_HALT;
        match (request.direction, request.recipient, request.request) {
            (UsbDirection::In, Recipient::Device, Request::GET_DESCRIPTOR) => {
                match self.descriptor_reply(request) {
                    Some(reply) => self.data_in(reply, request.length),
                    None => ControlPipe::Stalled,
                }
            }
            (UsbDirection::In, Recipient::Device, Request::GET_CONFIGURATION) => {
                self.data_in(vec![self.configuration], request.length)
            }
            (UsbDirection::In, Recipient::Device, Request::GET_STATUS) => {
                let self_powered = self
                    .descriptors
                    .configuration_at(0)
                    .map_or(0, |config| (config.bytes()[7] >> 6) & 1);
                self.data_in(vec![self_powered, 0], request.length)
            }
            (UsbDirection::In, Recipient::Endpoint, Request::GET_STATUS)
                if self.endpoint_active(endpoint) =>
            {
                let halted = self.endpoints.get(endpoint).is_halted() as u8;
                self.data_in(vec![halted, 0], request.length)
            }
            (UsbDirection::Out, Recipient::Device, Request::SET_ADDRESS)
                if request.value < 128 && request.length == 0 =>
            {
                ControlPipe::StatusIn(Effect::SetAddress(request.value as u8))
            }
            (UsbDirection::Out, Recipient::Device, Request::SET_CONFIGURATION)
                if self.address != 0 && request.length == 0 =>
            {
                let value = request.value as u8;
                if value == 0 || self.descriptors.configuration(value).is_some() {
                    ControlPipe::StatusIn(Effect::SetConfiguration(value))
                } else {
                    ControlPipe::Stalled
                }
            }
            (UsbDirection::Out, Recipient::Endpoint, Request::SET_FEATURE)
                if halt && self.endpoint_active(endpoint) =>
            {
                ControlPipe::StatusIn(Effect::SetHalt(endpoint))
            }
            (UsbDirection::Out, Recipient::Endpoint, Request::CLEAR_FEATURE)
                if halt && self.endpoint_active(endpoint) =>
            {
                ControlPipe::StatusIn(Effect::ClearHalt(endpoint))
            }
            _ => ControlPipe::Stalled,
        }
    }

    fn handle_setup(&mut self, bytes: &[u8]) {
        self.endpoints.setup_received();
        self.in_flight = None;
        self.naks_sent = 0;
        self.control = match decode_request(bytes) {
            Some(request) => {
                debug!(
                    "device got {} value {:#06x} index {:#06x} length {}",
                    request_name(request.request),
                    request.value,
                    request.index,
                    request.length
                );
                self.dispatch(&request)
            }
            None => {
                warn!("malformed SETUP data: {}", Hex(bytes));
                ControlPipe::Stalled
            }
        };
        if let ControlPipe::Stalled = self.control {
            debug!("device will STALL this request");
        }
    }

    fn respond_in(&mut self, number: u8) -> Option<Packet> {
        let endpoint = EndpointAddress::from_parts(usize::from(number), UsbDirection::In);
        if !self.endpoint_active(endpoint) {
            return None;
        }
        if self.endpoints.get(endpoint).is_halted() {
            return Some(Packet::handshake(Pid::Stall));
        }
        let chunk = if number == 0 {
            match &self.control {
                ControlPipe::DataIn { reply, sent, .. } => {
                    let length = (reply.len() - sent).min(self.max_packet_size_0());
                    reply[*sent..*sent + length].to_vec()
                }
                ControlPipe::StatusIn(_) => Vec::new(),
                ControlPipe::Stalled | ControlPipe::StatusOut => {
                    return Some(Packet::handshake(Pid::Stall))
                }
                ControlPipe::Idle => return Some(Packet::handshake(Pid::Nak)),
            }
        } else {
            match self.loopback {
                Some((_, source)) if source == endpoint && !self.fifo.is_empty() => {
                    let length = self.fifo.len().min(self.max_packet_size(endpoint));
                    self.fifo.iter().take(length).copied().collect()
                }
                _ => return Some(Packet::handshake(Pid::Nak)),
            }
        };
        if self.naks_sent < self.faults.nak_before_data {
            self.naks_sent += 1;
            return Some(Packet::handshake(Pid::Nak));
        }
        self.in_flight = Some(InFlight {
            endpoint: number,
            length: chunk.len(),
        });
        Some(Packet::data(self.endpoints.get(endpoint).toggle(), &chunk))
    }

    /// The host acknowledged the data packet in flight.
    fn commit_in(&mut self, in_flight: InFlight) {
        let endpoint = EndpointAddress::from_parts(usize::from(in_flight.endpoint), UsbDirection::In);
        self.naks_sent = 0;
        if !self.faults.repeat_data_toggle {
            self.endpoints.advance_toggle(endpoint);
        }
        if in_flight.endpoint != 0 {
            self.fifo.drain(..in_flight.length.min(self.fifo.len()));
            return;
        }
        let max_packet_size = self.max_packet_size_0();
        match mem::replace(&mut self.control, ControlPipe::Idle) {
            ControlPipe::DataIn { reply, sent, zlp } => {
                let sent = sent + in_flight.length;
                let last = sent == reply.len() && (in_flight.length < max_packet_size || !zlp);
                self.control = if last {
                    ControlPipe::StatusOut
                } else {
                    ControlPipe::DataIn { reply, sent, zlp }
                };
            }
            ControlPipe::StatusIn(effect) => self.apply(effect),
            other => self.control = other,
        }
    }

    fn respond_out(&mut self, number: u8, pid: Pid, data: &[u8]) -> Option<Packet> {
        let endpoint = EndpointAddress::from_parts(usize::from(number), UsbDirection::Out);
        if !self.endpoint_active(endpoint) || !pid.is_data() {
            return None;
        }
        if data.len() > self.max_packet_size(endpoint) {
            warn!("{} byte packet on endpoint {} ignored", data.len(), number);
            return None;
        }
        if self.endpoints.get(endpoint).is_halted() {
            return Some(Packet::handshake(Pid::Stall));
        }
        if number == 0 {
            return Some(self.control_out(data));
        }
        if pid != self.endpoints.get(endpoint).toggle().pid() {
            trace!("duplicate packet on endpoint {} dropped", number);
            return Some(Packet::handshake(Pid::Ack));
        }
        if let Some((sink, _)) = self.loopback {
            if sink == endpoint {
                if self.fifo.len() + data.len() > LOOPBACK_CAPACITY {
                    return Some(Packet::handshake(Pid::Nak));
                }
                self.fifo.extend(data.iter().copied());
            }
        }
        self.endpoints.advance_toggle(endpoint);
        Some(Packet::handshake(Pid::Ack))
    }

    fn control_out(&mut self, data: &[u8]) -> Packet {
        match self.control {
            // the host may end an IN data stage early with its status packet
            ControlPipe::StatusOut | ControlPipe::DataIn { .. } if data.is_empty() => {
                self.control = ControlPipe::Idle;
                Packet::handshake(Pid::Ack)
            }
            ControlPipe::Idle => Packet::handshake(Pid::Nak),
            _ => {
                self.control = ControlPipe::Stalled;
                Packet::handshake(Pid::Stall)
            }
        }
    }
}

#[async_trait(?Send)]
impl BusChannel for SimulatedDevice {
    fn now(&self) -> SimTime {
        self.now
    }

    async fn drive_reset(&mut self, duration: Duration) {
        self.now += duration;
        debug!("device reset at {}", self.now);
        self.reset_device();
    }

    async fn connect(&mut self) {
        self.now += CONNECT_TIME;
        self.connected = true;
        self.last_activity = self.now;
    }

    async fn send_sof(&mut self, frame_number: u16) {
        self.elapse(TOKEN_BITS);
        self.bus_activity();
        self.frame_number = frame_number & 0x7ff;
    }

    async fn send_token(&mut self, pid: Pid, address: u8, endpoint: u8) {
        self.elapse(TOKEN_BITS);
        self.bus_activity();
        self.in_flight = None;
        self.response = None;
        let endpoint = endpoint & 0x0f;
        if !self.connected || self.suspended || address != self.address {
            self.token = Token::Ignored;
            return;
        }
        self.token = match pid {
            Pid::Setup => Token::Setup,
            Pid::Out => Token::Out(endpoint),
            Pid::In => {
                self.response = self.respond_in(endpoint);
                Token::None
            }
            _ => Token::Ignored,
        };
    }

    async fn send_data(&mut self, pid: Pid, bytes: &[u8]) {
        self.elapse(data_bits(bytes.len()));
        self.last_activity = self.now;
        self.response = match mem::replace(&mut self.token, Token::None) {
            Token::Setup if pid == Pid::Data0 => {
                self.handle_setup(bytes);
                Some(Packet::handshake(Pid::Ack))
            }
            Token::Out(endpoint) => self.respond_out(endpoint, pid, bytes),
            _ => None,
        };
    }

    async fn send_handshake(&mut self, pid: Pid) {
        self.elapse(HANDSHAKE_BITS);
        self.last_activity = self.now;
        match self.in_flight.take() {
            Some(in_flight) if pid == Pid::Ack => self.commit_in(in_flight),
            _ => {}
        }
    }

    async fn receive_packet(&mut self) -> Option<Packet> {
        match self.response.take() {
            Some(packet) => {
                self.elapse(packet_bits(&packet));
                trace!("device -> {} at {}", packet, self.now);
                Some(packet)
            }
            None => {
                self.elapse(RESPONSE_TIMEOUT_BITS);
                None
            }
        }
    }

    async fn advance_time(&mut self, duration: Duration) {
        self.now += duration;
    }
}
