//! Host-side transaction engine.
//!
//! Every operation is one logical USB transaction (or a full control transfer) made of
//! packet exchanges on a [`BusChannel`]. Each exchange retries on NAK or silence until its
//! deadline passes; the deadline is `now + max_packet_time` unless the caller armed one with
//! [`TransactionEngine::arm_deadline`]. Nothing here panics on device misbehavior: every
//! failure comes back as a [`TransactionError`].

use crate::bus::{BusChannel, SimTime};
use crate::compare::{check_response, Hex};
use crate::config::Timing;
use crate::error::{TransactionError, Violation};
use crate::oracle::ConfigurationImage;
use crate::packet::{Packet, Pid};
use crate::session::{DeviceState, Session};
use crate::setup::{
    clear_feature_request, encode_request, get_configuration_request, get_descriptor_request,
    request_name, set_address_request, set_configuration_request, set_feature_request,
};
use crate::usb::{UsbDescriptorType, DEVICE_DESCRIPTOR_LEN};
use log::{debug, info, trace, warn};
use std::time::Duration;
use usb_device::control::{Recipient, Request};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// `wLength` used for string descriptor reads, as hosts do.
const STRING_DESCRIPTOR_READ_LEN: u16 = 255;

pub struct TransactionEngine<'b, B: BusChannel> {
    bus: &'b mut B,
    session: Session,
    timing: Timing,
}

fn ep0(direction: UsbDirection) -> EndpointAddress {
    EndpointAddress::from_parts(0, direction)
}

impl<'b, B: BusChannel> TransactionEngine<'b, B> {
    pub fn new(bus: &'b mut B, session: Session, timing: Timing) -> Self {
        TransactionEngine {
            bus,
            session,
            timing,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn now(&self) -> SimTime {
        self.bus.now()
    }

    /// Teaches the host the endpoint types and packet sizes of a configuration.
    pub fn declare_endpoints(&mut self, configuration: &ConfigurationImage) {
        for endpoint in configuration.endpoints() {
            self.session.endpoints_mut().declare(endpoint);
        }
    }

    /// Drives a bus reset, waits for the bus to settle and forgets address, configuration and
    /// endpoint state.
    pub async fn reset(&mut self, duration: Duration) {
        info!("bus reset ({:?}) at {}", duration, self.bus.now());
        self.bus.drive_reset(duration).await;
        self.session.on_reset();
        self.bus.advance_time(self.timing.settle).await;
    }

    pub async fn connect(&mut self) {
        if self.session.state() == DeviceState::Unattached {
            warn!("connecting a device that has not seen a bus reset");
        }
        debug!("connect at {}", self.bus.now());
        self.bus.connect().await;
    }

    /// Broadcasts SOF with `frame_number` as given. Frame numbers are 11 bits on the wire;
    /// callers count consecutive frames and wrap them themselves.
    pub async fn send_start_of_frame(&mut self, frame_number: u16) {
        trace!("SOF {}", frame_number);
        self.bus.send_sof(frame_number).await;
    }

    pub async fn wait(&mut self, duration: Duration) {
        self.bus.advance_time(duration).await;
    }

    /// Replaces the deadline of the next packet exchange with `now + budget`.
    pub fn arm_deadline(&mut self, budget: Duration) {
        let deadline = self.bus.now() + budget;
        self.session.arm_deadline(deadline);
    }

    /// Sends a SETUP token and the 8-byte request on endpoint 0, and waits for the ACK.
    pub async fn transaction_setup(
        &mut self,
        address: u8,
        request: &Request,
    ) -> Result<(), TransactionError> {
        self.session.check_setup_allowed()?;
        let bytes = encode_request(request);
        debug!(
            "SETUP {} to {}: {}",
            request_name(request.request),
            address,
            Hex(&bytes)
        );
        let deadline = self
            .session
            .start_packet(self.bus.now(), self.timing.max_packet_time);
        while self.bus.now() < deadline {
            self.bus.send_token(Pid::Setup, address, 0).await;
            self.bus.send_data(Pid::Data0, &bytes).await;
            match self.bus.receive_packet().await {
                Some(Packet { pid: Pid::Ack, .. }) => {
                    self.session.begin_control(request)?;
                    return Ok(());
                }
                None => trace!("SETUP unanswered, retrying"),
                Some(packet) => return Err(handshake_error(0, Pid::Ack, packet.pid)),
            }
        }
        Err(TransactionError::Timeout {
            waiting_for: "SETUP ACK",
            endpoint: 0,
            deadline,
        })
    }

    /// Reads `expected.len()` bytes from an IN endpoint and compares them with `expected`.
    ///
    /// On endpoint 0 this is one data or status phase of the control transfer in progress.
    pub async fn transaction_data_in(
        &mut self,
        address: u8,
        endpoint: u8,
        expected: &[u8],
    ) -> Result<(), TransactionError> {
        let received = if endpoint == 0 {
            self.control_read(address, expected.len()).await?
        } else {
            let ep = EndpointAddress::from_parts(endpoint as usize, UsbDirection::In);
            self.read_stage(address, ep, expected.len()).await?.0
        };
        check_response(expected, &received)
    }

    /// Writes `payload` to an OUT endpoint, split into max-packet-size chunks.
    ///
    /// An empty payload is sent as one zero-length packet. On endpoint 0 this is one data or
    /// status phase of the control transfer in progress.
    pub async fn transaction_data_out(
        &mut self,
        address: u8,
        endpoint: u8,
        payload: &[u8],
    ) -> Result<(), TransactionError> {
        if endpoint == 0 {
            return self.control_write(address, payload).await;
        }
        let ep = EndpointAddress::from_parts(endpoint as usize, UsbDirection::Out);
        self.write_stage(address, ep, payload).await
    }

    /// SETUP, IN data stage up to `wLength`, OUT status; then compares the data with `expected`.
    pub async fn control_transfer_in(
        &mut self,
        address: u8,
        request: &Request,
        expected: &[u8],
    ) -> Result<(), TransactionError> {
        if request.direction != UsbDirection::In {
            return Err(Violation::OutOfOrder {
                expected: "a device-to-host request",
            }
            .into());
        }
        debug!(
            "{} from {} (wLength {})",
            request_name(request.request),
            address,
            request.length
        );
        self.transaction_setup(address, request).await?;
        if request.length == 0 {
            let status = self.control_read(address, 0).await?;
            return check_response(expected, &status);
        }
        let received = self.control_read(address, request.length as usize).await?;
        self.control_write(address, &[]).await?;
        debug!("received {}", Hex(&received));
        check_response(expected, &received)
    }

    /// SETUP, OUT data stage carrying `payload`, IN status.
    ///
    /// `payload` must be exactly `wLength` bytes.
    pub async fn control_transfer_out(
        &mut self,
        address: u8,
        request: &Request,
        payload: &[u8],
    ) -> Result<(), TransactionError> {
        if payload.len() != request.length as usize {
            return Err(Violation::PayloadLength {
                payload: payload.len(),
                w_length: request.length,
            }
            .into());
        }
        debug!(
            "{} to {} ({} bytes)",
            request_name(request.request),
            address,
            payload.len()
        );
        self.transaction_setup(address, request).await?;
        if !payload.is_empty() {
            self.control_write(address, payload).await?;
        }
        let status = self.control_read(address, 0).await?;
        check_response(&[], &status)
    }

    /// SET_ADDRESS from the current address, then the recovery interval unless
    /// `skip_recovery` is set.
    pub async fn set_device_address(
        &mut self,
        address: u8,
        skip_recovery: bool,
    ) -> Result<(), TransactionError> {
        let current = self.session.address();
        self.control_transfer_out(current, &set_address_request(address), &[])
            .await?;
        if !skip_recovery {
            self.bus.advance_time(self.timing.set_address_recovery).await;
        }
        Ok(())
    }

    pub async fn set_configuration(&mut self, configuration: u8) -> Result<(), TransactionError> {
        let address = self.session.address();
        self.control_transfer_out(address, &set_configuration_request(configuration), &[])
            .await
    }

    /// GET_CONFIGURATION, expecting `configuration` back.
    pub async fn get_configuration(&mut self, configuration: u8) -> Result<(), TransactionError> {
        let address = self.session.address();
        self.control_transfer_in(address, &get_configuration_request(), &[configuration])
            .await
    }

    /// SET_FEATURE(ENDPOINT_HALT) on `endpoint`.
    pub async fn set_endpoint_halt(
        &mut self,
        endpoint: EndpointAddress,
    ) -> Result<(), TransactionError> {
        let address = self.session.address();
        let request = set_feature_request(
            Request::FEATURE_ENDPOINT_HALT,
            Recipient::Endpoint,
            u8::from(endpoint).into(),
        );
        self.control_transfer_out(address, &request, &[]).await
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) on `endpoint`; its data toggle restarts at DATA0.
    pub async fn clear_endpoint_halt(
        &mut self,
        endpoint: EndpointAddress,
    ) -> Result<(), TransactionError> {
        let address = self.session.address();
        let request = clear_feature_request(
            Request::FEATURE_ENDPOINT_HALT,
            Recipient::Endpoint,
            u8::from(endpoint).into(),
        );
        self.control_transfer_out(address, &request, &[]).await
    }

    /// Sends an IN token and requires the device to answer STALL.
    pub async fn expect_stall(&mut self, address: u8, endpoint: u8) -> Result<(), TransactionError> {
        let deadline = self
            .session
            .start_packet(self.bus.now(), self.timing.max_packet_time);
        self.stall_until(address, endpoint, deadline, false).await
    }

    /// Polls an IN endpoint until it answers STALL, tolerating NAKs for up to `window`.
    pub async fn await_stall(
        &mut self,
        address: u8,
        endpoint: u8,
        window: Duration,
    ) -> Result<(), TransactionError> {
        let deadline = self.session.start_packet(self.bus.now(), window);
        self.stall_until(address, endpoint, deadline, true).await
    }

    pub async fn get_descriptor(
        &mut self,
        kind: UsbDescriptorType,
        index: u8,
        lang_id: u16,
        length: u16,
        expected: &[u8],
    ) -> Result<(), TransactionError> {
        let address = self.session.address();
        let request = get_descriptor_request(kind, index, lang_id, length);
        self.control_transfer_in(address, &request, expected).await
    }

    pub async fn get_device_descriptor(&mut self, expected: &[u8]) -> Result<(), TransactionError> {
        self.get_descriptor(
            UsbDescriptorType::Device,
            0,
            0,
            DEVICE_DESCRIPTOR_LEN as u16,
            expected,
        )
        .await
    }

    /// GET_DESCRIPTOR(CONFIGURATION, `index`) with `wLength` = `length`.
    pub async fn get_configuration_descriptor(
        &mut self,
        index: u8,
        length: u16,
        expected: &[u8],
    ) -> Result<(), TransactionError> {
        self.get_descriptor(UsbDescriptorType::Configuration, index, 0, length, expected)
            .await
    }

    pub async fn get_string_descriptor(
        &mut self,
        lang_id: u16,
        index: u8,
        expected: &[u8],
    ) -> Result<(), TransactionError> {
        self.get_descriptor(
            UsbDescriptorType::String,
            index,
            lang_id,
            STRING_DESCRIPTOR_READ_LEN,
            expected,
        )
        .await
    }

    async fn stall_until(
        &mut self,
        address: u8,
        endpoint: u8,
        deadline: SimTime,
        tolerate_nak: bool,
    ) -> Result<(), TransactionError> {
        while self.bus.now() < deadline {
            self.bus.send_token(Pid::In, address, endpoint).await;
            match self.bus.receive_packet().await {
                Some(Packet { pid: Pid::Stall, .. }) => {
                    debug!("endpoint {} stalled", endpoint);
                    return Ok(());
                }
                Some(Packet { pid: Pid::Nak, .. }) if tolerate_nak => {
                    trace!("endpoint {} NAK while waiting for STALL", endpoint)
                }
                None => trace!("endpoint {} silent while waiting for STALL", endpoint),
                Some(packet) => return Err(handshake_error(endpoint, Pid::Stall, packet.pid)),
            }
        }
        Err(TransactionError::Timeout {
            waiting_for: "STALL",
            endpoint,
            deadline,
        })
    }

    /// One IN phase on endpoint 0, bounded by what the control stage still allows.
    async fn control_read(
        &mut self,
        address: u8,
        requested: usize,
    ) -> Result<Vec<u8>, TransactionError> {
        let allowance = self.session.control_in_allowance()?;
        if requested > allowance as usize {
            return Err(Violation::PayloadLength {
                payload: requested,
                w_length: allowance,
            }
            .into());
        }
        let (received, ended_short) = self
            .read_stage(address, ep0(UsbDirection::In), requested)
            .await?;
        if received.len() > requested {
            return Err(Violation::PayloadLength {
                payload: received.len(),
                w_length: requested as u16,
            }
            .into());
        }
        self.session.control_in_done(received.len(), ended_short);
        Ok(received)
    }

    /// One OUT phase on endpoint 0, bounded by what the control stage still allows.
    async fn control_write(&mut self, address: u8, payload: &[u8]) -> Result<(), TransactionError> {
        let allowance = self.session.control_out_allowance()?;
        if payload.len() > allowance as usize {
            return Err(Violation::PayloadLength {
                payload: payload.len(),
                w_length: allowance,
            }
            .into());
        }
        self.write_stage(address, ep0(UsbDirection::Out), payload)
            .await?;
        self.session.control_out_done(payload.len());
        Ok(())
    }

    /// IN packets until `requested` bytes have arrived or the device ends the stage with a
    /// short packet. Returns the data and whether a short packet ended it.
    async fn read_stage(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        requested: usize,
    ) -> Result<(Vec<u8>, bool), TransactionError> {
        let max_packet_size = self.session.packet_size_for(ep);
        // a zero limit would never end a stage
        let limit = usize::from(max_packet_size).max(1);
        let mut received = Vec::with_capacity(requested);
        loop {
            let data = self.in_packet(address, ep).await?;
            if data.len() > limit {
                return Err(Violation::OversizedPacket {
                    endpoint: ep.index() as u8,
                    length: data.len(),
                    max_packet_size,
                }
                .into());
            }
            let short = data.len() < limit;
            received.extend_from_slice(&data);
            if short {
                return Ok((received, true));
            }
            if received.len() >= requested {
                return Ok((received, false));
            }
        }
    }

    async fn write_stage(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        payload: &[u8],
    ) -> Result<(), TransactionError> {
        let limit = usize::from(self.session.packet_size_for(ep)).max(1);
        if payload.is_empty() {
            return self.out_packet(address, ep, &[]).await;
        }
        for chunk in payload.chunks(limit) {
            self.out_packet(address, ep, chunk).await?;
        }
        Ok(())
    }

    /// A halted endpoint other than 0 may only answer STALL. Endpoint 0 recovers on SETUP.
    fn halted(&self, ep: EndpointAddress) -> bool {
        ep.index() != 0 && self.session.endpoint(ep).is_halted()
    }

    async fn in_packet(
        &mut self,
        address: u8,
        ep: EndpointAddress,
    ) -> Result<Vec<u8>, TransactionError> {
        let endpoint = ep.index() as u8;
        let due = self.session.endpoint(ep).toggle().pid();
        let halted = self.halted(ep);
        let deadline = self
            .session
            .start_packet(self.bus.now(), self.timing.max_packet_time);
        while self.bus.now() < deadline {
            self.bus.send_token(Pid::In, address, endpoint).await;
            match self.bus.receive_packet().await {
                None => trace!("IN {}: no response", endpoint),
                Some(packet) if halted && packet.pid != Pid::Stall => {
                    return Err(handshake_error(endpoint, Pid::Stall, packet.pid))
                }
                Some(Packet { pid: Pid::Nak, .. }) => trace!("IN {}: NAK", endpoint),
                Some(packet) if packet.pid.is_data() => {
                    if packet.pid != due {
                        return Err(Violation::DataToggle {
                            endpoint,
                            expected: due,
                            received: packet.pid,
                        }
                        .into());
                    }
                    self.bus.send_handshake(Pid::Ack).await;
                    self.session.endpoints_mut().advance_toggle(ep);
                    trace!("IN {}: {}", endpoint, packet);
                    return Ok(packet.data.unwrap_or_default());
                }
                Some(packet) => {
                    return Err(TransactionError::UnexpectedHandshake {
                        endpoint,
                        expected: due,
                        received: packet.pid,
                    })
                }
            }
        }
        Err(TransactionError::Timeout {
            waiting_for: "IN data",
            endpoint,
            deadline,
        })
    }

    async fn out_packet(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        chunk: &[u8],
    ) -> Result<(), TransactionError> {
        let endpoint = ep.index() as u8;
        let toggle = self.session.endpoint(ep).toggle().pid();
        let halted = self.halted(ep);
        let deadline = self
            .session
            .start_packet(self.bus.now(), self.timing.max_packet_time);
        while self.bus.now() < deadline {
            self.bus.send_token(Pid::Out, address, endpoint).await;
            self.bus.send_data(toggle, chunk).await;
            match self.bus.receive_packet().await {
                Some(packet) if halted && packet.pid != Pid::Stall => {
                    return Err(handshake_error(endpoint, Pid::Stall, packet.pid))
                }
                Some(Packet { pid: Pid::Ack, .. }) => {
                    self.session.endpoints_mut().advance_toggle(ep);
                    trace!("OUT {}: {} bytes ACKed", endpoint, chunk.len());
                    return Ok(());
                }
                Some(Packet { pid: Pid::Nak, .. }) => trace!("OUT {}: NAK", endpoint),
                None => trace!("OUT {}: no response", endpoint),
                Some(packet) => return Err(handshake_error(endpoint, Pid::Ack, packet.pid)),
            }
        }
        Err(TransactionError::Timeout {
            waiting_for: "OUT handshake",
            endpoint,
            deadline,
        })
    }
}

fn handshake_error(endpoint: u8, expected: Pid, received: Pid) -> TransactionError {
    if received.is_data() {
        Violation::DataInsteadOfHandshake { received }.into()
    } else {
        TransactionError::UnexpectedHandshake {
            endpoint,
            expected,
            received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ByteAt;
    use crate::packet::DataToggle;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    const STEP: Duration = Duration::from_micros(1);

    /// Replays canned device responses, one per `receive_packet`.
    #[derive(Default)]
    struct ScriptedBus {
        now: SimTime,
        replies: VecDeque<Option<Packet>>,
        tokens: Vec<(Pid, u8, u8)>,
        handshakes: Vec<Pid>,
        data: Vec<(Pid, Vec<u8>)>,
        frames: Vec<u16>,
    }

    impl ScriptedBus {
        fn replying(replies: Vec<Option<Packet>>) -> Self {
            ScriptedBus {
                replies: replies.into(),
                ..Default::default()
            }
        }
    }

    #[async_trait(?Send)]
    impl BusChannel for ScriptedBus {
        fn now(&self) -> SimTime {
            self.now
        }

        async fn drive_reset(&mut self, duration: Duration) {
            self.now += duration;
        }

        async fn connect(&mut self) {}

        async fn send_sof(&mut self, frame_number: u16) {
            self.now += STEP;
            self.frames.push(frame_number);
        }

        async fn send_token(&mut self, pid: Pid, address: u8, endpoint: u8) {
            self.now += STEP;
            self.tokens.push((pid, address, endpoint));
        }

        async fn send_data(&mut self, pid: Pid, bytes: &[u8]) {
            self.now += STEP;
            self.data.push((pid, bytes.to_vec()));
        }

        async fn send_handshake(&mut self, pid: Pid) {
            self.now += STEP;
            self.handshakes.push(pid);
        }

        async fn receive_packet(&mut self) -> Option<Packet> {
            self.now += STEP;
            self.replies.pop_front().and_then(|reply| reply)
        }

        async fn advance_time(&mut self, duration: Duration) {
            self.now += duration;
        }
    }

    fn ack() -> Option<Packet> {
        Some(Packet::handshake(Pid::Ack))
    }

    fn nak() -> Option<Packet> {
        Some(Packet::handshake(Pid::Nak))
    }

    fn data(toggle: DataToggle, bytes: &[u8]) -> Option<Packet> {
        Some(Packet::data(toggle, bytes))
    }

    fn device_request() -> Request {
        get_descriptor_request(UsbDescriptorType::Device, 0, 0, 18)
    }

    fn engine(bus: &mut ScriptedBus, max_packet_size: u16) -> TransactionEngine<'_, ScriptedBus> {
        TransactionEngine::new(bus, Session::new(max_packet_size), Timing::default())
    }

    #[tokio::test]
    async fn silent_device_times_out_at_the_deadline() {
        let mut bus = ScriptedBus::default();
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .transaction_setup(0, &device_request())
            .await
            .unwrap_err();
        match err {
            TransactionError::Timeout {
                waiting_for,
                endpoint,
                deadline,
            } => {
                assert_eq!(waiting_for, "SETUP ACK");
                assert_eq!(endpoint, 0);
                assert_eq!(deadline, SimTime::ZERO + Duration::from_micros(100));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.now() >= engine.session().packet_deadline());
        assert_eq!(engine.session().control_stage(), crate::session::ControlStage::Idle);
    }

    #[tokio::test]
    async fn armed_deadline_bounds_the_next_exchange_only() {
        let mut bus = ScriptedBus::default();
        let mut engine = engine(&mut bus, 64);
        engine.arm_deadline(Duration::from_micros(9));
        let err = engine
            .transaction_setup(0, &device_request())
            .await
            .unwrap_err();
        match err {
            TransactionError::Timeout { deadline, .. } => {
                assert_eq!(deadline, SimTime::from_nanos(9_000))
            }
            other => panic!("unexpected {:?}", other),
        }
        let before = engine.now();
        let _ = engine.transaction_setup(0, &device_request()).await;
        assert_eq!(
            engine.session().packet_deadline(),
            before + Duration::from_micros(100)
        );
    }

    #[tokio::test]
    async fn control_in_retries_nak_and_acknowledges_data() {
        let descriptor: Vec<u8> = (0..18).collect();
        let mut bus = ScriptedBus::replying(vec![
            ack(),
            nak(),
            None,
            data(DataToggle::Data1, &descriptor),
            ack(),
        ]);
        let mut engine = engine(&mut bus, 64);
        engine
            .control_transfer_in(0, &device_request(), &descriptor)
            .await
            .unwrap();
        drop(engine);
        let ins = bus.tokens.iter().filter(|t| t.0 == Pid::In).count();
        assert_eq!(ins, 3);
        assert_eq!(bus.handshakes, vec![Pid::Ack]);
        // SETUP data, then the zero-length DATA1 status
        assert_eq!(bus.data[0].0, Pid::Data0);
        assert_eq!(bus.data[1], (Pid::Data1, Vec::new()));
    }

    #[tokio::test]
    async fn multi_packet_stage_alternates_toggles() {
        let descriptor: Vec<u8> = (0..18).collect();
        let mut bus = ScriptedBus::replying(vec![
            ack(),
            data(DataToggle::Data1, &descriptor[..8]),
            data(DataToggle::Data0, &descriptor[8..16]),
            data(DataToggle::Data1, &descriptor[16..]),
            ack(),
        ]);
        let mut engine = engine(&mut bus, 8);
        engine
            .control_transfer_in(0, &device_request(), &descriptor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeated_toggle_is_a_protocol_violation() {
        let mut bus = ScriptedBus::replying(vec![
            ack(),
            data(DataToggle::Data1, &[0; 8]),
            data(DataToggle::Data1, &[0; 8]),
        ]);
        let mut engine = engine(&mut bus, 8);
        let err = engine
            .control_transfer_in(0, &device_request(), &[0; 18])
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::DataToggle {
                endpoint,
                expected,
                received,
            }) => {
                assert_eq!(endpoint, 0);
                assert_eq!(expected, Pid::Data0);
                assert_eq!(received, Pid::Data1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn stall_in_data_stage_is_an_unexpected_handshake() {
        let mut bus = ScriptedBus::replying(vec![ack(), Some(Packet::handshake(Pid::Stall))]);
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .control_transfer_in(0, &device_request(), &[0; 18])
            .await
            .unwrap_err();
        match err {
            TransactionError::UnexpectedHandshake { received, .. } => {
                assert_eq!(received, Pid::Stall)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn short_answer_is_a_short_read() {
        let mut bus = ScriptedBus::replying(vec![ack(), data(DataToggle::Data1, &[1, 2]), ack()]);
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .control_transfer_in(0, &device_request(), &[1, 2, 3])
            .await
            .unwrap_err();
        match err {
            TransactionError::ShortRead { expected, received } => {
                assert_eq!((expected, received), (3, 2))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn differing_byte_reports_its_offset() {
        let mut bus = ScriptedBus::replying(vec![ack(), data(DataToggle::Data1, &[1, 9, 3]), ack()]);
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .control_transfer_in(0, &device_request(), &[1, 2, 3])
            .await
            .unwrap_err();
        match err {
            TransactionError::DataMismatch {
                offset,
                expected,
                received,
            } => {
                assert_eq!(offset, 1);
                assert_eq!(expected, ByteAt(Some(2)));
                assert_eq!(received, ByteAt(Some(9)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let mut bus = ScriptedBus::replying(vec![ack(), data(DataToggle::Data1, &[0; 16])]);
        let mut engine = engine(&mut bus, 8);
        let err = engine
            .control_transfer_in(0, &device_request(), &[0; 18])
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::OversizedPacket {
                length,
                max_packet_size,
                ..
            }) => assert_eq!((length, max_packet_size), (16, 8)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn answer_longer_than_w_length_is_a_violation() {
        let request = get_descriptor_request(UsbDescriptorType::Device, 0, 0, 4);
        let mut bus = ScriptedBus::replying(vec![ack(), data(DataToggle::Data1, &[0; 8])]);
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .control_transfer_in(0, &request, &[0; 4])
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::PayloadLength { payload, w_length }) => {
                assert_eq!((payload, w_length), (8, 4))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn out_payload_is_split_into_packets() {
        let payload: Vec<u8> = (0..20).collect();
        let request = Request {
            length: 20,
            ..set_address_request(0)
        };
        let mut bus = ScriptedBus::replying(vec![
            ack(),
            ack(),
            nak(),
            ack(),
            ack(),
            data(DataToggle::Data1, &[]),
        ]);
        let mut engine = engine(&mut bus, 8);
        engine
            .control_transfer_out(0, &request, &payload)
            .await
            .unwrap();
        drop(engine);
        let chunks: Vec<_> = bus.data[1..].iter().cloned().collect();
        assert_eq!(chunks[0], (Pid::Data1, payload[..8].to_vec()));
        // the NAKed packet goes out again with the same toggle
        assert_eq!(chunks[1], (Pid::Data0, payload[8..16].to_vec()));
        assert_eq!(chunks[2], (Pid::Data0, payload[8..16].to_vec()));
        assert_eq!(chunks[3], (Pid::Data1, payload[16..].to_vec()));
    }

    #[tokio::test]
    async fn out_payload_must_match_w_length() {
        let mut bus = ScriptedBus::default();
        let mut engine = engine(&mut bus, 8);
        let err = engine
            .control_transfer_out(0, &set_address_request(3), &[1])
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::PayloadLength { payload, w_length }) => {
                assert_eq!((payload, w_length), (1, 0))
            }
            other => panic!("unexpected {:?}", other),
        }
        drop(engine);
        assert!(bus.tokens.is_empty());
    }

    #[tokio::test]
    async fn data_phase_without_setup_is_rejected() {
        let mut bus = ScriptedBus::default();
        let mut engine = engine(&mut bus, 8);
        let err = engine.transaction_data_in(0, 0, &[]).await.unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::NoControlTransfer { endpoint: 0 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_before_data_complete_is_rejected() {
        let mut bus = ScriptedBus::replying(vec![ack()]);
        let mut engine = engine(&mut bus, 64);
        engine
            .transaction_setup(0, &device_request())
            .await
            .unwrap();
        let err = engine.transaction_data_out(0, 0, &[]).await.unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::StatusBeforeDataComplete {
                remaining: 18,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
        let err = engine
            .transaction_setup(0, &device_request())
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::SetupMidTransaction) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn set_address_takes_effect_after_status() {
        let mut bus = ScriptedBus::replying(vec![ack(), data(DataToggle::Data1, &[])]);
        let mut engine = engine(&mut bus, 64);
        engine.reset(Duration::from_micros(10)).await;
        let before = engine.now();
        engine.set_device_address(42, false).await.unwrap();
        assert_eq!(engine.session().address(), 42);
        assert!(engine.now() - before >= Timing::default().set_address_recovery);
        drop(engine);
        assert!(bus.tokens.iter().all(|&(_, address, _)| address == 0));
    }

    #[tokio::test]
    async fn expect_stall_rejects_nak_but_await_stall_tolerates_it() {
        let mut bus = ScriptedBus::replying(vec![nak(), nak(), Some(Packet::handshake(Pid::Stall))]);
        let mut engine = engine(&mut bus, 64);
        let err = engine.expect_stall(3, 2).await.unwrap_err();
        match err {
            TransactionError::UnexpectedHandshake {
                endpoint,
                expected,
                received,
            } => assert_eq!((endpoint, expected, received), (2, Pid::Stall, Pid::Nak)),
            other => panic!("unexpected {:?}", other),
        }
        engine
            .await_stall(3, 2, Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn data_instead_of_stall_is_a_violation() {
        let mut bus = ScriptedBus::replying(vec![data(DataToggle::Data1, &[1])]);
        let mut engine = engine(&mut bus, 64);
        let err = engine.expect_stall(3, 2).await.unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::DataInsteadOfHandshake {
                received: Pid::Data1,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn frame_numbers_are_sent_as_given() {
        let mut bus = ScriptedBus::default();
        let mut engine = engine(&mut bus, 64);
        engine.send_start_of_frame(0x7ff).await;
        engine.send_start_of_frame(0x800).await;
        drop(engine);
        assert_eq!(bus.frames, vec![0x7ff, 0x800]);
    }

    #[tokio::test]
    async fn data_where_handshake_was_due_is_a_violation() {
        let mut bus = ScriptedBus::replying(vec![data(DataToggle::Data0, &[1])]);
        let mut engine = engine(&mut bus, 64);
        let err = engine
            .transaction_setup(0, &device_request())
            .await
            .unwrap_err();
        match err {
            TransactionError::ProtocolViolation(Violation::DataInsteadOfHandshake {
                received: Pid::Data0,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
