use crate::packet::DataToggle;
use crate::usb::USB_MAX_ENDPOINTS;
use crate::EndpointInfo;
use log::{debug, warn};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

/// Host-side bookkeeping for one endpoint direction.
#[derive(Clone, Debug)]
pub struct Endpoint {
    address: EndpointAddress,
    ep_type: EndpointType,
    max_packet_size: Option<u16>,
    halted: bool,
    toggle: DataToggle,
}

impl Endpoint {
    fn new(address: EndpointAddress) -> Self {
        let ep_type = if address.index() == 0 {
            EndpointType::Control
        } else {
            EndpointType::Bulk
        };
        Endpoint {
            address,
            ep_type,
            max_packet_size: None,
            halted: false,
            toggle: DataToggle::Data0,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn number(&self) -> u8 {
        self.address.index() as u8
    }

    pub fn direction(&self) -> UsbDirection {
        self.address.direction()
    }

    pub fn ep_type(&self) -> EndpointType {
        self.ep_type
    }

    /// `wMaxPacketSize` from the declaring endpoint descriptor, if any.
    pub fn max_packet_size(&self) -> Option<u16> {
        self.max_packet_size
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn toggle(&self) -> DataToggle {
        self.toggle
    }
}

/// Halt flags and data toggles for every endpoint number in both directions.
#[derive(Clone, Debug)]
pub struct EndpointTable {
    endpoints: Vec<Endpoint>,
}

fn slot(address: EndpointAddress) -> usize {
    (address.index() % USB_MAX_ENDPOINTS) * 2 + (address.direction() == UsbDirection::In) as usize
}

impl EndpointTable {
    pub fn new() -> Self {
        let endpoints = (0..USB_MAX_ENDPOINTS)
            .flat_map(|index| {
                vec![
                    Endpoint::new(EndpointAddress::from_parts(index, UsbDirection::Out)),
                    Endpoint::new(EndpointAddress::from_parts(index, UsbDirection::In)),
                ]
            })
            .collect();
        EndpointTable { endpoints }
    }

    pub fn get(&self, address: EndpointAddress) -> &Endpoint {
        &self.endpoints[slot(address)]
    }

    fn get_mut(&mut self, address: EndpointAddress) -> &mut Endpoint {
        &mut self.endpoints[slot(address)]
    }

    /// Records type and packet size from an endpoint descriptor. Endpoint 0 is always CONTROL
    /// and cannot be redeclared.
    pub fn declare(&mut self, descriptor: &impl EndpointInfo) {
        let address = descriptor.address();
        if address.index() == 0 {
            warn!("ignoring endpoint descriptor for endpoint 0");
            return;
        }
        let ep = self.get_mut(address);
        ep.ep_type = descriptor.ep_type();
        ep.max_packet_size = Some(descriptor.descriptor().max_packet_size);
        debug!(
            "declared endpoint {:#04x} as {:?}, {} byte packets",
            u8::from(address),
            ep.ep_type,
            descriptor.descriptor().max_packet_size
        );
    }

    /// Both directions of endpoint 0 form one control pipe and halt together.
    fn pipe(address: EndpointAddress) -> Vec<EndpointAddress> {
        if address.index() == 0 {
            vec![
                EndpointAddress::from_parts(0, UsbDirection::Out),
                EndpointAddress::from_parts(0, UsbDirection::In),
            ]
        } else {
            vec![address]
        }
    }

    pub fn halt(&mut self, address: EndpointAddress) {
        for address in Self::pipe(address) {
            self.get_mut(address).halted = true;
        }
    }

    /// Leaves the HALTED state; the data toggle restarts at DATA0.
    pub fn clear_halt(&mut self, address: EndpointAddress) {
        for address in Self::pipe(address) {
            let ep = self.get_mut(address);
            ep.halted = false;
            ep.toggle = DataToggle::Data0;
        }
    }

    /// A SETUP on endpoint 0 clears its halt and arms DATA1 for both data directions.
    pub fn setup_received(&mut self) {
        for direction in [UsbDirection::Out, UsbDirection::In].iter() {
            let ep = self.get_mut(EndpointAddress::from_parts(0, *direction));
            ep.halted = false;
            ep.toggle = DataToggle::Data1;
        }
    }

    /// Configuration selection and bus reset: no endpoint stays halted and every toggle
    /// restarts at DATA0.
    pub fn reset_all(&mut self) {
        for ep in &mut self.endpoints {
            ep.halted = false;
            ep.toggle = DataToggle::Data0;
        }
    }

    pub fn advance_toggle(&mut self, address: EndpointAddress) {
        self.get_mut(address).toggle.flip();
    }

    pub fn halted(&self) -> impl Iterator<Item = &Endpoint> + '_ {
        self.endpoints.iter().filter(|ep| ep.halted)
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}
