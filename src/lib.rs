//! Host-side USB conformance harness.
//!
//! A [`TransactionEngine`](engine::TransactionEngine) plays the host role on a packet-level
//! [`BusChannel`](bus::BusChannel), keeps its [`Session`](session::Session) bookkeeping in step
//! with the device, and checks every response against a [`DeviceOracle`](oracle::DeviceOracle).
//! [`scenario`] holds the registry of conformance scripts built on top of it, and [`sim`] a
//! simulated full-speed device to run them against.

use bit_field::BitField;

pub use usb_device::control::{Recipient, Request};
pub use usb_device::endpoint::{EndpointAddress, EndpointType};
pub use usb_device::UsbDirection;

pub mod builder;
pub mod bus;
pub mod cdc;
pub mod compare;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod oracle;
pub mod packet;
pub mod scenario;
pub mod session;
pub mod setup;
pub mod sim;
pub mod usb;

pub trait EndpointInfo {
    fn descriptor(&self) -> &usb::UsbEndpointDescriptor;

    fn address(&self) -> EndpointAddress {
        self.descriptor().address
    }

    fn ep_type(&self) -> EndpointType {
        match self.descriptor().attributes.get_bits(0..2) {
            0b00 => EndpointType::Control,
            0b01 => EndpointType::Isochronous,
            0b10 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    fn direction(&self) -> UsbDirection {
        self.address().direction()
    }
}

impl EndpointInfo for usb::UsbEndpointDescriptor {
    fn descriptor(&self) -> &usb::UsbEndpointDescriptor {
        self
    }
}
