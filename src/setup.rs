//! SETUP packet encoding and the standard device requests the harness issues.

use crate::usb::UsbDescriptorType;
use bit_field::BitField;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

pub const SETUP_PACKET_LEN: usize = 8;

pub fn encode_request(req: &Request) -> [u8; SETUP_PACKET_LEN] {
    let mut request_type = 0u8;
    request_type.set_bit(7, req.direction == UsbDirection::In);
    request_type.set_bits(5..7, req.request_type as u8);
    request_type.set_bits(0..5, req.recipient as u8);

    let value = req.value.to_le_bytes();
    let index = req.index.to_le_bytes();
    let length = req.length.to_le_bytes();
    [
        request_type,
        req.request,
        value[0],
        value[1],
        index[0],
        index[1],
        length[0],
        length[1],
    ]
}

pub fn decode_request(buf: &[u8]) -> Option<Request> {
    if buf.len() != SETUP_PACKET_LEN {
        return None;
    }
    let request_type = buf[0];
    let direction = if request_type.get_bit(7) {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    let kind = match request_type.get_bits(5..7) {
        0 => RequestType::Standard,
        1 => RequestType::Class,
        2 => RequestType::Vendor,
        _ => RequestType::Reserved,
    };
    let recipient = match request_type.get_bits(0..5) {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Reserved,
    };
    Some(Request {
        direction,
        request_type: kind,
        recipient,
        request: buf[1],
        value: u16::from_le_bytes([buf[2], buf[3]]),
        index: u16::from_le_bytes([buf[4], buf[5]]),
        length: u16::from_le_bytes([buf[6], buf[7]]),
    })
}

fn standard(direction: UsbDirection, recipient: Recipient, request: u8) -> Request {
    Request {
        direction,
        request_type: RequestType::Standard,
        recipient,
        request,
        value: 0,
        index: 0,
        length: 0,
    }
}

pub fn get_descriptor_request(
    descriptor_type: UsbDescriptorType,
    descriptor_index: u8,
    lang_id: u16,
    length: u16,
) -> Request {
    Request {
        value: (descriptor_type as u16) << 8 | u16::from(descriptor_index),
        index: lang_id,
        length,
        ..standard(UsbDirection::In, Recipient::Device, Request::GET_DESCRIPTOR)
    }
}

pub fn set_address_request(address: u8) -> Request {
    Request {
        value: u16::from(address),
        ..standard(UsbDirection::Out, Recipient::Device, Request::SET_ADDRESS)
    }
}

pub fn set_configuration_request(configuration_value: u8) -> Request {
    Request {
        value: u16::from(configuration_value),
        ..standard(UsbDirection::Out, Recipient::Device, Request::SET_CONFIGURATION)
    }
}

pub fn get_configuration_request() -> Request {
    Request {
        length: 1,
        ..standard(UsbDirection::In, Recipient::Device, Request::GET_CONFIGURATION)
    }
}

pub fn set_feature_request(feature: u16, recipient: Recipient, index: u16) -> Request {
    Request {
        value: feature,
        index,
        ..standard(UsbDirection::Out, recipient, Request::SET_FEATURE)
    }
}

pub fn clear_feature_request(feature: u16, recipient: Recipient, index: u16) -> Request {
    Request {
        value: feature,
        index,
        ..standard(UsbDirection::Out, recipient, Request::CLEAR_FEATURE)
    }
}

pub fn get_status_request(recipient: Recipient, index: u16) -> Request {
    Request {
        index,
        length: 2,
        ..standard(UsbDirection::In, recipient, Request::GET_STATUS)
    }
}

/// Short name of a standard request code, for logs.
pub fn request_name(request: u8) -> &'static str {
    match request {
        Request::GET_STATUS => "GET_STATUS",
        Request::CLEAR_FEATURE => "CLEAR_FEATURE",
        Request::SET_FEATURE => "SET_FEATURE",
        Request::SET_ADDRESS => "SET_ADDRESS",
        Request::GET_DESCRIPTOR => "GET_DESCRIPTOR",
        Request::SET_DESCRIPTOR => "SET_DESCRIPTOR",
        Request::GET_CONFIGURATION => "GET_CONFIGURATION",
        Request::SET_CONFIGURATION => "SET_CONFIGURATION",
        Request::GET_INTERFACE => "GET_INTERFACE",
        Request::SET_INTERFACE => "SET_INTERFACE",
        Request::SYNCH_FRAME => "SYNCH_FRAME",
        _ => "non-standard request",
    }
}
