use crate::builder::{DeviceBuilder, EndpointBuilder, UsbVidPid};
use crate::oracle::DeviceOracle;
use crate::EndpointInfo;
use failure::Error;
use usb_device::endpoint::EndpointType;
use usb_device::UsbDirection;

pub const USB_CLASS_CDC: u8 = 0x02;
const USB_CLASS_DATA: u8 = 0x0a;
const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_AT: u8 = 0x01;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

/// Adds the communication and data interfaces of a CDC-ACM function.
pub fn create_cdc_function(
    device: &mut DeviceBuilder,
    comm_ep: impl EndpointInfo,
    read_ep: impl EndpointInfo,
    write_ep: impl EndpointInfo,
) -> Result<(), Error> {
    let comm_if = device.alloc_interface();
    let data_if = device.alloc_interface();
    let comm_if_id = comm_if.descriptor.interface_number;
    let data_if_id = data_if.descriptor.interface_number;

    comm_if
        .interface_class(USB_CLASS_CDC)
        .interface_sub_class(CDC_SUBCLASS_ACM)
        .interface_protocol(CDC_PROTOCOL_AT)
        .descriptor(CS_INTERFACE, &[CDC_TYPE_HEADER, 0x10, 0x01])
        .descriptor(CS_INTERFACE, &[CDC_TYPE_CALL_MANAGEMENT, 0x00, data_if_id])
        .descriptor(CS_INTERFACE, &[CDC_TYPE_ACM, 0x00])
        .descriptor(CS_INTERFACE, &[CDC_TYPE_UNION, comm_if_id, data_if_id])
        .endpoint(comm_ep.descriptor().clone())
        .save(device)?;

    data_if
        .interface_class(USB_CLASS_DATA)
        .endpoint(write_ep.descriptor().clone())
        .endpoint(read_ep.descriptor().clone())
        .save(device)
}

/// The CDC-ACM serial device the conformance scenarios target by default.
///
/// Endpoint 0 uses 64-byte packets; notifications go out on interrupt IN 3, and the data
/// interface pairs bulk OUT 1 with bulk IN 2 so that bytes written to the former come back on
/// the latter.
pub fn cdc_loopback_device() -> Result<DeviceOracle, Error> {
    let comm_ep = EndpointBuilder::new()
        .number(3)
        .direction(UsbDirection::In)
        .ep_type(EndpointType::Interrupt)
        .max_packet_size(8)
        .interval(255)
        .build()?;
    let read_ep = EndpointBuilder::new()
        .number(1)
        .direction(UsbDirection::Out)
        .ep_type(EndpointType::Bulk)
        .max_packet_size(64)
        .build()?;
    let write_ep = EndpointBuilder::new()
        .number(2)
        .direction(UsbDirection::In)
        .ep_type(EndpointType::Bulk)
        .max_packet_size(64)
        .build()?;

    let mut device = DeviceBuilder::new(UsbVidPid(0x1209, 0x5bf0))
        .device_class(USB_CLASS_CDC)
        .manufacturer("Foosn")
        .product("Fomu CDC-ACM")
        .serial_number("0001")
        .max_packet_size_0(64)?;
    create_cdc_function(&mut device, comm_ep, read_ep, write_ep)?;
    device.build()
}
