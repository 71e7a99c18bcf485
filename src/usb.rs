use bit_field::BitField;
use failure::{bail, format_err, Error};
use usb_device::endpoint::EndpointAddress;

/// Maximum number of endpoints in one direction. Specified by the USB specification.
pub const USB_MAX_ENDPOINTS: usize = 16;

/// Length of the standard device descriptor.
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Length of the configuration descriptor header (without the interface chain).
pub const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;

/// Standard descriptor types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbDescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
}

impl UsbDescriptorType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(UsbDescriptorType::Device),
            2 => Some(UsbDescriptorType::Configuration),
            3 => Some(UsbDescriptorType::String),
            4 => Some(UsbDescriptorType::Interface),
            5 => Some(UsbDescriptorType::Endpoint),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UsbDeviceDescriptor {
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer: UsbString,
    pub product: UsbString,
    pub serial_number: UsbString,
}

#[derive(Clone, Debug)]
pub struct UsbConfigurationDescriptor {
    pub configuration_value: u8,
    pub configuration_string: UsbString,
    pub attributes: u8,
    pub max_power: u8,
}

#[derive(Clone, Debug)]
pub struct UsbInterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface_string: UsbString,
}

#[derive(Clone, Debug)]
pub struct UsbEndpointDescriptor {
    pub address: EndpointAddress,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl UsbEndpointDescriptor {
    /// Parses a complete 7-byte endpoint descriptor, header included.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 7 || bytes[1] != UsbDescriptorType::Endpoint as u8 {
            bail!("Malformed endpoint descriptor: {:02x?}", bytes);
        }
        if bytes[2].get_bits(4..7) != 0 {
            bail!("Reserved bits set in bEndpointAddress {:#04x}", bytes[2]);
        }
        Ok(UsbEndpointDescriptor {
            address: EndpointAddress::from(bytes[2]),
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]).get_bits(0..11),
            interval: bytes[6],
        })
    }
}

#[derive(Clone, Debug)]
pub struct UsbCustomDescriptor {
    pub descriptor_type: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum UsbString {
    None,
    Const(String),
}

pub struct UsbStringAllocator {
    strings: Vec<UsbString>,
}

impl UsbStringAllocator {
    pub fn new() -> Self {
        Self {
            strings: vec![UsbString::None],
        }
    }

    pub fn alloc(&mut self, string: &UsbString) -> u8 {
        if let Some(index) = self.get_index(string) {
            index
        } else {
            let index = self.strings.len() as u8;
            self.strings.push(string.clone());
            index
        }
    }

    pub fn get_index(&self, string: &UsbString) -> Option<u8> {
        self.strings
            .iter()
            .position(|s| s == string)
            .map(|i| i as u8)
    }

    fn index_of(&self, string: &UsbString) -> Result<u8, Error> {
        self.get_index(string)
            .ok_or_else(|| format_err!("String {:?} was never allocated", string))
    }

    pub fn into_inner(self) -> Vec<UsbString> {
        self.strings
    }
}

pub struct UsbDescriptorWriter {
    buf: Vec<u8>,
    configuration_offset: Option<usize>,
    num_interfaces_mark: Option<usize>,
    num_endpoints_mark: Option<usize>,
}

impl UsbDescriptorWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            configuration_offset: None,
            num_interfaces_mark: None,
            num_endpoints_mark: None,
        }
    }

    pub fn write(&mut self, descriptor_type: u8, descriptor: &[u8]) {
        let length = descriptor.len();
        self.buf.push((length + 2) as u8);
        self.buf.push(descriptor_type);
        self.buf.extend_from_slice(descriptor);
    }

    fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn custom_descriptor(&mut self, descriptor: &UsbCustomDescriptor) {
        self.write(descriptor.descriptor_type, &descriptor.data);
    }

    pub fn device(
        &mut self,
        device: &UsbDeviceDescriptor,
        num_configurations: u8,
        alloc: &UsbStringAllocator,
    ) -> Result<(), Error> {
        let vendor = device.vendor_id.to_le_bytes();
        let product = device.product_id.to_le_bytes();
        let release = device.device_release.to_le_bytes();
        self.write(
            UsbDescriptorType::Device as u8,
            &[
                0x00,
                0x02,                     // bcdUSB
                device.device_class,      // bDeviceClass
                device.device_sub_class,  // bDeviceSubClass
                device.device_protocol,   // bDeviceProtocol
                device.max_packet_size_0, // bMaxPacketSize0
                vendor[0],
                vendor[1], // idVendor
                product[0],
                product[1], // idProduct
                release[0],
                release[1], // bcdDevice
                alloc.index_of(&device.manufacturer)?, // iManufacturer
                alloc.index_of(&device.product)?, // iProduct
                alloc.index_of(&device.serial_number)?, // iSerialNumber
                num_configurations,                 // bNumConfigurations
            ],
        );
        Ok(())
    }

    pub fn configuration(
        &mut self,
        conf: &UsbConfigurationDescriptor,
        alloc: &UsbStringAllocator,
    ) -> Result<(), Error> {
        self.update_configuration_length();
        self.configuration_offset = Some(self.position());
        self.num_interfaces_mark = Some(self.position() + 4);

        self.write(
            UsbDescriptorType::Configuration as u8,
            &[
                0,
                0,                                              // wTotalLength
                0,                                              // bNumInterfaces
                conf.configuration_value,                       // bConfigurationValue
                alloc.index_of(&conf.configuration_string)?,    // iConfiguration
                conf.attributes,                                // bmAttributes
                conf.max_power,                                 // bMaxPower
            ],
        );
        Ok(())
    }

    fn update_configuration_length(&mut self) {
        if let Some(offset) = self.configuration_offset {
            let length = (self.position() - offset) as u16;
            self.buf[offset + 2..offset + 4].copy_from_slice(&length.to_le_bytes());
        }
    }

    pub fn interface(
        &mut self,
        interface: &UsbInterfaceDescriptor,
        alloc: &UsbStringAllocator,
    ) -> Result<(), Error> {
        let mark = match self.num_interfaces_mark {
            Some(mark) => mark,
            None => bail!("Interface written before its configuration"),
        };
        self.buf[mark] += 1;

        self.num_endpoints_mark = Some(self.position() + 4);

        self.write(
            UsbDescriptorType::Interface as u8,
            &[
                interface.interface_number,                   // bInterfaceNumber
                interface.alternate_setting,                  // bAlternateSetting
                0,                                            // bNumEndpoints
                interface.interface_class,                    // bInterfaceClass
                interface.interface_sub_class,                // bInterfaceSubClass
                interface.interface_protocol,                 // bInterfaceProtocol
                alloc.index_of(&interface.interface_string)?, // iInterface
            ],
        );
        Ok(())
    }

    pub fn endpoint(&mut self, endpoint: &UsbEndpointDescriptor) -> Result<(), Error> {
        let mark = match self.num_endpoints_mark {
            Some(mark) => mark,
            None => bail!("Endpoint {:?} written outside of an interface", endpoint.address),
        };
        self.buf[mark] += 1;

        let mps = endpoint.max_packet_size.to_le_bytes();

        self.write(
            UsbDescriptorType::Endpoint as u8,
            &[
                endpoint.address.into(), // bEndpointAddress
                endpoint.attributes,     // bmAttributes
                mps[0],
                mps[1],            // wMaxPacketSize
                endpoint.interval, // bInterval
            ],
        );
        Ok(())
    }

    pub fn string(&mut self, string: &str) {
        let mut buf = Vec::new();
        string
            .encode_utf16()
            .for_each(|c| buf.extend_from_slice(&c.to_le_bytes()));
        self.write(UsbDescriptorType::String as u8, &buf);
    }

    /// String descriptor zero: the list of supported language IDs.
    pub fn languages(&mut self, lang_ids: &[u16]) {
        let mut buf = Vec::with_capacity(lang_ids.len() * 2);
        for lang_id in lang_ids {
            buf.extend_from_slice(&lang_id.to_le_bytes());
        }
        self.write(UsbDescriptorType::String as u8, &buf);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.update_configuration_length();
        self.buf
    }
}

/// One descriptor inside a `bLength`/`bDescriptorType` chain, header included.
#[derive(Clone, Copy, Debug)]
pub struct RawDescriptor<'a> {
    pub descriptor_type: u8,
    pub bytes: &'a [u8],
}

/// Walks a concatenated descriptor chain.
pub struct DescriptorIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<RawDescriptor<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.offset..];
        if rest.is_empty() {
            return None;
        }
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            let err = format_err!(
                "Descriptor at offset {} declares bLength {} with {} bytes left",
                self.offset,
                length,
                rest.len()
            );
            self.offset = self.buf.len();
            return Some(Err(err));
        }
        self.offset += length;
        Some(Ok(RawDescriptor {
            descriptor_type: rest[1],
            bytes: &rest[..length],
        }))
    }
}

/// Decoded fields of the 18-byte device descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != DEVICE_DESCRIPTOR_LEN
            || bytes[0] as usize != DEVICE_DESCRIPTOR_LEN
            || bytes[1] != UsbDescriptorType::Device as u8
        {
            bail!("Malformed device descriptor: {:02x?}", bytes);
        }
        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Ok(DeviceDescriptor {
            usb_release: word(2),
            device_class: bytes[4],
            device_sub_class: bytes[5],
            device_protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: word(8),
            product_id: word(10),
            device_release: word(12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Non-zero string indices referenced by the device, in descriptor order.
    pub fn string_indices(&self) -> Vec<u8> {
        [
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
        ]
        .iter()
        .copied()
        .filter(|&idx| idx != 0)
        .collect()
    }
}
