use crate::oracle::DeviceOracle;
use crate::usb::{
    UsbConfigurationDescriptor, UsbCustomDescriptor, UsbDescriptorWriter, UsbDeviceDescriptor,
    UsbEndpointDescriptor, UsbInterfaceDescriptor, UsbString, UsbStringAllocator,
};
use bit_field::BitField;
use failure::{bail, err_msg, Error};
use std::collections::BTreeMap;
use usb_device::descriptor::lang_id;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

/// A USB vendor ID and product ID pair.
pub struct UsbVidPid(pub u16, pub u16);

macro_rules! generate_field_setters {
    ( $( $(#[$meta:meta])* $name:ident: $type:ty, )* ) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, $name: $type) -> Self {
                self.descriptor.$name = $name;
                self
            }
        )*
    }
}

/// Describes the expected device and produces its [`DeviceOracle`].
pub struct DeviceBuilder {
    pub descriptor: UsbDeviceDescriptor,
    pub configuration_desc: UsbConfigurationDescriptor,
    pub interfaces: Vec<InterfaceBuilder>,
    pub languages: Vec<u16>,
}

impl DeviceBuilder {
    pub fn new(vid_pid: UsbVidPid) -> Self {
        Self {
            descriptor: UsbDeviceDescriptor {
                device_class: 0,
                device_sub_class: 0,
                device_protocol: 0,
                max_packet_size_0: 8,
                vendor_id: vid_pid.0,
                product_id: vid_pid.1,
                device_release: 0x0010,
                manufacturer: UsbString::None,
                product: UsbString::None,
                serial_number: UsbString::None,
            },
            configuration_desc: UsbConfigurationDescriptor {
                configuration_value: 1,
                configuration_string: UsbString::None,
                attributes: 0x80,
                max_power: 50,
            },
            interfaces: Vec::new(),
            languages: vec![lang_id::ENGLISH_US],
        }
    }

    generate_field_setters! {
        /// Sets the device class code assigned by USB.org. `0xff` marks a vendor-specific
        /// device.
        ///
        /// Default: `0x00` (each interface names its own class)
        device_class: u8,

        /// Sets the device sub-class code. Its meaning depends on the class.
        ///
        /// Default: `0x00`
        device_sub_class: u8,

        /// Sets the device protocol code. Its meaning depends on class and sub-class.
        ///
        /// Default: `0x00`
        device_protocol: u8,

        /// Sets the device release number in BCD.
        ///
        /// Default: `0x0010` ("0.1")
        device_release: u16,
    }

    /// Sets the maximum packet size in bytes for the control endpoint 0.
    ///
    /// Valid values are 8, 16, 32 and 64. Small sizes split descriptor reads into several
    /// DATA stages, which is what most enumeration checks want to exercise.
    ///
    /// Default: 8 bytes
    pub fn max_packet_size_0(mut self, max_packet_size_0: u8) -> Result<Self, Error> {
        match max_packet_size_0 {
            8 | 16 | 32 | 64 => {}
            _ => bail!("Invalid max_packet_size_0 {}", max_packet_size_0),
        }

        self.descriptor.max_packet_size_0 = max_packet_size_0;
        Ok(self)
    }

    /// Sets whether the device may have an external power source.
    ///
    /// The bit is reported in bmAttributes and in the answer to a device GET_STATUS.
    ///
    /// Default: `false`
    ///
    /// See also: `max_power`
    pub fn self_powered(mut self, self_powered: bool) -> Self {
        self.configuration_desc.attributes.set_bit(6, self_powered);
        self
    }

    /// Sets whether the device can wake the host up from suspend.
    ///
    /// Default: `false`
    pub fn supports_remote_wakeup(mut self, supports_remote_wakeup: bool) -> Self {
        self.configuration_desc
            .attributes
            .set_bit(5, supports_remote_wakeup);
        self
    }

    /// Sets the maximum current drawn from the bus in milliamps. Values above 500 mA are
    /// rejected; the descriptor stores the value in 2 mA units.
    ///
    /// See also: `self_powered`
    ///
    /// Default: 100mA
    pub fn max_power(mut self, max_power_ma: usize) -> Result<Self, Error> {
        if max_power_ma > 500 {
            bail!("max_power of {} mA is too much", max_power_ma);
        }

        self.configuration_desc.max_power = (max_power_ma / 2) as u8;
        Ok(self)
    }

    /// Sets the manufacturer name string descriptor.
    ///
    /// Default: (none)
    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.descriptor.manufacturer = UsbString::Const(manufacturer.into());
        self
    }

    /// Sets the product name string descriptor.
    ///
    /// Default: (none)
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.descriptor.product = UsbString::Const(product.into());
        self
    }

    /// Sets the serial number string descriptor.
    ///
    /// Default: (none)
    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.descriptor.serial_number = UsbString::Const(serial_number.into());
        self
    }

    /// Sets the configuration string descriptor.
    ///
    /// Default: (none)
    pub fn configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration_desc.configuration_string = UsbString::Const(configuration.into());
        self
    }

    /// Sets the language table of string descriptor zero. Every string is served with the same
    /// text under each language.
    ///
    /// Default: English (US)
    pub fn languages(mut self, languages: &[u16]) -> Self {
        self.languages = languages.to_vec();
        self
    }

    fn add_interface(&mut self, interface: InterfaceBuilder) -> Result<(), Error> {
        let index = interface.descriptor.interface_number as usize;
        if index >= self.interfaces.len() {
            bail!("Interface {} was not allocated", index);
        }
        if interface.descriptor.alternate_setting != 0 {
            bail!("Alternate settings are not supported");
        }

        self.interfaces[index] = interface;
        Ok(())
    }

    pub fn alloc_interface(&mut self) -> InterfaceBuilder {
        let index = self.interfaces.len();
        let builder = InterfaceBuilder::new(index as u8);
        self.interfaces.push(builder.clone());
        builder
    }

    pub fn build(self) -> Result<DeviceOracle, Error> {
        if self.interfaces.is_empty() {
            bail!("Device has no interfaces");
        }

        // Allocate strings
        let mut str_alloc = UsbStringAllocator::new();
        str_alloc.alloc(&self.descriptor.manufacturer);
        str_alloc.alloc(&self.descriptor.product);
        str_alloc.alloc(&self.descriptor.serial_number);
        str_alloc.alloc(&self.configuration_desc.configuration_string);
        for interface in &self.interfaces {
            str_alloc.alloc(&interface.descriptor.interface_string);
        }

        // Generate device descriptor
        let mut w = UsbDescriptorWriter::new();
        w.device(&self.descriptor, 1, &str_alloc)?;
        let device_descriptor = w.finish();

        // Generate configuration descriptor
        let mut w = UsbDescriptorWriter::new();
        w.configuration(&self.configuration_desc, &str_alloc)?;
        for interface in &self.interfaces {
            w.interface(&interface.descriptor, &str_alloc)?;
            for custom in &interface.custom_descriptors {
                w.custom_descriptor(custom);
            }
            for endpoint in &interface.endpoints {
                w.endpoint(endpoint)?;
            }
        }
        let configuration_descriptor = w.finish();

        // Generate string descriptors
        let strings = str_alloc.into_inner();
        let mut string_zero = None;
        let mut string_descriptors = BTreeMap::new();
        if strings.len() > 1 {
            if self.languages.is_empty() {
                bail!("Strings are defined but no language is");
            }
            let mut w = UsbDescriptorWriter::new();
            w.languages(&self.languages);
            string_zero = Some(w.finish());

            for (i, s) in strings.into_iter().enumerate() {
                if let UsbString::Const(s) = s {
                    for &lang in &self.languages {
                        let mut w = UsbDescriptorWriter::new();
                        w.string(&s);
                        string_descriptors.insert((lang, i as u8), w.finish());
                    }
                }
            }
        }

        DeviceOracle::new(
            device_descriptor,
            vec![configuration_descriptor],
            string_zero,
            string_descriptors,
        )
    }
}

#[derive(Clone)]
pub struct InterfaceBuilder {
    pub descriptor: UsbInterfaceDescriptor,
    pub custom_descriptors: Vec<UsbCustomDescriptor>,
    pub endpoints: Vec<UsbEndpointDescriptor>,
}

impl InterfaceBuilder {
    fn new(interface_number: u8) -> Self {
        Self {
            descriptor: UsbInterfaceDescriptor {
                interface_number,
                alternate_setting: 0,
                interface_class: 0,
                interface_sub_class: 0,
                interface_protocol: 0,
                interface_string: UsbString::None,
            },
            custom_descriptors: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    generate_field_setters! {
        interface_class: u8,
        interface_sub_class: u8,
        interface_protocol: u8,
    }

    pub fn interface_string(mut self, name: impl Into<String>) -> Self {
        self.descriptor.interface_string = UsbString::Const(name.into());
        self
    }

    pub fn descriptor(mut self, descriptor_type: u8, descriptor: &[u8]) -> Self {
        let custom_descriptor = UsbCustomDescriptor {
            descriptor_type,
            data: descriptor.to_vec(),
        };
        self.custom_descriptors.push(custom_descriptor);
        self
    }

    pub fn endpoint(mut self, endpoint: UsbEndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn save(self, device: &mut DeviceBuilder) -> Result<(), Error> {
        device.add_interface(self)
    }
}

pub struct EndpointBuilder {
    pub number: Option<u8>,
    pub direction: Option<UsbDirection>,
    pub ep_type: Option<EndpointType>,
    pub max_packet_size: Option<u16>,
    pub interval: u8,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            number: None,
            direction: None,
            ep_type: None,
            max_packet_size: None,
            interval: 0,
        }
    }

    pub fn number(mut self, number: u8) -> Self {
        self.number = Some(number);
        self
    }

    pub fn direction(mut self, direction: UsbDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn ep_type(mut self, ep_type: EndpointType) -> Self {
        self.ep_type = Some(ep_type);
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u16) -> Self {
        self.max_packet_size = Some(max_packet_size);
        self
    }

    pub fn interval(mut self, interval: u8) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Result<UsbEndpointDescriptor, Error> {
        let number = self.number.ok_or_else(|| err_msg("Endpoint number is not set"))?;
        let direction = self
            .direction
            .ok_or_else(|| err_msg("Endpoint direction is not set"))?;
        let ep_type = self.ep_type.ok_or_else(|| err_msg("Endpoint type is not set"))?;
        let max_packet_size = self
            .max_packet_size
            .ok_or_else(|| err_msg("Max packet size is not set"))?;
        if number == 0 || number as usize >= crate::usb::USB_MAX_ENDPOINTS {
            bail!("Endpoint number {} is out of range", number);
        }

        Ok(UsbEndpointDescriptor {
            address: EndpointAddress::from_parts(number as usize, direction),
            attributes: ep_type as u8,
            max_packet_size,
            interval: self.interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::UsbDescriptorType;

    fn bulk(number: u8, direction: UsbDirection) -> UsbEndpointDescriptor {
        EndpointBuilder::new()
            .number(number)
            .direction(direction)
            .ep_type(EndpointType::Bulk)
            .max_packet_size(64)
            .build()
            .unwrap()
    }

    #[test]
    fn builds_device_with_strings() {
        let mut device = DeviceBuilder::new(UsbVidPid(0x1209, 0x0001))
            .manufacturer("Acme")
            .product("Widget")
            .max_packet_size_0(64)
            .unwrap();
        device
            .alloc_interface()
            .interface_class(0xff)
            .endpoint(bulk(1, UsbDirection::Out))
            .endpoint(bulk(1, UsbDirection::In))
            .save(&mut device)
            .unwrap();
        let oracle = device.build().unwrap();

        let desc = oracle.device_descriptor();
        assert_eq!(desc.vendor_id, 0x1209);
        assert_eq!(desc.max_packet_size_0, 64);
        assert_eq!(desc.string_indices(), vec![1, 2]);
        assert_eq!(oracle.lang_ids(), &[lang_id::ENGLISH_US]);
        assert_eq!(
            oracle.string(lang_id::ENGLISH_US, 1).unwrap(),
            &[10, 3, b'A', 0, b'c', 0, b'm', 0, b'e', 0][..]
        );
        let config = oracle.configuration(1).unwrap();
        assert_eq!(config.total_length(), 9 + 9 + 7 + 7);
        assert_eq!(
            oracle
                .read(UsbDescriptorType::Configuration, 0, 0, 9)
                .unwrap()
                .len(),
            9
        );
    }

    #[test]
    fn device_without_strings_has_no_string_zero() {
        let mut device = DeviceBuilder::new(UsbVidPid(0x1209, 0x0002));
        device
            .alloc_interface()
            .endpoint(bulk(2, UsbDirection::In))
            .save(&mut device)
            .unwrap();
        let oracle = device.build().unwrap();
        assert!(oracle.string_zero().is_none());
        assert!(oracle.device_descriptor().string_indices().is_empty());
    }

    #[test]
    fn invalid_settings_are_errors() {
        assert!(DeviceBuilder::new(UsbVidPid(0, 0)).max_packet_size_0(12).is_err());
        assert!(DeviceBuilder::new(UsbVidPid(0, 0)).max_power(600).is_err());
        assert!(EndpointBuilder::new().number(1).build().is_err());
        assert!(DeviceBuilder::new(UsbVidPid(0, 0)).build().is_err());
    }

    #[test]
    fn configuration_attributes_and_string() {
        let mut device = DeviceBuilder::new(UsbVidPid(0x1209, 0x0004))
            .self_powered(true)
            .supports_remote_wakeup(true)
            .max_power(100)
            .unwrap()
            .configuration("Loopback");
        device
            .alloc_interface()
            .interface_string("Data")
            .endpoint(bulk(1, UsbDirection::In))
            .save(&mut device)
            .unwrap();
        let oracle = device.build().unwrap();
        let config = oracle.configuration(1).unwrap().bytes();
        // bmAttributes, bMaxPower in 2 mA units
        assert_eq!(config[7], 0xe0);
        assert_eq!(config[8], 50);
        // iConfiguration and iInterface follow the (absent) device strings
        assert_eq!(config[6], 1);
        assert_eq!(config[9 + 8], 2);
        assert!(oracle.string(lang_id::ENGLISH_US, 2).is_some());
    }

    #[test]
    fn every_language_gets_every_string() {
        let mut device = DeviceBuilder::new(UsbVidPid(0x1209, 0x0003))
            .product("Dual")
            .languages(&[0x0409, 0x0407]);
        device
            .alloc_interface()
            .endpoint(bulk(1, UsbDirection::Out))
            .save(&mut device)
            .unwrap();
        let oracle = device.build().unwrap();
        assert_eq!(oracle.lang_ids(), &[0x0409, 0x0407]);
        assert_eq!(oracle.string(0x0409, 1), oracle.string(0x0407, 1));
    }
}
