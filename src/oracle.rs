//! The canonical descriptor tree responses are checked against.
//!
//! A [`DeviceOracle`] is immutable once built. Scenarios borrow it; nothing mutates it while a
//! scenario runs.
//!
//! # Descriptor files
//!
//! [`DeviceOracle::load`] reads a concatenation of raw descriptors in this order:
//!
//! 1. the 18-byte device descriptor;
//! 2. each configuration descriptor followed by its interface/endpoint/class chain, exactly
//!    `wTotalLength` bytes per configuration;
//! 3. string descriptor zero (the language table), if the device has strings;
//! 4. one run of string descriptors per advertised language, in table order, each run holding
//!    indices 1, 2, ... of that language.

use crate::usb::{
    DescriptorIter, DeviceDescriptor, UsbDescriptorType, UsbEndpointDescriptor,
    CONFIGURATION_DESCRIPTOR_LEN, DEVICE_DESCRIPTOR_LEN,
};
use crate::EndpointInfo;
use failure::{bail, format_err, Error, ResultExt};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

#[derive(Clone, Debug)]
pub struct InterfaceImage {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpointDescriptor>,
}

/// One configuration descriptor with its full chain.
#[derive(Clone, Debug)]
pub struct ConfigurationImage {
    bytes: Vec<u8>,
    interfaces: Vec<InterfaceImage>,
}

impl ConfigurationImage {
    /// Validates the header, checks `wTotalLength` against the chain and indexes interfaces.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() < CONFIGURATION_DESCRIPTOR_LEN
            || bytes[0] as usize != CONFIGURATION_DESCRIPTOR_LEN
            || bytes[1] != UsbDescriptorType::Configuration as u8
        {
            bail!("Malformed configuration descriptor header");
        }
        let total_length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        if total_length != bytes.len() {
            bail!(
                "wTotalLength is {} but the configuration chain has {} bytes",
                total_length,
                bytes.len()
            );
        }

        let mut interfaces: Vec<InterfaceImage> = Vec::new();
        for raw in DescriptorIter::new(&bytes[CONFIGURATION_DESCRIPTOR_LEN..]) {
            let raw = raw?;
            match UsbDescriptorType::from_u8(raw.descriptor_type) {
                Some(UsbDescriptorType::Interface) => {
                    if raw.bytes.len() != 9 {
                        bail!("Malformed interface descriptor: {:02x?}", raw.bytes);
                    }
                    interfaces.push(InterfaceImage {
                        number: raw.bytes[2],
                        alternate_setting: raw.bytes[3],
                        class: raw.bytes[5],
                        sub_class: raw.bytes[6],
                        protocol: raw.bytes[7],
                        endpoints: Vec::new(),
                    });
                }
                Some(UsbDescriptorType::Endpoint) => {
                    let endpoint = UsbEndpointDescriptor::parse(raw.bytes)?;
                    match interfaces.last_mut() {
                        Some(interface) => interface.endpoints.push(endpoint),
                        None => bail!("Endpoint descriptor precedes every interface"),
                    }
                }
                Some(UsbDescriptorType::Device)
                | Some(UsbDescriptorType::Configuration)
                | Some(UsbDescriptorType::String) => {
                    bail!(
                        "Descriptor type {} inside a configuration chain",
                        raw.descriptor_type
                    );
                }
                // class-specific
                None => {}
            }
        }

        Ok(ConfigurationImage { bytes, interfaces })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `bConfigurationValue`
    pub fn value(&self) -> u8 {
        self.bytes[5]
    }

    /// `wTotalLength`
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn interfaces(&self) -> &[InterfaceImage] {
        &self.interfaces
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &UsbEndpointDescriptor> + '_ {
        self.interfaces.iter().flat_map(|i| i.endpoints.iter())
    }

    /// The bulk OUT and bulk IN endpoint of the first interface that has both.
    pub fn loopback_pair(&self) -> Option<(EndpointAddress, EndpointAddress)> {
        self.interfaces.iter().find_map(|interface| {
            let bulk = |direction: UsbDirection| {
                interface
                    .endpoints
                    .iter()
                    .find(|ep| ep.ep_type() == EndpointType::Bulk && ep.direction() == direction)
                    .map(|ep| ep.address)
            };
            Some((bulk(UsbDirection::Out)?, bulk(UsbDirection::In)?))
        })
    }
}

fn check_string_descriptor(bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() < 2
        || bytes[0] as usize != bytes.len()
        || bytes[1] != UsbDescriptorType::String as u8
        || bytes.len() % 2 != 0
    {
        bail!("Malformed string descriptor: {:02x?}", bytes);
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct DeviceOracle {
    device_bytes: Vec<u8>,
    device: DeviceDescriptor,
    configurations: Vec<ConfigurationImage>,
    string_zero: Option<Vec<u8>>,
    lang_ids: Vec<u16>,
    strings: BTreeMap<(u16, u8), Vec<u8>>,
}

impl DeviceOracle {
    /// Builds an oracle from canonical encodings.
    ///
    /// `configurations` are in descriptor-index order; `strings` are keyed by
    /// (language ID, string index).
    pub fn new(
        device_bytes: Vec<u8>,
        configurations: Vec<Vec<u8>>,
        string_zero: Option<Vec<u8>>,
        strings: BTreeMap<(u16, u8), Vec<u8>>,
    ) -> Result<Self, Error> {
        let device = DeviceDescriptor::parse(&device_bytes)?;
        let configurations = configurations
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| {
                ConfigurationImage::parse(bytes)
                    .with_context(|_| format!("configuration descriptor {}", i))
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        if configurations.len() != device.num_configurations as usize {
            bail!(
                "Device declares {} configurations, {} supplied",
                device.num_configurations,
                configurations.len()
            );
        }

        let lang_ids = match &string_zero {
            Some(zero) => {
                check_string_descriptor(zero)?;
                zero[2..]
                    .chunks(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect()
            }
            None => Vec::new(),
        };
        for (&(lang_id, index), bytes) in &strings {
            check_string_descriptor(bytes)
                .with_context(|_| format!("string {} for language {:#06x}", index, lang_id))?;
            if index == 0 || !lang_ids.contains(&lang_id) {
                bail!(
                    "String {} is filed under language {:#06x}, which string zero does not list",
                    index,
                    lang_id
                );
            }
        }
        if let Some(&first) = lang_ids.first() {
            for index in device.string_indices() {
                if !strings.contains_key(&(first, index)) {
                    bail!(
                        "Device references string {} but language {:#06x} has none",
                        index,
                        first
                    );
                }
            }
        } else if !device.string_indices().is_empty() {
            bail!("Device references strings but has no string descriptor zero");
        }

        Ok(DeviceOracle {
            device_bytes,
            device,
            configurations,
            string_zero,
            lang_ids,
            strings,
        })
    }

    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn device_bytes(&self) -> &[u8] {
        &self.device_bytes
    }

    /// Configuration with the given `bConfigurationValue`.
    pub fn configuration(&self, value: u8) -> Option<&ConfigurationImage> {
        self.configurations.iter().find(|c| c.value() == value)
    }

    /// Configuration at a GET_DESCRIPTOR index (zero-based).
    pub fn configuration_at(&self, index: u8) -> Option<&ConfigurationImage> {
        self.configurations.get(index as usize)
    }

    pub fn configurations(&self) -> &[ConfigurationImage] {
        &self.configurations
    }

    /// Languages advertised by string descriptor zero.
    pub fn lang_ids(&self) -> &[u16] {
        &self.lang_ids
    }

    pub fn string_zero(&self) -> Option<&[u8]> {
        self.string_zero.as_deref()
    }

    pub fn string(&self, lang_id: u16, index: u8) -> Option<&[u8]> {
        if index == 0 {
            return self.string_zero();
        }
        self.strings.get(&(lang_id, index)).map(Vec::as_slice)
    }

    /// Full canonical encoding GET_DESCRIPTOR(kind, index, lang_id) would return.
    pub fn descriptor(&self, kind: UsbDescriptorType, index: u8, lang_id: u16) -> Option<&[u8]> {
        match kind {
            UsbDescriptorType::Device if index == 0 => Some(&self.device_bytes),
            UsbDescriptorType::Configuration => self.configuration_at(index).map(|c| c.bytes()),
            UsbDescriptorType::String => self.string(lang_id, index),
            _ => None,
        }
    }

    /// The first `length` bytes of a descriptor, or all of it when `length` exceeds it.
    pub fn read(
        &self,
        kind: UsbDescriptorType,
        index: u8,
        lang_id: u16,
        length: u16,
    ) -> Option<&[u8]> {
        self.descriptor(kind, index, lang_id)
            .map(|bytes| &bytes[..bytes.len().min(length as usize)])
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, Error> {
        let mut descriptors = DescriptorIter::new(blob);
        let device_bytes = match descriptors.next() {
            Some(raw) => {
                let raw = raw?;
                if raw.bytes.len() != DEVICE_DESCRIPTOR_LEN
                    || raw.descriptor_type != UsbDescriptorType::Device as u8
                {
                    bail!("Descriptor file must start with the device descriptor");
                }
                raw.bytes.to_vec()
            }
            None => bail!("Empty descriptor file"),
        };

        let mut configurations = Vec::new();
        let mut string_descriptors = Vec::new();
        let mut cursor = DEVICE_DESCRIPTOR_LEN;
        while cursor < blob.len() {
            let rest = &blob[cursor..];
            let raw = DescriptorIter::new(rest)
                .next()
                .ok_or_else(|| format_err!("Truncated descriptor at offset {}", cursor))??;
            match UsbDescriptorType::from_u8(raw.descriptor_type) {
                Some(UsbDescriptorType::Configuration) if string_descriptors.is_empty() => {
                    if rest.len() < 4 {
                        bail!("Truncated configuration descriptor at offset {}", cursor);
                    }
                    let total_length = u16::from_le_bytes([rest[2], rest[3]]) as usize;
                    if total_length < CONFIGURATION_DESCRIPTOR_LEN || total_length > rest.len() {
                        bail!(
                            "Configuration at offset {} declares wTotalLength {} with {} bytes left",
                            cursor,
                            total_length,
                            rest.len()
                        );
                    }
                    configurations.push(rest[..total_length].to_vec());
                    cursor += total_length;
                }
                Some(UsbDescriptorType::String) => {
                    string_descriptors.push(raw.bytes.to_vec());
                    cursor += raw.bytes.len();
                }
                _ => bail!(
                    "Unexpected descriptor type {} at offset {}",
                    raw.descriptor_type,
                    cursor
                ),
            }
        }

        let mut string_descriptors = string_descriptors.into_iter();
        let string_zero = string_descriptors.next();
        let runs: Vec<Vec<u8>> = string_descriptors.collect();
        let mut strings = BTreeMap::new();
        if let Some(zero) = &string_zero {
            check_string_descriptor(zero)?;
            let lang_ids: Vec<u16> = zero[2..]
                .chunks(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            if lang_ids.is_empty() && !runs.is_empty() {
                bail!("String descriptors present but string zero lists no language");
            }
            if !lang_ids.is_empty() {
                if runs.len() % lang_ids.len() != 0 {
                    bail!(
                        "{} string descriptors do not split evenly over {} languages",
                        runs.len(),
                        lang_ids.len()
                    );
                }
                let per_language = runs.len() / lang_ids.len();
                for (i, bytes) in runs.into_iter().enumerate() {
                    let lang_id = lang_ids[i / per_language];
                    let index = (i % per_language + 1) as u8;
                    strings.insert((lang_id, index), bytes);
                }
            }
        }

        debug!(
            "loaded descriptor file: {} configurations, {} strings",
            configurations.len(),
            strings.len()
        );
        DeviceOracle::new(device_bytes, configurations, string_zero, strings)
    }

    /// Serializes the oracle in the descriptor-file layout [`DeviceOracle::from_blob`] reads.
    ///
    /// String indices are written in ascending order per language; gaps are not preserved.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = self.device_bytes.clone();
        for configuration in &self.configurations {
            blob.extend_from_slice(configuration.bytes());
        }
        if let Some(zero) = &self.string_zero {
            blob.extend_from_slice(zero);
            for &lang_id in &self.lang_ids {
                for ((_, _), bytes) in self.strings.range((lang_id, 1)..=(lang_id, u8::MAX)) {
                    blob.extend_from_slice(bytes);
                }
            }
        }
        blob
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let blob = fs::read(path)
            .with_context(|_| format!("Can't read descriptor file {}", path.display()))?;
        let oracle = DeviceOracle::from_blob(&blob)
            .with_context(|_| format!("Invalid descriptor file {}", path.display()))?;
        Ok(oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::cdc_loopback_device;

    #[test]
    fn partial_reads_are_prefixes() {
        let oracle = cdc_loopback_device().unwrap();
        let config = oracle.configuration(1).unwrap();
        for length in [0u16, 1, 9, config.total_length() - 1].iter() {
            let read = oracle
                .read(UsbDescriptorType::Configuration, 0, 0, *length)
                .unwrap();
            assert_eq!(read, &config.bytes()[..*length as usize]);
        }
        let whole = oracle
            .read(UsbDescriptorType::Configuration, 0, 0, u16::MAX)
            .unwrap();
        assert_eq!(whole.len(), config.total_length() as usize);
    }

    #[test]
    fn blob_roundtrip_preserves_every_descriptor() {
        let oracle = cdc_loopback_device().unwrap();
        let reloaded = DeviceOracle::from_blob(&oracle.to_blob()).unwrap();
        assert_eq!(reloaded.device_bytes(), oracle.device_bytes());
        assert_eq!(
            reloaded.configuration(1).unwrap().bytes(),
            oracle.configuration(1).unwrap().bytes()
        );
        assert_eq!(reloaded.lang_ids(), oracle.lang_ids());
        for index in oracle.device_descriptor().string_indices() {
            let lang = oracle.lang_ids()[0];
            assert_eq!(reloaded.string(lang, index), oracle.string(lang, index));
        }
    }

    #[test]
    fn wrong_total_length_is_rejected() {
        let oracle = cdc_loopback_device().unwrap();
        let mut bytes = oracle.configuration(1).unwrap().bytes().to_vec();
        bytes[2] = bytes[2].wrapping_add(1);
        assert!(ConfigurationImage::parse(bytes).is_err());
    }

    #[test]
    fn blob_must_start_with_device_descriptor() {
        let oracle = cdc_loopback_device().unwrap();
        let blob = oracle.configuration(1).unwrap().bytes().to_vec();
        assert!(DeviceOracle::from_blob(&blob).is_err());
        assert!(DeviceOracle::from_blob(&[]).is_err());
    }

    #[test]
    fn loopback_pair_comes_from_the_data_interface() {
        let oracle = cdc_loopback_device().unwrap();
        let (out_ep, in_ep) = oracle.configuration(1).unwrap().loopback_pair().unwrap();
        assert_eq!(out_ep.direction(), UsbDirection::Out);
        assert_eq!(in_ep.direction(), UsbDirection::In);
        assert_ne!(out_ep.index(), in_ep.index());
    }
}
