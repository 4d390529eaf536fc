//! Platform-independent USB 2.0 protocol definitions.
//!
//! SETUP packet parsing, the standard request and descriptor-type
//! vocabulary, and serializers for the basic standard descriptors. The
//! serializers produce the packed wire layouts published in the USB 2.0
//! specification; applications typically build their descriptors once at
//! startup and hand the driver byte slices.

use core::fmt;

/// Feature selector for CLEAR_FEATURE/SET_FEATURE targeting an endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// Feature selector for device remote wakeup (not supported by this stack).
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// Direction bit of `bEndpointAddress` and of `wIndex` when a request
/// addresses an endpoint.
pub const ENDPOINT_ADDRESS_DIR_IN: u16 = 1 << 7;

/// `bmAttributes` bit: device is self-powered.
pub const CONFIG_ATTR_SELF_POWERED: u8 = 1 << 6;
/// `bmAttributes` bit: device supports remote wakeup.
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 1 << 5;
/// `bmAttributes` bit that is always set per USB 1.1.
pub const CONFIG_ATTR_RESERVED: u8 = 1 << 7;

/// The 8-byte datastructure sent in a SETUP transaction.
#[derive(Debug, Copy, Clone)]
pub struct SetupPacket {
    pub request_type: BmRequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Parse a SETUP packet from a buffer as received from the wire.
    pub fn parse(buf: &[u8]) -> Option<SetupPacket> {
        if buf.len() != 8 {
            return None;
        }
        Some(SetupPacket {
            request_type: BmRequestType(buf[0]),
            request: buf[1],
            value: get_u16(&buf[2..4])?,
            index: get_u16(&buf[4..6])?,
            length: get_u16(&buf[6..8])?,
        })
    }

    /// If `bRequest` is a standard request code, return it.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_code(self.request)
    }
}

/// The `bmRequestType` byte of a SETUP packet.
#[derive(Copy, Clone)]
pub struct BmRequestType(pub u8);

impl BmRequestType {
    pub fn direction(self) -> TransferDirection {
        if self.0 & (1 << 7) == 0 {
            TransferDirection::HostToDevice
        } else {
            TransferDirection::DeviceToHost
        }
    }

    pub fn kind(self) -> RequestKind {
        match (self.0 >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & 0b11111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }
}

impl fmt::Debug for BmRequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{{:?}, {:?}, {:?}}}",
            self.direction(),
            self.kind(),
            self.recipient()
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// Standard device request codes (USB 2.0 table 9-4).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus,
    ClearFeature,
    SetFeature,
    SetAddress,
    GetDescriptor,
    SetDescriptor,
    GetConfiguration,
    SetConfiguration,
    GetInterface,
    SetInterface,
    SynchFrame,
}

impl StandardRequest {
    pub fn from_code(code: u8) -> Option<StandardRequest> {
        match code {
            0 => Some(StandardRequest::GetStatus),
            1 => Some(StandardRequest::ClearFeature),
            3 => Some(StandardRequest::SetFeature),
            5 => Some(StandardRequest::SetAddress),
            6 => Some(StandardRequest::GetDescriptor),
            7 => Some(StandardRequest::SetDescriptor),
            8 => Some(StandardRequest::GetConfiguration),
            9 => Some(StandardRequest::SetConfiguration),
            10 => Some(StandardRequest::GetInterface),
            11 => Some(StandardRequest::SetInterface),
            12 => Some(StandardRequest::SynchFrame),
            _ => None,
        }
    }
}

/// Standard descriptor types (USB 2.0 table 9-5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Hid = 0x21,
}

impl DescriptorType {
    pub fn from_byte(byte: u8) -> Option<DescriptorType> {
        match byte {
            1 => Some(DescriptorType::Device),
            2 => Some(DescriptorType::Configuration),
            3 => Some(DescriptorType::String),
            4 => Some(DescriptorType::Interface),
            5 => Some(DescriptorType::Endpoint),
            6 => Some(DescriptorType::DeviceQualifier),
            7 => Some(DescriptorType::OtherSpeedConfiguration),
            8 => Some(DescriptorType::InterfacePower),
            0x21 => Some(DescriptorType::Hid),
            _ => None,
        }
    }
}

/// A serializable descriptor.
pub trait Descriptor {
    /// Serialized size in bytes.
    fn size(&self) -> usize;

    /// Serialize to a buffer for transmission on the bus; returns the
    /// number of bytes written. The buffer must hold at least `size()`
    /// bytes.
    fn write_to(&self, buf: &mut [u8]) -> usize;
}

pub struct DeviceDescriptor {
    /// 0x0100 (USB 1.0), 0x0110 (USB 1.1) or 0x0200 (USB 2.0).
    pub usb_release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_ep0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number, binary coded decimal.
    pub device_release: u16,
    pub manufacturer_string: u8,
    pub product_string: u8,
    pub serial_number_string: u8,
    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        DeviceDescriptor {
            usb_release: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size_ep0: 64,
            vendor_id: 0x6667,
            product_id: 0xabcd,
            device_release: 0x0001,
            manufacturer_string: 0,
            product_string: 0,
            serial_number_string: 0,
            num_configurations: 1,
        }
    }
}

impl Descriptor for DeviceDescriptor {
    fn size(&self) -> usize {
        18
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        b[0] = 18;
        b[1] = DescriptorType::Device as u8;
        put_u16(&mut b[2..4], self.usb_release);
        b[4] = self.class;
        b[5] = self.subclass;
        b[6] = self.protocol;
        b[7] = self.max_packet_size_ep0;
        put_u16(&mut b[8..10], self.vendor_id);
        put_u16(&mut b[10..12], self.product_id);
        put_u16(&mut b[12..14], self.device_release);
        b[14] = self.manufacturer_string;
        b[15] = self.product_string;
        b[16] = self.serial_number_string;
        b[17] = self.num_configurations;
        18
    }
}

pub struct ConfigurationDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub is_self_powered: bool,
    pub supports_remote_wakeup: bool,
    /// Maximum bus power draw, in 2 mA units.
    pub max_power: u8,
    /// Combined length of the interface, class and endpoint descriptors
    /// that follow this one in the configuration block.
    pub related_descriptor_length: usize,
}

impl Default for ConfigurationDescriptor {
    fn default() -> Self {
        ConfigurationDescriptor {
            num_interfaces: 1,
            configuration_value: 1,
            string_index: 0,
            is_self_powered: true,
            supports_remote_wakeup: false,
            max_power: 0,
            related_descriptor_length: 0,
        }
    }
}

impl Descriptor for ConfigurationDescriptor {
    fn size(&self) -> usize {
        9
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        b[0] = 9;
        b[1] = DescriptorType::Configuration as u8;
        put_u16(&mut b[2..4], (9 + self.related_descriptor_length) as u16);
        b[4] = self.num_interfaces;
        b[5] = self.configuration_value;
        b[6] = self.string_index;
        b[7] = CONFIG_ATTR_RESERVED
            | if self.is_self_powered {
                CONFIG_ATTR_SELF_POWERED
            } else {
                0
            }
            | if self.supports_remote_wakeup {
                CONFIG_ATTR_REMOTE_WAKEUP
            } else {
                0
            };
        b[8] = self.max_power;
        9
    }
}

pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    /// Endpoints used by this interface, excluding endpoint 0.
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        InterfaceDescriptor {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 0,
            interface_class: 0xff, // vendor specific
            interface_subclass: 0,
            interface_protocol: 0,
            string_index: 0,
        }
    }
}

impl Descriptor for InterfaceDescriptor {
    fn size(&self) -> usize {
        9
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        b[0] = 9;
        b[1] = DescriptorType::Interface as u8;
        b[2] = self.interface_number;
        b[3] = self.alternate_setting;
        b[4] = self.num_endpoints;
        b[5] = self.interface_class;
        b[6] = self.interface_subclass;
        b[7] = self.interface_protocol;
        b[8] = self.string_index;
        9
    }
}

/// Endpoint transfer type as encoded in `bmAttributes` of an endpoint
/// descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointAttributes {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

pub struct EndpointDescriptor {
    /// Endpoint number in bits 3:0, direction in bit 7.
    pub endpoint_address: u8,
    pub attributes: EndpointAttributes,
    pub max_packet_size: u16,
    /// Polling interval in frames.
    pub interval: u8,
}

impl Descriptor for EndpointDescriptor {
    fn size(&self) -> usize {
        7
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        b[0] = 7;
        b[1] = DescriptorType::Endpoint as u8;
        b[2] = self.endpoint_address;
        // Synchronization and usage bits stay zero: no-sync data endpoint.
        b[3] = self.attributes as u8;
        put_u16(&mut b[4..6], self.max_packet_size & 0x7ff);
        b[6] = self.interval;
        7
    }
}

/// HID class descriptor, placed between an interface descriptor and its
/// endpoint descriptors in the configuration block.
pub struct HidDescriptor {
    /// HID class specification release, binary coded decimal.
    pub hid_release: u16,
    pub country_code: u8,
    pub report_descriptor_length: u16,
}

impl Default for HidDescriptor {
    fn default() -> Self {
        HidDescriptor {
            hid_release: 0x0111,
            country_code: 0,
            report_descriptor_length: 0,
        }
    }
}

impl Descriptor for HidDescriptor {
    fn size(&self) -> usize {
        9
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        b[0] = 9;
        b[1] = DescriptorType::Hid as u8;
        put_u16(&mut b[2..4], self.hid_release);
        b[4] = self.country_code;
        b[5] = 1; // one class descriptor follows
        b[6] = 0x22; // of type Report
        put_u16(&mut b[7..9], self.report_descriptor_length);
        9
    }
}

/// String descriptor zero: the list of supported language identifiers.
pub struct LanguagesDescriptor<'a> {
    pub langs: &'a [u16],
}

impl Descriptor for LanguagesDescriptor<'_> {
    fn size(&self) -> usize {
        2 + 2 * self.langs.len()
    }

    fn write_to(&self, b: &mut [u8]) -> usize {
        let len = self.size();
        b[0] = len as u8;
        b[1] = DescriptorType::String as u8;
        for (i, lang) in self.langs.iter().enumerate() {
            put_u16(&mut b[2 + 2 * i..4 + 2 * i], *lang);
        }
        len
    }
}

pub struct StringDescriptor<'a> {
    pub string: &'a str,
}

impl Descriptor for StringDescriptor<'_> {
    fn size(&self) -> usize {
        let mut len = 2;
        for ch in self.string.chars() {
            len += 2 * ch.len_utf16();
        }
        len
    }

    // UTF-16LE code units.
    fn write_to(&self, b: &mut [u8]) -> usize {
        b[1] = DescriptorType::String as u8;
        let mut i = 2;
        for ch in self.string.chars() {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                put_u16(&mut b[i..i + 2], *unit);
                i += 2;
            }
        }
        b[0] = i as u8;
        i
    }
}

/// Parse a `u16` from a two-byte buffer as received on the bus.
pub fn get_u16(buf: &[u8]) -> Option<u16> {
    if buf.len() != 2 {
        return None;
    }
    Some(buf[0] as u16 | (buf[1] as u16) << 8)
}

/// Write a `u16` to a two-byte buffer for transmission on the bus.
pub fn put_u16(buf: &mut [u8], n: u16) {
    buf[0] = (n & 0xff) as u8;
    buf[1] = (n >> 8) as u8;
}
