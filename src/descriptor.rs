//! Standard USB descriptor parsing
//!
//! Only the fields the mass-storage driver acts on are extracted. All
//! multi-byte descriptor fields are little-endian on the wire.

/// `bDescriptorType` values
pub const DESCRIPTOR_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_ENDPOINT: u8 = 0x05;

/// Device descriptor (18 bytes).
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;

    /// Parses from at least the first 8 bytes of the descriptor; the fields
    /// past `bMaxPacketSize0` are zero when only the 8-byte prefix is given.
    pub fn from_bytes(raw: &[u8]) -> Option<DeviceDescriptor> {
        if raw.len() < 8 || raw[1] != DESCRIPTOR_DEVICE {
            return None;
        }
        let full = raw.len() >= Self::LEN;
        Some(DeviceDescriptor {
            max_packet_size_0: raw[7],
            vendor_id: if full {
                u16::from_le_bytes([raw[8], raw[9]])
            } else {
                0
            },
            product_id: if full {
                u16::from_le_bytes([raw[10], raw[11]])
            } else {
                0
            },
            num_configurations: if full { raw[17] } else { 0 },
        })
    }
}

/// Configuration descriptor header (9 bytes), not counting the interface
/// and endpoint descriptors that follow it in the same blob.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationHeader {
    pub total_length: u16,
    pub value: u8,
}

impl ConfigurationHeader {
    pub const LEN: usize = 9;

    pub fn from_bytes(raw: &[u8]) -> Option<ConfigurationHeader> {
        if raw.len() < Self::LEN || raw[1] != DESCRIPTOR_CONFIGURATION {
            return None;
        }
        Some(ConfigurationHeader {
            total_length: u16::from_le_bytes([raw[2], raw[3]]),
            value: raw[5],
        })
    }
}

/// Interface descriptor (9 bytes).
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub fn from_bytes(raw: &[u8]) -> Option<InterfaceDescriptor> {
        if raw.len() < Self::LEN || raw[1] != DESCRIPTOR_INTERFACE {
            return None;
        }
        Some(InterfaceDescriptor {
            number: raw[2],
            alt_setting: raw[3],
            class: raw[5],
            subclass: raw[6],
            protocol: raw[7],
        })
    }
}

/// Endpoint descriptor (7 bytes).
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// `bEndpointAddress` with the direction bit preserved
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;

    pub fn from_bytes(raw: &[u8]) -> Option<EndpointDescriptor> {
        if raw.len() < Self::LEN || raw[1] != DESCRIPTOR_ENDPOINT {
            return None;
        }
        Some(EndpointDescriptor {
            address: raw[2],
            attributes: raw[3],
            max_packet_size: u16::from_le_bytes([raw[4], raw[5]]),
            interval: raw[6],
        })
    }
}

/// Walks the descriptors packed after a configuration header, yielding
/// `(descriptor_type, descriptor_bytes)` per entry.
///
/// Stops at the first malformed length rather than guessing a resync point.
pub struct DescriptorIter<'a> {
    blob: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    /// `blob` is the full configuration blob including the 9-byte header.
    pub fn new(blob: &'a [u8]) -> DescriptorIter<'a> {
        DescriptorIter { blob, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        let rest = &self.blob[self.offset.min(self.blob.len())..];
        if rest.len() < 2 {
            return None;
        }
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            return None;
        }
        self.offset += len;
        Some((rest[1], &rest[..len]))
    }
}
