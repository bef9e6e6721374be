//! Per-device endpoint bookkeeping
//!
//! A mass-storage device is driven through at most four endpoints, held in
//! a fixed table keyed by role. Slot 0 is the default control endpoint and
//! always exists; the bulk pair appears while parsing the configuration
//! descriptor. An interrupt IN endpoint is recorded when the device offers
//! one, although the Bulk Only protocol never transfers on it.

use crate::descriptor::EndpointDescriptor;
use crate::host::ChannelId;

pub const MAX_ENDPOINTS: usize = 4;

/// Direction bit of `bEndpointAddress`.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Default NAK back-off exponent for a freshly cleared slot.
pub const NAK_DEFAULT: u8 = 14;

/// Table slot of an endpoint, implicit in its role.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpRole {
    Control = 0,
    DataIn = 1,
    DataOut = 2,
    InterruptIn = 3,
}

/// State of one device endpoint.
#[derive(Debug, Copy, Clone, Default)]
pub struct EpInfo {
    /// Device endpoint address, direction bit preserved
    pub addr: u8,
    pub max_packet_size: u16,
    pub snd_toggle: bool,
    pub rcv_toggle: bool,
    pub channel_in: Option<ChannelId>,
    pub channel_out: Option<ChannelId>,
    pub attributes: u8,
    /// NAK back-off exponent the host channel is programmed with
    pub nak_power: u8,
}

/// The four-slot endpoint table of one attached device.
pub struct EndpointSet {
    slots: [EpInfo; MAX_ENDPOINTS],
    /// Endpoints known so far; the control endpoint counts from the start
    found: u8,
}

impl EndpointSet {
    pub fn new() -> EndpointSet {
        let mut set = EndpointSet {
            slots: [EpInfo::default(); MAX_ENDPOINTS],
            found: 0,
        };
        set.clear_all();
        set
    }

    /// Resets every slot to its detached default. The control slot keeps
    /// the 8-byte max packet assumed until the device descriptor is read.
    pub fn clear_all(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            *slot = EpInfo {
                max_packet_size: if i == EpRole::Control as usize { 8 } else { 0 },
                nak_power: NAK_DEFAULT,
                ..EpInfo::default()
            };
        }
        self.found = 1;
    }

    pub fn get(&self, role: EpRole) -> &EpInfo {
        &self.slots[role as usize]
    }

    pub fn get_mut(&mut self, role: EpRole) -> &mut EpInfo {
        &mut self.slots[role as usize]
    }

    pub fn found(&self) -> u8 {
        self.found
    }

    /// Classifies an endpoint descriptor and records it in its role slot.
    ///
    /// Interrupt IN and the bulk pair are kept; everything else is ignored.
    /// Returns the role the endpoint was filed under.
    pub fn record(&mut self, desc: &EndpointDescriptor) -> Option<EpRole> {
        let is_in = desc.address & ENDPOINT_DIR_IN != 0;
        let role = if desc.attributes & 0x03 == 0x03 && is_in {
            EpRole::InterruptIn
        } else if desc.attributes & 0x02 == 0x02 {
            if is_in {
                EpRole::DataIn
            } else {
                EpRole::DataOut
            }
        } else {
            return None;
        };

        let slot = self.get_mut(role);
        slot.addr = desc.address;
        slot.max_packet_size = desc.max_packet_size;
        slot.attributes = desc.attributes;
        slot.snd_toggle = false;
        slot.rcv_toggle = false;
        self.found += 1;
        Some(role)
    }
}

impl Default for EndpointSet {
    fn default() -> EndpointSet {
        EndpointSet::new()
    }
}
