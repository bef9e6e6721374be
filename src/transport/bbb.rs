//! Bulk Only Transport (BBB/BOT), host side
//!
//! One [BulkOnly] instance drives one attached device: it owns the endpoint
//! table, the host channels of the bulk pair, the CBW tag counter, and all
//! transport-level recovery (endpoint halts, toggle desync, reset recovery).
//! A SCSI command travels as one [transaction]: CBW out, optional data
//! phase, CSW in.
//!
//! [transaction]: crate::transport::bbb::BulkOnly::transaction

use crate::descriptor::{
    ConfigurationHeader, DescriptorIter, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DEVICE, DESCRIPTOR_ENDPOINT,
    DESCRIPTOR_INTERFACE,
};
use crate::endpoint::{EndpointSet, EpRole};
use crate::fmt::{debug, trace, warn};
use crate::host::{DataStage, EndpointType, HostBus, SetupPacket, Speed, TransferError};
use crate::transport::{CswStatus, MassError};
use core::cmp::min;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Direction bit of `Cbw::flags`: set means device-to-host.
pub const CBW_FLAGS_DIRECTION_IN: u8 = 0x80;

/// Retry bound for recoverable raw USB errors inside one classification
const USB_ERROR_RETRIES: u8 = 3;
/// Bound on the 6 ms busy spins of ClearHalt and the class reset
const BUSY_RETRIES: u16 = 100;
const BUSY_SPACING_MS: u32 = 6;

/// Largest configuration blob the driver is willing to walk
pub(crate) const CONFIG_BUF_LEN: usize = 256;

/// Command Block Wrapper. Serialized little-endian into 31 bytes; the two
/// reserved bytes are zero by construction.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_len: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    pub fn new(
        tag: u32,
        data_transfer_len: u32,
        direction: UsbDirection,
        lun: u8,
        cb: [u8; 16],
        cb_len: u8,
    ) -> Cbw {
        Cbw {
            tag,
            data_transfer_len,
            flags: match direction {
                UsbDirection::In => CBW_FLAGS_DIRECTION_IN,
                UsbDirection::Out => 0,
            },
            lun,
            cb_len,
            cb,
        }
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut raw = [0u8; CBW_LEN];
        raw[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_transfer_len.to_le_bytes());
        raw[12] = self.flags;
        raw[13] = self.lun & 0x0F;
        raw[14] = self.cb_len;
        raw[15..].copy_from_slice(&self.cb);
        raw
    }
}

/// Command Status Wrapper, parsed from 13 little-endian bytes.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    pub fn from_bytes(raw: &[u8; CSW_LEN]) -> Csw {
        Csw {
            signature: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            tag: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            data_residue: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            status: CswStatus::from(raw[12]),
        }
    }

    /// A wrapper counts as a status for `cbw` only with the right signature
    /// and a matching tag. Anything else forces reset recovery.
    pub fn is_valid_for(&self, cbw: &Cbw) -> bool {
        self.signature == CSW_SIGNATURE && self.tag == cbw.tag
    }
}

/// Host-side Bulk Only Transport engine for one device.
pub struct BulkOnly<B: HostBus> {
    bus: B,
    eps: EndpointSet,
    dev_addr: u8,
    iface_num: u8,
    conf_num: u8,
    lowspeed: bool,
    tag: u32,
    last_usb_error: Option<TransferError>,
}

impl<B: HostBus> BulkOnly<B> {
    pub fn new(bus: B) -> BulkOnly<B> {
        BulkOnly {
            bus,
            eps: EndpointSet::new(),
            dev_addr: 0,
            iface_num: 0,
            conf_num: 0,
            lowspeed: false,
            tag: 0,
            last_usb_error: None,
        }
    }

    /// Resets endpoint table and device-scope counters to detached defaults.
    pub(crate) fn reset_state(&mut self) {
        self.eps.clear_all();
        self.dev_addr = 0;
        self.iface_num = 0;
        self.conf_num = 0;
        self.lowspeed = false;
        self.tag = 0;
        self.last_usb_error = None;
    }

    pub fn dev_addr(&self) -> u8 {
        self.dev_addr
    }

    pub fn is_attached(&self) -> bool {
        self.dev_addr != 0
    }

    /// Raw status of the most recent failed transfer, if any.
    pub fn last_usb_error(&self) -> Option<TransferError> {
        self.last_usb_error
    }

    pub(crate) fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    pub(crate) fn delay_ms(&mut self, ms: u32) {
        self.bus.delay_ms(ms);
    }

    pub(crate) fn set_lowspeed(&mut self, lowspeed: bool) {
        self.lowspeed = lowspeed;
    }

    pub(crate) fn assign_address(&mut self, addr: u8) {
        self.dev_addr = addr;
    }

    pub(crate) fn endpoints_found(&self) -> u8 {
        self.eps.found()
    }

    /// Strictly monotonic (wrapping) tag for the next CBW.
    pub(crate) fn next_tag(&mut self) -> u32 {
        self.tag = self.tag.wrapping_add(1);
        self.tag
    }

    /* Enumeration-path control plumbing */

    /// Reads the device descriptor of the still unaddressed device: an
    /// 8-byte probe first to learn the control max packet size, then the
    /// full descriptor.
    pub(crate) fn probe_device_descriptor(&mut self) -> Result<DeviceDescriptor, MassError> {
        let mut raw = [0u8; DeviceDescriptor::LEN];
        self.get_descriptor(0, DESCRIPTOR_DEVICE, 0, &mut raw[..8])?;
        let short = DeviceDescriptor::from_bytes(&raw[..8]).ok_or(MassError::GeneralUsbError)?;
        self.eps.get_mut(EpRole::Control).max_packet_size = short.max_packet_size_0 as u16;

        self.get_descriptor(0, DESCRIPTOR_DEVICE, 0, &mut raw)?;
        let full = DeviceDescriptor::from_bytes(&raw).ok_or(MassError::GeneralUsbError)?;
        debug!(
            "usb: msc: device {:04x}:{:04x}, {} configuration(s)",
            full.vendor_id,
            full.product_id,
            full.num_configurations
        );
        Ok(full)
    }

    fn get_descriptor(
        &mut self,
        dev_addr: u8,
        desc_type: u8,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize, MassError> {
        let len = buf.len() as u16;
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | index as u16,
            0,
            len,
        );
        let res = self.bus.control(dev_addr, setup, DataStage::In(buf));
        match res {
            Ok(n) => Ok(n),
            Err(err) => Err(self
                .handle_usb_error(Err(err), EpRole::Control)
                .err()
                .unwrap_or(MassError::GeneralUsbError)),
        }
    }

    /// SET_ADDRESS of the stored address, issued to device zero.
    pub(crate) fn set_address(&mut self) -> Result<(), MassError> {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SET_ADDRESS,
            self.dev_addr as u16,
            0,
            0,
        );
        let res = self.bus.control(0, setup, DataStage::None).map(|_| ());
        self.handle_usb_error(res, EpRole::Control)
    }

    fn set_configuration_raw(&mut self) -> Result<(), TransferError> {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SET_CONFIGURATION,
            self.conf_num as u16,
            0,
            0,
        );
        self.bus
            .control(self.dev_addr, setup, DataStage::None)
            .map(|_| ())
    }

    /// Selects the configuration latched while parsing descriptors.
    pub(crate) fn set_configuration(&mut self) -> Result<(), MassError> {
        let res = self.set_configuration_raw();
        self.handle_usb_error(res, EpRole::Control)
    }

    /// Reads configuration descriptor `index` into `buf` and returns the
    /// blob length (the declared total length, capped at the buffer).
    pub(crate) fn read_configuration(
        &mut self,
        index: u8,
        buf: &mut [u8; CONFIG_BUF_LEN],
    ) -> Result<usize, MassError> {
        let mut header = [0u8; ConfigurationHeader::LEN];
        self.get_descriptor(self.dev_addr, DESCRIPTOR_CONFIGURATION, index, &mut header)?;
        let header =
            ConfigurationHeader::from_bytes(&header).ok_or(MassError::GeneralUsbError)?;

        let total = min(header.total_length as usize, buf.len());
        self.get_descriptor(self.dev_addr, DESCRIPTOR_CONFIGURATION, index, &mut buf[..total])?;
        Ok(total)
    }

    /// Walks a configuration blob and records the endpoints of the first
    /// interface matching the class/subclass/protocol triple. The
    /// configuration value is latched with the first accepted endpoint.
    pub(crate) fn ingest_configuration(
        &mut self,
        blob: &[u8],
        class: u8,
        subclass: u8,
        protocol: u8,
    ) {
        let Some(header) = ConfigurationHeader::from_bytes(blob) else {
            return;
        };

        let mut matched = false;
        for (desc_type, bytes) in DescriptorIter::new(blob) {
            match desc_type {
                DESCRIPTOR_INTERFACE => {
                    let Some(iface) = InterfaceDescriptor::from_bytes(bytes) else {
                        continue;
                    };
                    matched = iface.class == class
                        && iface.subclass == subclass
                        && iface.protocol == protocol;
                    if matched {
                        self.iface_num = iface.number;
                        debug!(
                            "usb: msc: interface {} alt {} matches",
                            iface.number,
                            iface.alt_setting
                        );
                    }
                }
                DESCRIPTOR_ENDPOINT if matched => {
                    let Some(ep) = EndpointDescriptor::from_bytes(bytes) else {
                        continue;
                    };
                    if let Some(role) = self.eps.record(&ep) {
                        self.conf_num = header.value;
                        trace!("usb: msc: endpoint {:02x} -> slot {}", ep.address, role as u8);
                    }
                }
                _ => {}
            }
        }
    }

    /// GET_MAX_LUN class request. A stalled request means the device only
    /// implements LUN 0; a completion without exactly one byte is an error.
    pub(crate) fn get_max_lun(&mut self) -> Result<u8, MassError> {
        let mut lun = [0u8; 1];
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            CLASS_SPECIFIC_GET_MAX_LUN,
            0,
            self.iface_num as u16,
            1,
        );
        match self.bus.control(self.dev_addr, setup, DataStage::In(&mut lun)) {
            Ok(1) => Ok(lun[0]),
            Ok(_) => Err(MassError::GeneralUsbError),
            Err(TransferError::Stall) => Ok(0),
            Err(err) => Err(self
                .handle_usb_error(Err(err), EpRole::Control)
                .err()
                .unwrap_or(MassError::GeneralUsbError)),
        }
    }

    /* Channel management */

    /// Allocates and opens host channels for the bulk pair.
    pub(crate) fn open_channels(&mut self) -> Result<(), MassError> {
        let speed = if self.lowspeed { Speed::Low } else { Speed::Full };

        let ep_in = *self.eps.get(EpRole::DataIn);
        let ch_in = self
            .bus
            .alloc_channel(ep_in.addr)
            .map_err(|_| MassError::GeneralUsbError)?;
        self.bus
            .open_channel(ch_in, self.dev_addr, speed, EndpointType::Bulk, ep_in.max_packet_size)
            .map_err(|_| MassError::GeneralUsbError)?;
        self.eps.get_mut(EpRole::DataIn).channel_in = Some(ch_in);

        let ep_out = *self.eps.get(EpRole::DataOut);
        let ch_out = self
            .bus
            .alloc_channel(ep_out.addr)
            .map_err(|_| MassError::GeneralUsbError)?;
        self.bus
            .open_channel(ch_out, self.dev_addr, speed, EndpointType::Bulk, ep_out.max_packet_size)
            .map_err(|_| MassError::GeneralUsbError)?;
        self.eps.get_mut(EpRole::DataOut).channel_out = Some(ch_out);

        debug!(
            "usb: msc: pipes open, in {:02x} out {:02x}",
            ep_in.addr,
            ep_out.addr
        );
        Ok(())
    }

    /// Halts and frees whatever channels are held.
    pub(crate) fn release_channels(&mut self) {
        if let Some(ch) = self.eps.get_mut(EpRole::DataIn).channel_in.take() {
            self.bus.halt_channel(ch);
            self.bus.free_channel(ch);
        }
        if let Some(ch) = self.eps.get_mut(EpRole::DataOut).channel_out.take() {
            self.bus.halt_channel(ch);
            self.bus.free_channel(ch);
        }
    }

    /* Recovery */

    /// CLEAR_FEATURE(ENDPOINT_HALT) on the endpoint behind `role`, spaced
    /// while the stack is busy. Success also resets both data toggles, in
    /// the table and in the host-channel state.
    pub(crate) fn clear_ep_halt(&mut self, role: EpRole) -> Result<(), MassError> {
        if matches!(role, EpRole::Control) {
            return Ok(());
        }
        let ep = *self.eps.get(role);
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Endpoint,
            Request::CLEAR_FEATURE,
            Request::FEATURE_ENDPOINT_HALT,
            ep.addr as u16,
            0,
        );

        let mut spins = BUSY_RETRIES;
        loop {
            match self.bus.control(self.dev_addr, setup, DataStage::None) {
                Ok(_) => break,
                Err(TransferError::Busy) => {
                    spins -= 1;
                    if spins == 0 {
                        self.last_usb_error = Some(TransferError::Busy);
                        return Err(MassError::UnitBusy);
                    }
                    self.bus.delay_ms(BUSY_SPACING_MS);
                }
                Err(err) => {
                    warn!("usb: msc: clear halt failed on ep {:02x}", ep.addr);
                    self.last_usb_error = Some(err);
                    return Err(MassError::GeneralUsbError);
                }
            }
        }

        let slot = self.eps.get_mut(role);
        slot.snd_toggle = false;
        slot.rcv_toggle = false;
        if let Some(ch) = slot.channel_in {
            self.bus.reset_toggles(ch);
        }
        if let Some(ch) = slot.channel_out {
            self.bus.reset_toggles(ch);
        }
        Ok(())
    }

    /// Class-specific Bulk-Only Mass Storage Reset, spaced while busy.
    fn bulk_only_reset(&mut self) {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
            0,
            self.iface_num as u16,
            0,
        );
        let mut spins = BUSY_RETRIES;
        loop {
            match self.bus.control(self.dev_addr, setup, DataStage::None) {
                Err(TransferError::Busy) if spins > 0 => {
                    spins -= 1;
                    self.bus.delay_ms(BUSY_SPACING_MS);
                }
                Err(err) => {
                    self.last_usb_error = Some(err);
                    break;
                }
                Ok(_) => break,
            }
        }
    }

    /// Reset recovery: class reset, then clear both bulk halts. Regains
    /// CBW/CSW sync after an invalid CSW or a dead status phase.
    pub(crate) fn reset_recovery(&mut self) {
        warn!("usb: bbb: reset recovery");
        self.bus.delay_ms(BUSY_SPACING_MS);
        self.bulk_only_reset();
        self.bus.delay_ms(BUSY_SPACING_MS);
        let _ = self.clear_ep_halt(EpRole::DataIn);
        self.bus.delay_ms(BUSY_SPACING_MS);
        let _ = self.clear_ep_halt(EpRole::DataOut);
        self.bus.delay_ms(BUSY_SPACING_MS);
    }

    /// Maps a raw transfer result onto the driver taxonomy, with local
    /// recovery where the protocol allows it: bulk stalls are cleared
    /// before reporting, a toggle mismatch re-issues SET_CONFIGURATION and
    /// counts as delivered once the device accepts it.
    pub(crate) fn handle_usb_error(
        &mut self,
        res: Result<(), TransferError>,
        role: EpRole,
    ) -> Result<(), MassError> {
        let mut res = res;
        for _ in 0..USB_ERROR_RETRIES {
            let err = match res {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            self.last_usb_error = Some(err);

            match err {
                TransferError::Busy | TransferError::Nak => return Err(MassError::UnitBusy),
                TransferError::Timeout | TransferError::Jitter => {
                    return Err(MassError::DeviceDisconnected)
                }
                TransferError::Stall => {
                    if matches!(role, EpRole::Control) {
                        return Err(MassError::Stall);
                    }
                    let _ = self.clear_ep_halt(role);
                    return Err(if matches!(role, EpRole::DataOut) {
                        MassError::WriteStall
                    } else {
                        MassError::Stall
                    });
                }
                TransferError::ToggleMismatch => {
                    // The device delivered the data but lost DATA0/DATA1
                    // sync; re-selecting the configuration resets its side.
                    if self.dev_addr != 0 && self.conf_num != 0 {
                        match self.set_configuration_raw() {
                            Ok(()) => return Ok(()),
                            Err(err) => {
                                res = Err(err);
                                continue;
                            }
                        }
                    }
                    return Ok(());
                }
                TransferError::Other => return Err(MassError::GeneralUsbError),
            }
        }
        Err(MassError::GeneralUsbError)
    }

    /* The transaction */

    /// Performs one Command/Data/Status triplet.
    ///
    /// The effective data-phase size is the smaller of the CBW's declared
    /// transfer length and the buffer; the device may still send less, with
    /// the shortfall reported as residue in the CSW. A missing or invalid
    /// CSW, and any phase failure that survives local recovery, ends in
    /// reset recovery so the next transaction starts in sync.
    ///
    /// `Ok` carries the CSW status verbatim; interpreting `Failed` or
    /// `PhaseError` is the SCSI layer's business.
    pub(crate) fn transaction(
        &mut self,
        cbw: &mut Cbw,
        data: DataStage<'_>,
    ) -> Result<CswStatus, MassError> {
        if cbw.tag == 0 {
            cbw.tag = self.next_tag();
        }
        let size = min(cbw.data_transfer_len as usize, data.len());
        let in_addr = self.eps.get(EpRole::DataIn).addr;
        let out_addr = self.eps.get(EpRole::DataOut).addr;

        trace!("usb: bbb: cbw tag {} len {}", cbw.tag, cbw.data_transfer_len);

        // Command phase
        let res = self.bus.bulk_out(self.dev_addr, out_addr, &cbw.to_bytes());
        let mut phase_err = self.handle_usb_error(res, EpRole::DataOut).err();

        // Data phase
        if phase_err.is_none() && size != 0 {
            let (res, role) = match data {
                DataStage::In(buf) => (
                    self.bus
                        .bulk_in(self.dev_addr, in_addr, &mut buf[..size])
                        .map(|_| ()),
                    EpRole::DataIn,
                ),
                DataStage::Out(buf) => (
                    self.bus.bulk_out(self.dev_addr, out_addr, &buf[..size]),
                    EpRole::DataOut,
                ),
                DataStage::None => (Ok(()), EpRole::DataOut),
            };
            phase_err = self.handle_usb_error(res, role).err();
        }

        // Status phase: 13 bytes from bulk IN, one retry after a halt clear
        let mut raw = [0u8; CSW_LEN];
        let mut status = self.bus.bulk_in(self.dev_addr, in_addr, &mut raw);
        if status.is_err() {
            let _ = self.clear_ep_halt(EpRole::DataIn);
            status = self.bus.bulk_in(self.dev_addr, in_addr, &mut raw);
        }

        let received = match status {
            Ok(n) => n,
            Err(err) => {
                let kind = self
                    .handle_usb_error(Err(err), EpRole::DataIn)
                    .err()
                    .unwrap_or(MassError::GeneralUsbError);
                self.reset_recovery();
                return Err(phase_err.unwrap_or(kind));
            }
        };

        // An earlier phase failed: the CSW was read only to stay in sync
        if let Some(err) = phase_err {
            self.reset_recovery();
            return Err(err);
        }

        if received != CSW_LEN {
            warn!("usb: bbb: short csw, {} bytes", received);
            self.reset_recovery();
            return Err(MassError::InvalidCsw);
        }

        let csw = Csw::from_bytes(&raw);
        if !csw.is_valid_for(cbw) {
            // Often a symptom of non-compliant firmware reporting a stale
            // tag or garbage residue; resync and let the caller decide.
            warn!("usb: bbb: invalid csw");
            self.reset_recovery();
            return Err(MassError::InvalidCsw);
        }

        trace!("usb: bbb: csw residue {}", csw.data_residue);
        Ok(csw.status)
    }
}
