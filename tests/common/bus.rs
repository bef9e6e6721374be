//! A scripted mass-storage device behind the [HostBus] facade.
//!
//! The mock plays the device side of enumeration and of every SCSI command
//! the driver issues, with fault hooks for the recovery paths: CSW
//! corruption, data-phase stalls, and toggle desync. Clocks are virtual:
//! `delay_ms` advances `millis` instantly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use usbh_storage::host::{
    ChannelId, DataStage, EndpointType, HostBus, SetupPacket, Speed, TransferError,
};

const CBW_LEN: usize = 31;
const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE: u32 = 0x53425355;

/* SCSI opcodes the device side answers */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const START_STOP_UNIT: u8 = 0x1B;
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;

/* standard requests */
const SET_ADDRESS: u8 = 0x05;
const GET_DESCRIPTOR: u8 = 0x06;
const SET_CONFIGURATION: u8 = 0x09;
const CLEAR_FEATURE: u8 = 0x01;

/* class requests */
const GET_MAX_LUN: u8 = 0xFE;
const BULK_ONLY_RESET: u8 = 0xFF;

/// Corruption applied to the next CSW the device emits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CswFault {
    PhaseError,
    BadSignature,
    BadTag,
}

pub struct Medium {
    pub block_size: u32,
    pub last_lba: u32,
    sectors: HashMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct MockLun {
    medium: Option<Medium>,
    write_protected: bool,
    /// (key, asc) reported by the next REQUEST SENSE
    pending_sense: Option<(u8, u8)>,
}

enum InReply {
    Data(Vec<u8>),
    Csw([u8; 13]),
}

#[derive(Default)]
struct Counters {
    control: u32,
    bulk_in: u32,
    bulk_out: u32,
    set_configuration: u32,
    clear_halt: u32,
    bomsr: u32,
    channels_open: u32,
    channels_halted: u32,
    channels_freed: u32,
    toggle_resets: u32,
}

struct MockState {
    max_lun: u8,
    stall_get_max_lun: bool,
    luns: Vec<MockLun>,
    config_blob: Vec<u8>,

    in_queue: VecDeque<InReply>,
    /// (lun, lba, blocks) of a WRITE(10) awaiting its data phase
    expecting_write: Option<(u8, u32, u16)>,
    last_tag: u32,

    next_csw_fault: Option<CswFault>,
    arm_read_stall: bool,
    arm_write_stall: bool,
    stall_next_bulk_in: bool,
    stall_next_bulk_out: bool,
    toggle_error_next_out: bool,
    fail_alloc_address: bool,

    addressed: u8,
    configured: u8,
    counters: Counters,
    cbw_tags: Vec<u32>,
    opcodes: Vec<u8>,
    next_channel: u8,
    freed_addresses: Vec<u8>,
    clock_ms: u64,
}

impl MockState {
    fn new() -> MockState {
        MockState {
            max_lun: 0,
            stall_get_max_lun: false,
            luns: (0..8).map(|_| MockLun::default()).collect(),
            config_blob: Vec::new(),
            in_queue: VecDeque::new(),
            expecting_write: None,
            last_tag: 0,
            next_csw_fault: None,
            arm_read_stall: false,
            arm_write_stall: false,
            stall_next_bulk_in: false,
            stall_next_bulk_out: false,
            toggle_error_next_out: false,
            fail_alloc_address: false,
            addressed: 0,
            configured: 0,
            counters: Counters::default(),
            cbw_tags: Vec::new(),
            opcodes: Vec::new(),
            next_channel: 2,
            freed_addresses: Vec::new(),
            clock_ms: 0,
        }
    }

    fn device_descriptor(&self) -> [u8; 18] {
        let mut raw = [0u8; 18];
        raw[0] = 18;
        raw[1] = 0x01;
        raw[7] = 64; // bMaxPacketSize0
        raw[8..10].copy_from_slice(&0xabcdu16.to_le_bytes());
        raw[10..12].copy_from_slice(&0xabcdu16.to_le_bytes());
        raw[17] = 1; // bNumConfigurations
        raw
    }

    fn build_csw(&mut self, residue: u32, status: u8) -> [u8; 13] {
        let mut signature = CSW_SIGNATURE;
        let mut tag = self.last_tag;
        let mut status = status;
        match self.next_csw_fault.take() {
            Some(CswFault::PhaseError) => status = 0x02,
            Some(CswFault::BadSignature) => signature = 0xDEADBEEF,
            Some(CswFault::BadTag) => tag = tag.wrapping_add(0x1000),
            None => {}
        }
        let mut raw = [0u8; 13];
        raw[0..4].copy_from_slice(&signature.to_le_bytes());
        raw[4..8].copy_from_slice(&tag.to_le_bytes());
        raw[8..12].copy_from_slice(&residue.to_le_bytes());
        raw[12] = status;
        raw
    }

    fn push_csw(&mut self, residue: u32, status: u8) {
        let csw = self.build_csw(residue, status);
        self.in_queue.push_back(InReply::Csw(csw));
    }

    fn fail_with_sense(&mut self, lun: u8, key: u8, asc: u8, residue: u32) {
        if let Some(unit) = self.luns.get_mut(lun as usize) {
            unit.pending_sense = Some((key, asc));
        }
        self.push_csw(residue, 0x01);
    }

    fn on_cbw(&mut self, raw: &[u8]) {
        // a fresh command cancels any half-done write data phase
        self.expecting_write = None;

        let tag = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let dlen = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let lun = raw[13] & 0x0F;
        let cdb = &raw[15..31];
        let opcode = cdb[0];

        self.last_tag = tag;
        self.cbw_tags.push(tag);
        self.opcodes.push(opcode);

        match opcode {
            INQUIRY => {
                let mut data = vec![0u8; 36];
                data[1] = 0x80; // removable
                data[8..12].copy_from_slice(b"MOCK");
                data.truncate((dlen as usize).min(36));
                self.in_queue.push_back(InReply::Data(data));
                self.push_csw(0, 0x00);
            }
            TEST_UNIT_READY => {
                let unit = &self.luns[lun as usize];
                if unit.pending_sense.is_some() {
                    self.push_csw(0, 0x01);
                } else if unit.medium.is_none() {
                    self.fail_with_sense(lun, 0x02, 0x3A, 0);
                } else {
                    self.push_csw(0, 0x00);
                }
            }
            REQUEST_SENSE => {
                let (key, asc) = self.luns[lun as usize]
                    .pending_sense
                    .take()
                    .unwrap_or((0, 0));
                let mut data = vec![0u8; 18];
                data[0] = 0x70;
                data[2] = key;
                data[7] = 10;
                data[12] = asc;
                self.in_queue.push_back(InReply::Data(data));
                self.push_csw(0, 0x00);
            }
            READ_CAPACITY_10 => match &self.luns[lun as usize].medium {
                Some(medium) => {
                    let mut data = vec![0u8; 8];
                    data[0..4].copy_from_slice(&medium.last_lba.to_be_bytes());
                    data[4..8].copy_from_slice(&medium.block_size.to_be_bytes());
                    self.in_queue.push_back(InReply::Data(data));
                    self.push_csw(0, 0x00);
                }
                None => self.fail_with_sense(lun, 0x02, 0x3A, dlen),
            },
            MODE_SENSE_6 => {
                let wp = self.luns[lun as usize].write_protected;
                let data = vec![3, 0, if wp { 0x80 } else { 0 }, 0];
                self.in_queue.push_back(InReply::Data(data));
                self.push_csw(0, 0x00);
            }
            READ_10 => {
                let lba = u32::from_be_bytes(cdb[2..6].try_into().unwrap());
                let blocks = u16::from_be_bytes(cdb[7..9].try_into().unwrap());
                if self.luns[lun as usize].medium.is_none() {
                    self.fail_with_sense(lun, 0x02, 0x3A, dlen);
                    return;
                }
                if self.arm_read_stall {
                    self.arm_read_stall = false;
                    self.stall_next_bulk_in = true;
                    self.push_csw(dlen, 0x01);
                    return;
                }
                let medium = self.luns[lun as usize].medium.as_ref().unwrap();
                let block_size = medium.block_size as usize;
                let mut data = Vec::with_capacity(blocks as usize * block_size);
                for i in 0..blocks as u32 {
                    match medium.sectors.get(&(lba + i)) {
                        Some(sector) => data.extend_from_slice(sector),
                        None => data.extend(std::iter::repeat(0u8).take(block_size)),
                    }
                }
                self.in_queue.push_back(InReply::Data(data));
                self.push_csw(0, 0x00);
            }
            WRITE_10 => {
                let lba = u32::from_be_bytes(cdb[2..6].try_into().unwrap());
                let blocks = u16::from_be_bytes(cdb[7..9].try_into().unwrap());
                if self.luns[lun as usize].medium.is_none() {
                    self.fail_with_sense(lun, 0x02, 0x3A, dlen);
                    return;
                }
                if self.arm_write_stall {
                    self.arm_write_stall = false;
                    self.stall_next_bulk_out = true;
                    self.push_csw(dlen, 0x01);
                    return;
                }
                self.expecting_write = Some((lun, lba, blocks));
            }
            PREVENT_ALLOW_MEDIUM_REMOVAL | START_STOP_UNIT => {
                self.push_csw(0, 0x00);
            }
            _ => {
                self.fail_with_sense(lun, 0x05, 0x20, dlen);
            }
        }
    }

    fn on_write_data(&mut self, data: &[u8]) {
        let Some((lun, lba, _blocks)) = self.expecting_write.take() else {
            return;
        };
        let Some(medium) = self.luns[lun as usize].medium.as_mut() else {
            return;
        };
        let block_size = medium.block_size as usize;
        for (i, chunk) in data.chunks(block_size).enumerate() {
            medium.sectors.insert(lba + i as u32, chunk.to_vec());
        }
        self.push_csw(0, 0x00);
    }

    fn on_control(
        &mut self,
        setup: SetupPacket,
        mut data: DataStage<'_>,
    ) -> Result<usize, TransferError> {
        self.counters.control += 1;
        let is_class = setup.request_type & 0x60 == 0x20;

        if is_class {
            return match setup.request {
                GET_MAX_LUN => {
                    if self.stall_get_max_lun {
                        return Err(TransferError::Stall);
                    }
                    if let DataStage::In(buf) = &mut data {
                        buf[0] = self.max_lun;
                    }
                    Ok(1)
                }
                BULK_ONLY_RESET => {
                    self.counters.bomsr += 1;
                    Ok(0)
                }
                _ => Err(TransferError::Stall),
            };
        }

        match setup.request {
            SET_ADDRESS => {
                self.addressed = setup.value as u8;
                Ok(0)
            }
            SET_CONFIGURATION => {
                self.configured = setup.value as u8;
                self.counters.set_configuration += 1;
                Ok(0)
            }
            CLEAR_FEATURE => {
                self.counters.clear_halt += 1;
                self.stall_next_bulk_in = false;
                self.stall_next_bulk_out = false;
                Ok(0)
            }
            GET_DESCRIPTOR => {
                let desc_type = (setup.value >> 8) as u8;
                let source: Vec<u8> = match desc_type {
                    0x01 => self.device_descriptor().to_vec(),
                    0x02 => self.config_blob.clone(),
                    _ => return Err(TransferError::Stall),
                };
                if let DataStage::In(buf) = &mut data {
                    let n = buf.len().min(source.len());
                    buf[..n].copy_from_slice(&source[..n]);
                    Ok(n)
                } else {
                    Ok(0)
                }
            }
            _ => Ok(0),
        }
    }
}

/// Cloneable handle to the shared mock state; the driver owns one clone.
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> MockBus {
        MockBus {
            inner: Arc::new(Mutex::new(MockState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    /* Device model setup */

    pub fn set_config_blob(&self, blob: Vec<u8>) {
        self.lock().config_blob = blob;
    }

    pub fn set_max_lun(&self, max_lun: u8) {
        self.lock().max_lun = max_lun;
    }

    pub fn stall_get_max_lun(&self) {
        self.lock().stall_get_max_lun = true;
    }

    pub fn insert_medium(&self, lun: u8, block_size: u32, last_lba: u32) {
        self.lock().luns[lun as usize].medium = Some(Medium {
            block_size,
            last_lba,
            sectors: HashMap::new(),
        });
    }

    pub fn remove_medium(&self, lun: u8) {
        self.lock().luns[lun as usize].medium = None;
    }

    pub fn set_write_protected(&self, lun: u8, protected: bool) {
        self.lock().luns[lun as usize].write_protected = protected;
    }

    pub fn set_sense(&self, lun: u8, key: u8, asc: u8) {
        self.lock().luns[lun as usize].pending_sense = Some((key, asc));
    }

    pub fn sector(&self, lun: u8, lba: u32) -> Option<Vec<u8>> {
        self.lock().luns[lun as usize]
            .medium
            .as_ref()
            .and_then(|medium| medium.sectors.get(&lba).cloned())
    }

    pub fn seed_sector(&self, lun: u8, lba: u32, data: Vec<u8>) {
        if let Some(medium) = self.lock().luns[lun as usize].medium.as_mut() {
            medium.sectors.insert(lba, data);
        }
    }

    /* Fault injection */

    pub fn arm_csw_fault(&self, fault: CswFault) {
        self.lock().next_csw_fault = Some(fault);
    }

    pub fn arm_read_stall(&self) {
        self.lock().arm_read_stall = true;
    }

    pub fn arm_write_stall(&self) {
        self.lock().arm_write_stall = true;
    }

    pub fn arm_toggle_error(&self) {
        self.lock().toggle_error_next_out = true;
    }

    pub fn fail_alloc_address(&self) {
        self.lock().fail_alloc_address = true;
    }

    /* Clock */

    pub fn advance(&self, ms: u64) {
        self.lock().clock_ms += ms;
    }

    /* Observations */

    pub fn cbw_tags(&self) -> Vec<u32> {
        self.lock().cbw_tags.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.lock().opcodes.clone()
    }

    pub fn addressed(&self) -> u8 {
        self.lock().addressed
    }

    pub fn configured(&self) -> u8 {
        self.lock().configured
    }

    pub fn set_configuration_count(&self) -> u32 {
        self.lock().counters.set_configuration
    }

    pub fn clear_halt_count(&self) -> u32 {
        self.lock().counters.clear_halt
    }

    pub fn bomsr_count(&self) -> u32 {
        self.lock().counters.bomsr
    }

    pub fn bulk_transfers(&self) -> u32 {
        let state = self.lock();
        state.counters.bulk_in + state.counters.bulk_out
    }

    pub fn channels_open(&self) -> u32 {
        self.lock().counters.channels_open
    }

    pub fn channels_freed(&self) -> u32 {
        self.lock().counters.channels_freed
    }

    pub fn freed_addresses(&self) -> Vec<u8> {
        self.lock().freed_addresses.clone()
    }
}

impl Default for MockBus {
    fn default() -> MockBus {
        MockBus::new()
    }
}

impl HostBus for MockBus {
    fn control(
        &mut self,
        _dev_addr: u8,
        setup: SetupPacket,
        data: DataStage<'_>,
    ) -> Result<usize, TransferError> {
        self.lock().on_control(setup, data)
    }

    fn bulk_in(&mut self, _dev_addr: u8, _ep_addr: u8, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut state = self.lock();
        state.counters.bulk_in += 1;
        if state.stall_next_bulk_in {
            state.stall_next_bulk_in = false;
            return Err(TransferError::Stall);
        }
        match state.in_queue.pop_front() {
            Some(InReply::Data(data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(InReply::Csw(csw)) => {
                let n = buf.len().min(csw.len());
                buf[..n].copy_from_slice(&csw[..n]);
                Ok(n)
            }
            None => Err(TransferError::Timeout),
        }
    }

    fn bulk_out(&mut self, _dev_addr: u8, _ep_addr: u8, data: &[u8]) -> Result<(), TransferError> {
        let mut state = self.lock();
        state.counters.bulk_out += 1;

        let is_cbw = data.len() == CBW_LEN && data.starts_with(&CBW_SIGNATURE_LE);
        if is_cbw {
            state.on_cbw(data);
            if state.toggle_error_next_out {
                // the wrapper was delivered; only the sequencing is off
                state.toggle_error_next_out = false;
                return Err(TransferError::ToggleMismatch);
            }
            return Ok(());
        }

        if state.stall_next_bulk_out {
            state.stall_next_bulk_out = false;
            state.expecting_write = None;
            return Err(TransferError::Stall);
        }
        state.on_write_data(data);
        Ok(())
    }

    fn alloc_channel(&mut self, _ep_addr: u8) -> Result<ChannelId, TransferError> {
        let mut state = self.lock();
        let id = state.next_channel;
        state.next_channel += 1;
        Ok(ChannelId(id))
    }

    fn open_channel(
        &mut self,
        _channel: ChannelId,
        _dev_addr: u8,
        _speed: Speed,
        _ep_type: EndpointType,
        _max_packet_size: u16,
    ) -> Result<(), TransferError> {
        self.lock().counters.channels_open += 1;
        Ok(())
    }

    fn halt_channel(&mut self, _channel: ChannelId) {
        self.lock().counters.channels_halted += 1;
    }

    fn free_channel(&mut self, _channel: ChannelId) {
        self.lock().counters.channels_freed += 1;
    }

    fn reset_toggles(&mut self, _channel: ChannelId) {
        self.lock().counters.toggle_resets += 1;
    }

    fn alloc_address(&mut self, _parent: u8, _port: u8) -> Option<u8> {
        if self.lock().fail_alloc_address {
            return None;
        }
        Some(1)
    }

    fn free_address(&mut self, addr: u8) {
        self.lock().freed_addresses.push(addr);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.lock().clock_ms += ms as u64;
    }

    fn millis(&mut self) -> u64 {
        self.lock().clock_ms
    }
}
