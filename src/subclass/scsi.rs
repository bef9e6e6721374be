//! USB SCSI (transparent command set) over Bulk Only Transport
//!
//! [Scsi] is the class driver for one attached device. The enumeration pool
//! drives it through [configure] / [init] / [poll] / [release]; everything
//! else is the block-level API on top of discovered logical units.
//!
//! [configure]: crate::subclass::scsi::Scsi::configure
//! [init]: crate::subclass::scsi::Scsi::init
//! [poll]: crate::subclass::scsi::Scsi::poll
//! [release]: crate::subclass::scsi::Scsi::release

use crate::fmt::{debug, info, trace, warn};
use crate::host::{DataStage, HostBus, TransferError};
use crate::subclass::{EnumerationError, LogicalUnit, PortResetRequired, MAX_LUN};
use crate::transport::bbb::{BulkOnly, Cbw, CONFIG_BUF_LEN, TRANSPORT_BBB};
use crate::transport::{CswStatus, MassError, ReadParser};
use crate::CLASS_MASS_STORAGE;
use core::cmp::min;
use num_enum::FromPrimitive;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const START_STOP_UNIT: u8 = 0x1B;

/* SBC */
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;

/// Standard INQUIRY allocation
pub const INQUIRY_LEN: usize = 36;
/// Fixed-format sense data allocation
pub const REQUEST_SENSE_LEN: usize = 18;
/// READ CAPACITY(10) response
pub const READ_CAPACITY_LEN: usize = 8;
/// Allocation for the MODE SENSE(6) all-pages probe
pub const MODE_SENSE_LEN: usize = 192;

/// Media poll period once a device is up
const POLL_PERIOD_MS: u64 = 2000;

/// TEST UNIT READY retry counter seed for LUN bring-up; the counter wraps
/// to zero to end the loop
const TUR_TRIES_START: u8 = 0xF0;
/// Attempts that nudge the unit (lock + start motor) instead of backing off
const TUR_NUDGE_TRIES: u8 = 14;

/* Sense data */

/// Sense key, low nibble of fixed-format sense byte 2.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    #[num_enum(catch_all)]
    Other(u8),
}

pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_MEDIA_CHANGED: u8 = 0x28;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// The fields of fixed-format sense data the driver acts on.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestSenseResponse {
    pub response_code: u8,
    pub sense_key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl RequestSenseResponse {
    pub fn from_bytes(raw: &[u8; REQUEST_SENSE_LEN]) -> RequestSenseResponse {
        RequestSenseResponse {
            response_code: raw[0] & 0x7F,
            sense_key: SenseKey::from(raw[2] & 0x0F),
            asc: raw[12],
            ascq: raw[13],
        }
    }
}

/// START STOP UNIT action, CDB byte 4 bits 1:0.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartStopAction {
    StopMotor = 0x00,
    StartMotor = 0x01,
    EjectMedia = 0x02,
    LoadMedia = 0x03,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

/// SCSI command the host issues
///
/// Refer to specifications (SPC,SAM,SBC,etc.)
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    /* SPC */
    Inquiry {
        alloc_len: u8,
    },
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    ModeSense6 {
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    PreventAllowRemoval {
        prevent: bool,
    },
    StartStopUnit {
        action: StartStopAction,
    },

    /* SBC */
    ReadCapacity10,
    Read10 {
        lba: u32,
        blocks: u16,
    },
    Write10 {
        lba: u32,
        blocks: u16,
    },
}

/// A serialized Command Descriptor Block, zero padded to the CBW's 16
/// command bytes.
#[derive(Debug, Copy, Clone)]
pub struct Cdb {
    pub bytes: [u8; 16],
    pub len: u8,
}

impl ScsiCommand {
    /// Builds the CDB addressed to `lun`. The LUN rides in the high three
    /// bits of byte 1 for every command (SBC-3 form); multi-byte LBA and
    /// transfer-length fields are big-endian as SCSI mandates.
    pub fn into_cdb(self, lun: u8) -> Cdb {
        let mut bytes = [0u8; 16];
        bytes[1] = lun << 5;
        let len = match self {
            ScsiCommand::Inquiry { alloc_len } => {
                bytes[0] = INQUIRY;
                bytes[4] = alloc_len;
                6
            }
            ScsiCommand::TestUnitReady => {
                bytes[0] = TEST_UNIT_READY;
                6
            }
            ScsiCommand::RequestSense { alloc_len } => {
                bytes[0] = REQUEST_SENSE;
                bytes[4] = alloc_len;
                6
            }
            ScsiCommand::ModeSense6 {
                page_control,
                page_code,
                subpage_code,
                alloc_len,
            } => {
                bytes[0] = MODE_SENSE_6;
                bytes[2] = ((page_control as u8) << 6) | (page_code & 0b00111111);
                bytes[3] = subpage_code;
                bytes[4] = alloc_len;
                6
            }
            ScsiCommand::PreventAllowRemoval { prevent } => {
                bytes[0] = PREVENT_ALLOW_MEDIUM_REMOVAL;
                bytes[4] = prevent as u8;
                6
            }
            ScsiCommand::StartStopUnit { action } => {
                bytes[0] = START_STOP_UNIT;
                bytes[4] = (action as u8) & 0x03;
                6
            }
            ScsiCommand::ReadCapacity10 => {
                bytes[0] = READ_CAPACITY_10;
                10
            }
            ScsiCommand::Read10 { lba, blocks } => {
                bytes[0] = READ_10;
                bytes[2..6].copy_from_slice(&lba.to_be_bytes());
                bytes[7..9].copy_from_slice(&blocks.to_be_bytes());
                10
            }
            ScsiCommand::Write10 { lba, blocks } => {
                bytes[0] = WRITE_10;
                bytes[2..6].copy_from_slice(&lba.to_be_bytes());
                bytes[7..9].copy_from_slice(&blocks.to_be_bytes());
                10
            }
        };
        Cdb { bytes, len }
    }
}

/// Maps sense data onto the driver taxonomy. Only the key and the ASC are
/// consulted; the qualifier is carried for logging.
fn sense_to_error(rsp: &RequestSenseResponse) -> MassError {
    match rsp.sense_key {
        SenseKey::UnitAttention => match rsp.asc {
            ASC_MEDIA_CHANGED => MassError::MediaChanged,
            _ => MassError::UnitNotReady,
        },
        SenseKey::NotReady => match rsp.asc {
            ASC_MEDIUM_NOT_PRESENT => MassError::NoMedia,
            _ => MassError::UnitNotReady,
        },
        SenseKey::IllegalRequest => match rsp.asc {
            ASC_LBA_OUT_OF_RANGE => MassError::BadLba,
            _ => MassError::CmdNotSupported,
        },
        _ => MassError::GeneralScsiError,
    }
}

/// SCSI mass-storage class driver for one attached device.
pub struct Scsi<B: HostBus> {
    transport: BulkOnly<B>,
    luns: [LogicalUnit; MAX_LUN],
    max_lun: u8,
    cur_lun: u8,
    /// Configuration count carried from [configure] to [init]
    ///
    /// [configure]: crate::subclass::scsi::Scsi::configure
    /// [init]: crate::subclass::scsi::Scsi::init
    num_configurations: u8,
    poll_enabled: bool,
    next_poll_at: u64,
}

impl<B: HostBus> Scsi<B> {
    pub fn new(bus: B) -> Scsi<B> {
        Scsi {
            transport: BulkOnly::new(bus),
            luns: [LogicalUnit::default(); MAX_LUN],
            max_lun: 0,
            cur_lun: 0,
            num_configurations: 0,
            poll_enabled: false,
            next_poll_at: 0,
        }
    }

    /* Enumeration-pool entry points */

    /// First contact with the device, still at address zero: learns the
    /// control max packet size from an 8-byte device-descriptor probe,
    /// reads the full descriptor, and claims a USB address.
    ///
    /// The address is not programmed into the device yet; the pool must
    /// reset the port and then call [init](Scsi::init).
    pub fn configure(
        &mut self,
        parent: u8,
        port: u8,
        lowspeed: bool,
    ) -> Result<PortResetRequired, EnumerationError> {
        if self.transport.is_attached() {
            return Err(EnumerationError::AlreadyConfigured);
        }
        self.clear_state();
        self.transport.set_lowspeed(lowspeed);

        let desc = match self.transport.probe_device_descriptor() {
            Ok(desc) => desc,
            Err(err) => {
                self.release();
                return Err(err.into());
            }
        };

        let addr = self
            .transport
            .bus()
            .alloc_address(parent, port)
            .ok_or(EnumerationError::OutOfAddresses)?;
        self.transport.assign_address(addr);
        self.num_configurations = desc.num_configurations;

        info!("usb: msc: address {} claimed", addr);
        Ok(PortResetRequired)
    }

    /// Brings the addressed device all the way up: configuration selection,
    /// bulk channel bring-up, and per-LUN discovery. Any failure releases
    /// the device (channels, address, state).
    pub fn init(&mut self, _parent: u8, _port: u8, lowspeed: bool) -> Result<(), EnumerationError> {
        let res = self.init_inner(lowspeed);
        if res.is_err() {
            self.release();
        }
        res
    }

    fn init_inner(&mut self, lowspeed: bool) -> Result<(), EnumerationError> {
        let num_configurations = core::mem::take(&mut self.num_configurations);

        // settle after the port reset that followed configure()
        self.transport.delay_ms(2000);
        self.transport.set_address()?;
        self.transport.set_lowspeed(lowspeed);
        debug!("usb: msc: address {} set", self.transport.dev_addr());

        let mut blob = [0u8; CONFIG_BUF_LEN];
        for index in 0..num_configurations {
            let len = self.transport.read_configuration(index, &mut blob)?;
            self.transport.ingest_configuration(
                &blob[..len],
                CLASS_MASS_STORAGE,
                SUBCLASS_SCSI,
                TRANSPORT_BBB,
            );
            if self.transport.endpoints_found() > 1 {
                break;
            }
        }
        if self.transport.endpoints_found() < 3 {
            warn!(
                "usb: msc: not a bulk-only device, {} endpoint(s)",
                self.transport.endpoints_found()
            );
            return Err(EnumerationError::DeviceNotSupported);
        }

        self.transport.set_configuration()?;
        // Linux does a 1 sec delay after this; slow firmware needs it
        self.transport.delay_ms(1000);

        self.max_lun = min(self.transport.get_max_lun()?, MAX_LUN as u8 - 1);
        debug!("usb: msc: max lun {}", self.max_lun);
        self.transport.delay_ms(1000);

        self.transport.open_channels()?;

        for lun in 0..=self.max_lun {
            self.bring_up_lun(lun);
        }
        self.check_media();

        self.poll_enabled = true;
        info!("usb: msc: configured");
        Ok(())
    }

    /// Drops the device: halts and frees the bulk channels, returns the
    /// address to the pool, resets endpoint and LUN state. Idempotent.
    pub fn release(&mut self) {
        self.transport.release_channels();
        let addr = self.transport.dev_addr();
        if addr != 0 {
            self.transport.bus().free_address(addr);
        }
        self.clear_state();
    }

    /// Periodic entry point; re-checks media every other second once the
    /// device is up. Cheap to call from a main loop at any rate.
    pub fn poll(&mut self) {
        if !self.poll_enabled {
            return;
        }
        if self.transport.bus().millis() >= self.next_poll_at {
            self.check_media();
        }
    }

    fn clear_state(&mut self) {
        self.transport.reset_state();
        self.luns = [LogicalUnit::default(); MAX_LUN];
        self.max_lun = 0;
        self.cur_lun = 0;
        self.num_configurations = 0;
        self.poll_enabled = false;
        self.next_poll_at = 0;
    }

    /* LUN discovery and media monitoring */

    fn bring_up_lun(&mut self, lun: u8) {
        let mut inquiry = [0u8; INQUIRY_LEN];
        if let Err(err) = self.inquiry(lun, &mut inquiry) {
            warn!("usb: scsi: inquiry failed on lun {}: {}", lun, err);
            return;
        }

        // Bounded TEST UNIT READY spin. Early attempts nudge reluctant
        // units awake (some sticks need the motor start), later ones back
        // off; no-media ends the spin, the slot exists but is empty.
        let mut tries = TUR_TRIES_START;
        let ready = loop {
            match self.test_unit_ready(lun) {
                Ok(()) => break true,
                Err(MassError::NoMedia) => break false,
                Err(_) => {}
            }
            if tries.wrapping_sub(TUR_TRIES_START) < TUR_NUDGE_TRIES {
                let _ = self.lock_media(lun, true);
                let _ = self.media_ctl(lun, StartStopAction::StartMotor);
            } else {
                self.transport.delay_ms(2 * (tries as u32 + 1));
            }
            tries = tries.wrapping_add(1);
            if tries == 0 {
                break false;
            }
        };

        if ready {
            self.transport.delay_ms(1000);
            self.luns[lun as usize].ready = self.check_lun(lun);
            if !self.luns[lun as usize].ready {
                self.luns[lun as usize].ready = self.check_lun(lun);
            }
        }
    }

    /// Full readiness check of one LUN: capacity, write protection, and a
    /// final TEST UNIT READY. True means the unit is usable for block I/O.
    fn check_lun(&mut self, lun: u8) -> bool {
        let mut raw = [0u8; READ_CAPACITY_LEN];
        if self.read_capacity(lun, &mut raw).is_err() {
            return false;
        }

        let last_lba = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        let block_len = u32::from_be_bytes(raw[4..8].try_into().unwrap());

        if !matches!(block_len, 512 | 1024 | 2048 | 4096) {
            warn!("usb: scsi: lun {} block size {} not valid", lun, block_len);
            return false;
        }
        // Buggy firmware reports 0 or 0xFFFFFFFF for no media
        if last_lba == 0 || last_lba == u32::MAX {
            warn!("usb: scsi: lun {} capacity not plausible", lun);
            return false;
        }

        let unit = &mut self.luns[lun as usize];
        unit.sector_size = block_len as u16;
        unit.capacity_blocks = last_lba + 1;
        debug!(
            "usb: scsi: lun {}: {} blocks of {} bytes",
            lun,
            last_lba + 1,
            block_len
        );

        self.transport.delay_ms(20);
        self.probe_write_protect(lun);
        self.test_unit_ready(lun).is_ok()
    }

    /// Mode page 0x3F carries the write-protect bit in the header.
    fn probe_write_protect(&mut self, lun: u8) {
        let mut page = [0u8; MODE_SENSE_LEN];
        self.luns[lun as usize].write_protected = false;
        if self
            .mode_sense(lun, PageControl::CurrentValues, 0x3F, 0, &mut page)
            .is_ok()
        {
            self.luns[lun as usize].write_protected = page[2] & 0x80 != 0;
        }
    }

    /// Scan for media change on all LUNs.
    fn check_media(&mut self) {
        for lun in 0..=self.max_lun {
            if self.test_unit_ready(lun).is_err() {
                self.luns[lun as usize].ready = false;
                continue;
            }
            if !self.luns[lun as usize].ready {
                self.luns[lun as usize].ready = self.check_lun(lun);
            }
        }
        self.next_poll_at = self.transport.bus().millis() + POLL_PERIOD_MS;
    }

    /* Command plumbing */

    fn set_cur_lun(&mut self, lun: u8) -> Result<(), MassError> {
        if lun > self.max_lun {
            return Err(MassError::InvalidLun);
        }
        self.cur_lun = lun;
        Ok(())
    }

    /// Runs `cmd` as one BBB transaction, without sense interpretation.
    fn submit(
        &mut self,
        lun: u8,
        cmd: ScsiCommand,
        data: DataStage<'_>,
    ) -> Result<CswStatus, MassError> {
        let cdb = cmd.into_cdb(lun);
        let mut cbw = Cbw::new(
            self.transport.next_tag(),
            data.len() as u32,
            data.direction(),
            lun,
            cdb.bytes,
            cdb.len,
        );
        self.transport.transaction(&mut cbw, data)
    }

    /// Runs `cmd` and resolves a failed status through REQUEST SENSE.
    fn issue(&mut self, lun: u8, cmd: ScsiCommand, data: DataStage<'_>) -> Result<(), MassError> {
        self.set_cur_lun(lun)?;
        let status = self.submit(lun, cmd, data);
        self.handle_scsi_error(status)
    }

    fn handle_scsi_error(&mut self, status: Result<CswStatus, MassError>) -> Result<(), MassError> {
        match status {
            Ok(CswStatus::Passed) => Ok(()),
            Ok(CswStatus::Failed) => {
                let lun = self.cur_lun;
                let mut raw = [0u8; REQUEST_SENSE_LEN];
                match self.request_sense(lun, &mut raw) {
                    Ok(CswStatus::Passed) => {}
                    // no usable sense; nothing to recover from here
                    _ => return Err(MassError::GeneralScsiError),
                }
                let sense = RequestSenseResponse::from_bytes(&raw);
                debug!(
                    "usb: scsi: lun {} sense key {} asc {:02x} ascq {:02x}",
                    lun,
                    sense.sense_key,
                    sense.asc,
                    sense.ascq
                );
                Err(sense_to_error(&sense))
            }
            Ok(CswStatus::PhaseError) => {
                warn!("usb: scsi: phase error on lun {}", self.cur_lun);
                self.transport.reset_recovery();
                Err(MassError::GeneralScsiError)
            }
            Ok(CswStatus::Unknown(_)) => Err(MassError::GeneralScsiError),
            Err(err) => Err(err),
        }
    }

    /* SCSI commands */

    pub fn inquiry(&mut self, lun: u8, resp: &mut [u8; INQUIRY_LEN]) -> Result<(), MassError> {
        self.issue(
            lun,
            ScsiCommand::Inquiry {
                alloc_len: INQUIRY_LEN as u8,
            },
            DataStage::In(resp),
        )
    }

    pub fn test_unit_ready(&mut self, lun: u8) -> Result<(), MassError> {
        if !self.transport.is_attached() {
            return Err(MassError::UnitNotReady);
        }
        self.issue(lun, ScsiCommand::TestUnitReady, DataStage::None)
    }

    /// Raw REQUEST SENSE; deliberately not routed through the sense path
    /// itself.
    fn request_sense(
        &mut self,
        lun: u8,
        resp: &mut [u8; REQUEST_SENSE_LEN],
    ) -> Result<CswStatus, MassError> {
        self.submit(
            lun,
            ScsiCommand::RequestSense {
                alloc_len: REQUEST_SENSE_LEN as u8,
            },
            DataStage::In(resp),
        )
    }

    pub fn read_capacity(
        &mut self,
        lun: u8,
        resp: &mut [u8; READ_CAPACITY_LEN],
    ) -> Result<(), MassError> {
        self.issue(lun, ScsiCommand::ReadCapacity10, DataStage::In(resp))
    }

    pub fn mode_sense(
        &mut self,
        lun: u8,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        resp: &mut [u8],
    ) -> Result<(), MassError> {
        let alloc_len = min(resp.len(), u8::MAX as usize) as u8;
        let len = alloc_len as usize;
        self.issue(
            lun,
            ScsiCommand::ModeSense6 {
                page_control,
                page_code,
                subpage_code,
                alloc_len,
            },
            DataStage::In(&mut resp[..len]),
        )
    }

    /// Lock or unlock the tray or door on the device.
    /// Caution: some devices with buggy firmware will lock up.
    pub fn lock_media(&mut self, lun: u8, lock: bool) -> Result<(), MassError> {
        self.issue(
            lun,
            ScsiCommand::PreventAllowRemoval { prevent: lock },
            DataStage::None,
        )
    }

    /// Media control for spindle motor and media tray or door; covers
    /// CDROM, tape, and anything else with a loader.
    pub fn media_ctl(&mut self, lun: u8, action: StartStopAction) -> Result<(), MassError> {
        if !self.transport.is_attached() {
            return Err(MassError::UnitNotReady);
        }
        self.issue(lun, ScsiCommand::StartStopUnit { action }, DataStage::None)
    }

    /* Block interface */

    /// Reads `blocks` blocks of `block_size` bytes starting at `lba`.
    ///
    /// A stalled transfer gets one recovery attempt: start the motor, let
    /// the unit settle, and re-issue if it reports ready again.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than `block_size * blocks` bytes.
    pub fn read(
        &mut self,
        lun: u8,
        lba: u32,
        block_size: u16,
        blocks: u16,
        buf: &mut [u8],
    ) -> Result<(), MassError> {
        if !self.lun_state(lun)?.ready {
            return Err(MassError::NoMedia);
        }
        let total = block_size as usize * blocks as usize;
        assert!(buf.len() >= total);
        trace!("usb: scsi: read lun {} lba {} blocks {}", lun, lba, blocks);

        let mut spun_up = false;
        loop {
            match self.issue(
                lun,
                ScsiCommand::Read10 { lba, blocks },
                DataStage::In(&mut buf[..total]),
            ) {
                Err(MassError::Stall) if !spun_up => {
                    spun_up = true;
                    let _ = self.media_ctl(lun, StartStopAction::StartMotor);
                    self.transport.delay_ms(150);
                    if self.test_unit_ready(lun).is_err() {
                        return Err(MassError::Stall);
                    }
                }
                other => return other,
            }
        }
    }

    /// Writes `blocks` blocks of `block_size` bytes starting at `lba`.
    ///
    /// Refuses write-protected media before touching the bus. The stall
    /// recovery mirrors [read](Scsi::read).
    ///
    /// # Panics
    /// Panics if `buf` is shorter than `block_size * blocks` bytes.
    pub fn write(
        &mut self,
        lun: u8,
        lba: u32,
        block_size: u16,
        blocks: u16,
        buf: &[u8],
    ) -> Result<(), MassError> {
        let unit = self.lun_state(lun)?;
        if !unit.ready {
            return Err(MassError::NoMedia);
        }
        if unit.write_protected {
            return Err(MassError::WriteProtected);
        }
        let total = block_size as usize * blocks as usize;
        assert!(buf.len() >= total);
        trace!("usb: scsi: write lun {} lba {} blocks {}", lun, lba, blocks);

        let mut spun_up = false;
        loop {
            match self.issue(
                lun,
                ScsiCommand::Write10 { lba, blocks },
                DataStage::Out(&buf[..total]),
            ) {
                Err(MassError::WriteStall) if !spun_up => {
                    spun_up = true;
                    let _ = self.media_ctl(lun, StartStopAction::StartMotor);
                    self.transport.delay_ms(150);
                    if self.test_unit_ready(lun).is_err() {
                        return Err(MassError::WriteStall);
                    }
                }
                other => return other,
            }
        }
    }

    /// Streaming read through a [ReadParser], for transfers too large for
    /// a single buffer.
    ///
    /// Currently unimplemented; kept so the interface can grow into it
    /// without breaking callers.
    pub fn read_with<P: ReadParser>(
        &mut self,
        lun: u8,
        _lba: u32,
        _block_size: u16,
        _blocks: u16,
        _parser: &mut P,
    ) -> Result<(), MassError> {
        if !self.lun_state(lun)?.ready {
            return Err(MassError::NoMedia);
        }
        Err(MassError::CmdNotSupported)
    }

    /* Accessors */

    /// Highest LUN the device reported, clamped to what the driver tracks.
    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    /// Whether the LUN is ready for block I/O.
    pub fn lun_is_good(&self, lun: u8) -> bool {
        self.luns
            .get(lun as usize)
            .map_or(false, |unit| unit.ready)
    }

    /// Capacity of the media in blocks, 0 unless the LUN is ready.
    pub fn capacity(&self, lun: u8) -> u32 {
        match self.luns.get(lun as usize) {
            Some(unit) if unit.ready => unit.capacity_blocks,
            _ => 0,
        }
    }

    /// Block size of the media in bytes, 0 unless the LUN is ready.
    pub fn sector_size(&self, lun: u8) -> u16 {
        match self.luns.get(lun as usize) {
            Some(unit) if unit.ready => unit.sector_size,
            _ => 0,
        }
    }

    /// Cached write-protect switch status from the last discovery pass.
    pub fn write_protected(&self, lun: u8) -> bool {
        self.luns
            .get(lun as usize)
            .map_or(false, |unit| unit.write_protected)
    }

    /// Raw status of the most recent failed USB transfer, if any.
    pub fn last_usb_error(&self) -> Option<TransferError> {
        self.transport.last_usb_error()
    }

    fn lun_state(&self, lun: u8) -> Result<&LogicalUnit, MassError> {
        if lun > self.max_lun || lun as usize >= MAX_LUN {
            return Err(MassError::InvalidLun);
        }
        Ok(&self.luns[lun as usize])
    }
}
