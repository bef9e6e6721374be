//! USB Mass Storage transport (host side)

use num_enum::FromPrimitive;

pub mod bbb;

/// The status byte of a Command Status Wrapper.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CswStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
    /// Off-spec status byte; treated as a command failure upstream
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Driver error taxonomy, surfaced through every public operation.
///
/// The transport produces the USB-derived kinds (`Stall`, `WriteStall`,
/// `DeviceDisconnected`, `InvalidCsw`, ...); the SCSI layer produces the
/// media and command kinds from sense data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MassError {
    /// Unit is not ready and gave no more specific sense
    UnitNotReady,
    /// Controller or device busy, worth retrying later
    UnitBusy,
    /// Bulk IN or control endpoint stalled
    Stall,
    /// Bulk OUT endpoint stalled
    WriteStall,
    /// Timeout-class transfer failure; the device is likely gone
    DeviceDisconnected,
    /// No medium in the unit
    NoMedia,
    /// Medium is write protected
    WriteProtected,
    /// Medium was swapped since the unit was last checked
    MediaChanged,
    /// Logical block address out of range
    BadLba,
    /// Device does not implement the command
    CmdNotSupported,
    /// Unclassified SCSI-level failure
    GeneralScsiError,
    /// Unclassified USB-level failure
    GeneralUsbError,
    /// Status phase returned a wrapper with a bad signature or tag
    InvalidCsw,
    /// LUN outside the range the device reported
    InvalidLun,
}

/// Consumer for IN data streamed in chunks, reserved for large-transfer
/// reads that bypass the caller-supplied block buffer.
pub trait ReadParser {
    fn parse(&mut self, chunk: &[u8], offset: usize);
}
