//! USB Mass Storage subclasses (host side)

use crate::transport::MassError;

pub mod scsi;

/// Most logical units tracked per device; LUNs the device reports beyond
/// this are clamped away during enumeration.
pub const MAX_LUN: usize = 8;

/// Cached state of one logical unit, refreshed by discovery and polling.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogicalUnit {
    /// Unit answered TEST UNIT READY and passed the capacity checks
    pub ready: bool,
    pub write_protected: bool,
    /// One of 512, 1024, 2048 or 4096 bytes while `ready`
    pub sector_size: u16,
    /// Number of addressable blocks (last LBA + 1) while `ready`
    pub capacity_blocks: u32,
}

/// Attach-path failures from [configure] and [init].
///
/// [configure]: crate::subclass::scsi::Scsi::configure
/// [init]: crate::subclass::scsi::Scsi::init
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumerationError {
    /// This driver instance already owns a device
    AlreadyConfigured,
    /// The address pool is exhausted
    OutOfAddresses,
    /// Configuration parse yielded fewer than a control endpoint plus the
    /// bulk pair; the device cannot speak Bulk Only
    DeviceNotSupported,
    /// A USB or SCSI failure during bring-up
    Transport(MassError),
}

impl From<MassError> for EnumerationError {
    fn from(err: MassError) -> EnumerationError {
        EnumerationError::Transport(err)
    }
}

/// Sentinel returned by a successful [configure]: the enumeration pool must
/// reset the port once more before calling [init].
///
/// [configure]: crate::subclass::scsi::Scsi::configure
/// [init]: crate::subclass::scsi::Scsi::init
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use]
pub struct PortResetRequired;
