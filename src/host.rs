//! USB host environment interface
//!
//! The driver performs every wire operation through [HostBus]: control and
//! bulk transfers, host-channel management for the two bulk pipes, the
//! device address pool, and the millisecond timebase used for bring-up
//! waits and media polling. The embedding host stack implements this trait
//! once; the driver never touches controller registers itself.

use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

pub use usb_device::endpoint::EndpointType;

/// Raw status of a failed transfer, as reported by the host controller.
///
/// Successful transfers are `Ok`; these are the distinguishable failure
/// statuses the driver's recovery logic branches on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// Controller or SIE is busy, the transfer was not attempted
    Busy,
    /// Endpoint answered with STALL
    Stall,
    /// Endpoint NAKed until the transfer was abandoned
    Nak,
    /// No response from the device in time
    Timeout,
    /// Bit-stuffing or SE0 jitter on the wire
    Jitter,
    /// DATA0/DATA1 sequence mismatch
    ToggleMismatch,
    /// Anything the controller reports that fits no other status
    Other,
}

/// Opaque handle of a host-controller channel (pipe).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub u8);

/// Connection speed of the attached device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Full,
    Low,
}

/// Data stage of a transfer: none, device-to-host, or host-to-device.
pub enum DataStage<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataStage<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataStage::None => 0,
            DataStage::In(buf) => buf.len(),
            DataStage::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire direction of the stage. A missing stage counts as host-to-device.
    pub fn direction(&self) -> UsbDirection {
        match self {
            DataStage::In(_) => UsbDirection::In,
            _ => UsbDirection::Out,
        }
    }
}

/// The eight bytes of a control-transfer SETUP packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(
        direction: UsbDirection,
        req_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        SetupPacket {
            request_type: (direction as u8) | ((req_type as u8) << 5) | (recipient as u8),
            request,
            value,
            index,
            length,
        }
    }
}

/// Host-stack primitives consumed by the driver.
///
/// All calls are synchronous: they return once the transfer completed,
/// failed, or timed out. The driver issues at most one transfer at a time.
pub trait HostBus {
    /// Control transfer on endpoint zero of `dev_addr`.
    ///
    /// Returns the number of data-stage bytes actually transferred.
    fn control(
        &mut self,
        dev_addr: u8,
        setup: SetupPacket,
        data: DataStage<'_>,
    ) -> Result<usize, TransferError>;

    /// Bulk IN on the endpoint with address `ep_addr` (direction bit set).
    ///
    /// Returns the number of bytes actually received, which may be short.
    fn bulk_in(&mut self, dev_addr: u8, ep_addr: u8, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Bulk OUT of the whole of `data` to the endpoint `ep_addr`.
    fn bulk_out(&mut self, dev_addr: u8, ep_addr: u8, data: &[u8]) -> Result<(), TransferError>;

    /// Reserves a host channel for the endpoint `ep_addr`.
    fn alloc_channel(&mut self, ep_addr: u8) -> Result<ChannelId, TransferError>;

    /// Binds a previously allocated channel to a device endpoint.
    fn open_channel(
        &mut self,
        channel: ChannelId,
        dev_addr: u8,
        speed: Speed,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), TransferError>;

    /// Stops any activity on the channel.
    fn halt_channel(&mut self, channel: ChannelId);

    /// Returns the channel to the controller's pool.
    fn free_channel(&mut self, channel: ChannelId);

    /// Resets the channel's DATA0/DATA1 sequencing to DATA0.
    fn reset_toggles(&mut self, channel: ChannelId);

    /// Allocates a USB device address below `parent`/`port`, if any is free.
    fn alloc_address(&mut self, parent: u8, port: u8) -> Option<u8>;

    /// Returns a device address to the pool.
    fn free_address(&mut self, addr: u8);

    /// Blocks for at least `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Milliseconds since an arbitrary epoch; must be monotonic.
    fn millis(&mut self) -> u64;
}
