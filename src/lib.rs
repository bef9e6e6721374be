//! USB Mass Storage host driver
//!
//! Host-side implementation of the Mass Storage Class over [Bulk Only]
//! transport with the [SCSI] transparent command set: enumeration of a
//! freshly attached device, per-LUN discovery and media polling, and an
//! LBA-addressed block interface on top.
//!
//! # Layers
//! * [HostBus] - transfer primitives supplied by the embedding USB host stack
//! * [Bulk Only] - the CBW/Data/CSW engine with stall and reset recovery
//! * [SCSI] - command set, sense interpretation, LUN bring-up, block I/O
//!
//! # Features
//! | Feature | Description                                                      |
//! | ------- |------------------------------------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [HostBus]: crate::host::HostBus
//! [Bulk Only]: crate::transport::bbb
//! [SCSI]: crate::subclass::scsi

#![no_std]

pub mod descriptor;
pub mod endpoint;
pub(crate) mod fmt;
pub mod host;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
