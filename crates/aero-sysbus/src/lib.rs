//! System bus for emulated machines.
//!
//! [`SystemBus`] routes byte, word and double-word accesses from CPUs to the peripherals
//! registered on it. Peripherals declare which widths they implement natively and which width
//! translations they permit ([`Capabilities`]); the [`AccessorSynthesizer`] fills in the remaining
//! widths once, at registration, so dispatch is a lookup in the [`AddressSpaceIndex`] followed by a
//! single call.
//!
//! CPU threads access the bus through a [`BusHandle`], which owns a [`LookupCache`] of the last
//! registration it hit. Registration changes never block dispatch; each registration serializes
//! only its own accesses.
//!
//! Accesses that hit nothing are not errors: they return a default value and are reported
//! according to [`UnhandledAccessBehaviour`].

#![forbid(unsafe_code)]

pub mod access;
mod bus;
mod config;
pub mod cpu;
pub mod devices;
mod error;
pub mod hooks;
pub mod index;
pub mod methods;
pub mod peripheral;
pub mod range;
pub mod synth;
pub mod unmapped;

pub use access::{Access, BusValue, Direction, Operation, Width, WidthMask};
pub use bus::{BusHandle, SystemBus};
pub use config::BusConfig;
pub use cpu::{Cpu, CpuRef};
pub use devices::{ArrayMemory, Redirector, Silencer};
pub use error::{BusError, RegistrationError, Result};
pub use hooks::{HookFn, WatchpointFn};
pub use index::{
    AddressSpaceIndex, Block, LookupCache, LookupStatistics, DICTIONARY_PAGE_THRESHOLD, PAGE_SIZE,
};
pub use methods::{AccessMethodTable, ReadFn, Resolution, Slot, StageKind, WriteFn};
pub use peripheral::{
    same_peripheral, AllowedTranslation, BulkAccess, BusPeripheral, Capabilities, Endianness,
    MappedSegment, PeripheralHandle, PeripheralKind, PeripheralRef, RegionAccess, SegmentMapping,
};
pub use range::{AddressRange, BusPointRegistration, CpuRegistrationPoint, RegistrationPoint};
pub use synth::AccessorSynthesizer;
pub use unmapped::{FallbackDevice, PauseFn, TagEntry, UnhandledAccessBehaviour};
