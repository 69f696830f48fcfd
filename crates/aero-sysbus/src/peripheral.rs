//! The contract between the bus and the devices attached to it.

use std::fmt;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use bitflags::bitflags;

use crate::access::{Direction, Operation, Width, WidthMask};
use crate::range::{AddressRange, RegistrationPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

bitflags! {
    /// Width conversions a peripheral allows the bus to perform on its behalf.
    ///
    /// `BYTE_TO_WORD` means a byte access may be served with word accesses, and so on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllowedTranslation: u8 {
        const BYTE_TO_WORD = 1 << 0;
        const BYTE_TO_DOUBLE_WORD = 1 << 1;
        const WORD_TO_DOUBLE_WORD = 1 << 2;
        const WORD_TO_BYTE = 1 << 3;
        const DOUBLE_WORD_TO_BYTE = 1 << 4;
        const DOUBLE_WORD_TO_WORD = 1 << 5;
    }
}

impl AllowedTranslation {
    /// Whether an access of width `from` may be served with accesses of width `via`.
    pub fn permits(self, from: Width, via: Width) -> bool {
        let flag = match (from, via) {
            (Width::Byte, Width::Word) => Self::BYTE_TO_WORD,
            (Width::Byte, Width::DoubleWord) => Self::BYTE_TO_DOUBLE_WORD,
            (Width::Word, Width::DoubleWord) => Self::WORD_TO_DOUBLE_WORD,
            (Width::Word, Width::Byte) => Self::WORD_TO_BYTE,
            (Width::DoubleWord, Width::Byte) => Self::DOUBLE_WORD_TO_BYTE,
            (Width::DoubleWord, Width::Word) => Self::DOUBLE_WORD_TO_WORD,
            _ => return false,
        };
        self.contains(flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeripheralKind {
    #[default]
    Device,
    /// Plain memory; bulk transfers may target it in memory-only mode.
    Memory,
    /// Forwards every access to another bus address.
    Redirector,
}

/// A tagged accessor reachable only through a [`RegistrationPoint::MultiRegion`] naming `region`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionAccess {
    pub region: &'static str,
    pub operation: Operation,
}

/// Statically declared access capabilities of a peripheral type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Widths implemented natively, for both directions.
    pub native: WidthMask,
    /// `None` follows the bus endianness.
    pub endianness: Option<Endianness>,
    pub translations: AllowedTranslation,
    pub regions: Vec<RegionAccess>,
    pub absolute_address_aware: bool,
    pub kind: PeripheralKind,
}

impl Capabilities {
    pub fn native(widths: WidthMask) -> Self {
        Self {
            native: widths,
            ..Self::default()
        }
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = Some(endianness);
        self
    }

    pub fn with_translations(mut self, translations: AllowedTranslation) -> Self {
        self.translations |= translations;
        self
    }

    pub fn with_region(mut self, region: &'static str, operation: Operation) -> Self {
        self.regions.push(RegionAccess { region, operation });
        self
    }

    /// Declares both directions of `width` for `region`.
    pub fn with_region_width(self, region: &'static str, width: Width) -> Self {
        self.with_region(region, Operation::new(width, Direction::Read))
            .with_region(region, Operation::new(width, Direction::Write))
    }

    pub fn absolute_address_aware(mut self) -> Self {
        self.absolute_address_aware = true;
        self
    }

    pub fn with_kind(mut self, kind: PeripheralKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A device that can be attached to the system bus.
///
/// Accessors take `&self`: a peripheral owns its interior mutability, since the same instance may
/// be registered at several points and each registration serializes only its own accesses.
/// Accessors for widths the peripheral does not declare in [`Capabilities::native`] are never
/// called.
///
/// An accessor must not access a bus address backed by the same registration; the registration
/// lock is not reentrant.
pub trait BusPeripheral: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn capabilities(&self) -> Capabilities;

    fn read_byte(&self, _offset: u64) -> u8 {
        0
    }

    fn write_byte(&self, _offset: u64, _value: u8) {}

    fn read_word(&self, _offset: u64) -> u16 {
        0
    }

    fn write_word(&self, _offset: u64, _value: u16) {}

    fn read_double_word(&self, _offset: u64) -> u32 {
        0
    }

    fn write_double_word(&self, _offset: u64, _value: u32) {}

    /// Tagged accessor for the operations listed in [`Capabilities::regions`]. The value is
    /// truncated to `width`.
    fn read_region(&self, _region: &str, _width: Width, _offset: u64) -> u32 {
        0
    }

    fn write_region(&self, _region: &str, _width: Width, _offset: u64, _value: u32) {}

    /// Called with the absolute bus address before every access when
    /// [`Capabilities::absolute_address_aware`] is set.
    fn set_absolute_address(&self, _address: u64) {}

    /// Size of the peripheral, required for point registration.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Memory segments CPUs may access directly, bypassing dispatch.
    fn mapped_segments(&self) -> Vec<Arc<dyn MappedSegment>> {
        Vec::new()
    }

    /// Multi-byte transfer capability used by bulk reads and writes.
    fn bulk(&self) -> Option<&dyn BulkAccess> {
        None
    }
}

pub type PeripheralRef = Arc<dyn BusPeripheral>;

/// Identity comparison that ignores vtable pointers.
pub fn same_peripheral(a: &PeripheralRef, b: &PeripheralRef) -> bool {
    peripheral_key(a) == peripheral_key(b)
}

pub(crate) fn peripheral_key(peripheral: &PeripheralRef) -> usize {
    Arc::as_ptr(peripheral).cast::<()>() as usize
}

pub trait BulkAccess {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]);
    fn write_bytes(&self, offset: u64, data: &[u8]);
}

/// Host-backed memory that CPUs may access without going through the bus.
pub trait MappedSegment: Send + Sync {
    /// Peripheral-local offset of the first byte.
    fn start_offset(&self) -> u64;

    fn size(&self) -> u64;

    fn bytes(&self) -> &[AtomicU8];

    /// Makes sure the backing storage is allocated before a CPU maps it.
    fn touch(&self) {}
}

/// A mapped segment placed at a bus address.
#[derive(Clone)]
pub struct SegmentMapping {
    pub segment: Arc<dyn MappedSegment>,
    /// Bus address of the first mapped byte.
    pub start: u64,
    /// Offset into the segment of the first mapped byte.
    pub segment_offset: u64,
    pub size: u64,
}

impl SegmentMapping {
    pub fn range(&self) -> AddressRange {
        AddressRange::with_size(self.start, self.size)
    }

    /// Clips `segment` to the window `point` exposes and places it on the bus.
    pub(crate) fn for_point(
        segment: &Arc<dyn MappedSegment>,
        point: &RegistrationPoint,
    ) -> Option<Self> {
        let range = point.address_range();
        let window = AddressRange::checked_with_size(point.offset(), range.size())?;
        let local = AddressRange::checked_with_size(segment.start_offset(), segment.size())?;
        let visible = window.intersection(&local)?;
        Some(Self {
            segment: segment.clone(),
            start: range.start() + (visible.start() - point.offset()),
            segment_offset: visible.start() - local.start(),
            size: visible.size(),
        })
    }
}

impl fmt::Debug for SegmentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentMapping")
            .field("start", &format_args!("{:#x}", self.start))
            .field("segment_offset", &format_args!("{:#x}", self.segment_offset))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// A peripheral together with the point it was registered at.
#[derive(Clone)]
pub struct PeripheralHandle {
    peripheral: PeripheralRef,
    point: RegistrationPoint,
}

impl PeripheralHandle {
    pub(crate) fn new(peripheral: PeripheralRef, point: RegistrationPoint) -> Self {
        Self { peripheral, point }
    }

    pub fn peripheral(&self) -> &PeripheralRef {
        &self.peripheral
    }

    pub fn point(&self) -> &RegistrationPoint {
        &self.point
    }

    pub fn range(&self) -> AddressRange {
        self.point.address_range()
    }
}

impl fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("peripheral", &self.peripheral.name())
            .field("point", &self.point)
            .finish()
    }
}
