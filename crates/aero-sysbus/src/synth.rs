//! Builds [`AccessMethodTable`]s from declared peripheral capabilities.
//!
//! Each of the six slots is resolved independently, in this order:
//!
//! 1. the registration region's tagged accessor for the exact operation,
//! 2. the native accessor,
//! 3. a translation through another width's tagged accessor,
//! 4. a translation through another width's native accessor,
//! 5. nothing: the slot stays empty and dispatching it is a capability error.
//!
//! Translations never chain; the source of a translated accessor is always tagged or native.
//! Byte accesses prefer word over double-word sources, word accesses prefer double-word over byte,
//! and double-word accesses prefer word over byte.

use std::sync::Arc;

use crate::access::{BusValue, Direction, Operation, Width};
use crate::error::RegistrationError;
use crate::methods::{AccessMethodTable, ReadFn, ReadSlot, Resolution, Slot, WriteFn, WriteSlot};
use crate::peripheral::{Capabilities, Endianness, PeripheralRef};

#[derive(Debug, Clone, Copy)]
pub struct AccessorSynthesizer {
    bus_endianness: Endianness,
}

impl AccessorSynthesizer {
    pub fn new(bus_endianness: Endianness) -> Self {
        Self { bus_endianness }
    }

    pub fn synthesize(
        &self,
        peripheral: &PeripheralRef,
    ) -> Result<AccessMethodTable, RegistrationError> {
        self.build(peripheral, None)
    }

    /// Like [`Self::synthesize`], but tagged accessors of `region` take precedence.
    pub fn synthesize_tagged(
        &self,
        peripheral: &PeripheralRef,
        region: &str,
    ) -> Result<AccessMethodTable, RegistrationError> {
        self.build(peripheral, Some(region))
    }

    fn build(
        &self,
        peripheral: &PeripheralRef,
        region: Option<&str>,
    ) -> Result<AccessMethodTable, RegistrationError> {
        let caps = peripheral.capabilities();
        let tagged = match region {
            Some(region) => tagged_operations(peripheral, &caps, region)?,
            None => Vec::new(),
        };
        if caps.native.is_empty() && tagged.is_empty() {
            return Err(RegistrationError::NoAccessMethods {
                peripheral: peripheral.name().to_owned(),
            });
        }

        let resolver = Resolver {
            peripheral,
            caps: &caps,
            endianness: caps.endianness.unwrap_or(self.bus_endianness),
            region: region.map(Arc::from),
            tagged,
        };

        let mut table = AccessMethodTable::empty(peripheral.name());
        table.read_byte = resolver.read();
        table.write_byte = resolver.write();
        table.read_word = resolver.read();
        table.write_word = resolver.write();
        table.read_double_word = resolver.read();
        table.write_double_word = resolver.write();
        if caps.absolute_address_aware {
            let p = peripheral.clone();
            table.set_absolute_address = Some(Arc::new(move |address: u64| {
                p.set_absolute_address(address)
            }));
        }

        tracing::trace!(table = ?table, region, "synthesized access methods");
        Ok(table)
    }
}

fn tagged_operations(
    peripheral: &PeripheralRef,
    caps: &Capabilities,
    region: &str,
) -> Result<Vec<Operation>, RegistrationError> {
    let mut operations = Vec::new();
    for access in caps.regions.iter().filter(|r| r.region == region) {
        if operations.contains(&access.operation) {
            return Err(RegistrationError::DuplicateRegionMethod {
                peripheral: peripheral.name().to_owned(),
                region: region.to_owned(),
                operation: access.operation,
            });
        }
        operations.push(access.operation);
    }
    Ok(operations)
}

/// Widths that may serve an access of `width`, most preferred first.
fn translation_candidates(width: Width) -> [Width; 2] {
    match width {
        Width::Byte => [Width::Word, Width::DoubleWord],
        Width::Word => [Width::DoubleWord, Width::Byte],
        Width::DoubleWord => [Width::Word, Width::Byte],
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Region,
    Native,
}

struct Resolver<'a> {
    peripheral: &'a PeripheralRef,
    caps: &'a Capabilities,
    endianness: Endianness,
    region: Option<Arc<str>>,
    tagged: Vec<Operation>,
}

impl Resolver<'_> {
    fn read<T: BusValue>(&self) -> ReadSlot<T> {
        if let Some(f) = self.source_read::<T>(Source::Region) {
            return Slot::new(Resolution::Region, Some(f));
        }
        if let Some(f) = self.source_read::<T>(Source::Native) {
            return Slot::new(Resolution::Native, Some(f));
        }
        for source in [Source::Region, Source::Native] {
            for via in self.permitted(T::WIDTH) {
                let translated = match via {
                    Width::Byte => self.read_via::<T, u8>(source),
                    Width::Word => self.read_via::<T, u16>(source),
                    Width::DoubleWord => self.read_via::<T, u32>(source),
                };
                if let Some(f) = translated {
                    return Slot::new(Resolution::Translated { via }, Some(f));
                }
            }
        }
        Slot::unresolved()
    }

    fn write<T: BusValue>(&self) -> WriteSlot<T> {
        if let Some(f) = self.source_write::<T>(Source::Region) {
            return Slot::new(Resolution::Region, Some(f));
        }
        if let Some(f) = self.source_write::<T>(Source::Native) {
            return Slot::new(Resolution::Native, Some(f));
        }
        for source in [Source::Region, Source::Native] {
            for via in self.permitted(T::WIDTH) {
                let translated = match via {
                    Width::Byte => self.write_via::<T, u8>(source),
                    Width::Word => self.write_via::<T, u16>(source),
                    Width::DoubleWord => self.write_via::<T, u32>(source),
                };
                if let Some(f) = translated {
                    return Slot::new(Resolution::Translated { via }, Some(f));
                }
            }
        }
        Slot::unresolved()
    }

    fn permitted(&self, width: Width) -> impl Iterator<Item = Width> + '_ {
        translation_candidates(width)
            .into_iter()
            .filter(move |via| self.caps.translations.permits(width, *via))
    }

    fn is_tagged(&self, operation: Operation) -> bool {
        self.tagged.contains(&operation)
    }

    fn source_read<V: BusValue>(&self, source: Source) -> Option<ReadFn<V>> {
        let p = self.peripheral.clone();
        match source {
            Source::Region => {
                if !self.is_tagged(Operation::new(V::WIDTH, Direction::Read)) {
                    return None;
                }
                let region = self.region.clone()?;
                Some(Arc::new(move |offset: u64| {
                    V::from_u32(p.read_region(&region, V::WIDTH, offset))
                }))
            }
            Source::Native => {
                if !self.caps.native.has(V::WIDTH) {
                    return None;
                }
                Some(Arc::new(move |offset: u64| V::read_native(p.as_ref(), offset)))
            }
        }
    }

    fn source_write<V: BusValue>(&self, source: Source) -> Option<WriteFn<V>> {
        let p = self.peripheral.clone();
        match source {
            Source::Region => {
                if !self.is_tagged(Operation::new(V::WIDTH, Direction::Write)) {
                    return None;
                }
                let region = self.region.clone()?;
                Some(Arc::new(move |offset: u64, value: V| {
                    p.write_region(&region, V::WIDTH, offset, value.to_u32())
                }))
            }
            Source::Native => {
                if !self.caps.native.has(V::WIDTH) {
                    return None;
                }
                Some(Arc::new(move |offset: u64, value: V| {
                    V::write_native(p.as_ref(), offset, value)
                }))
            }
        }
    }

    fn read_via<T: BusValue, V: BusValue>(&self, source: Source) -> Option<ReadFn<T>> {
        let read = self.source_read::<V>(source)?;
        Some(if V::BYTES > T::BYTES {
            narrow_read::<T, V>(read, self.endianness)
        } else {
            widen_read::<T, V>(read, self.endianness)
        })
    }

    fn write_via<T: BusValue, V: BusValue>(&self, source: Source) -> Option<WriteFn<T>> {
        let write = self.source_write::<V>(source)?;
        if V::BYTES > T::BYTES {
            // Narrow writes merge into the containing wide value.
            let read = self.source_read::<V>(source)?;
            Some(narrow_write::<T, V>(read, write, self.endianness))
        } else {
            Some(widen_write::<T, V>(write, self.endianness))
        }
    }
}

/// Aligned wide offset and signed bit shift of a narrow value inside the wide value containing
/// it. A negative shift moves the narrow value up instead of down.
///
/// A narrow value that straddles the end of the wide value (a word at lane 3 of a double word)
/// only sees the bytes inside it.
#[inline]
fn lane<T: BusValue, V: BusValue>(offset: u64, endianness: Endianness) -> (u64, i32) {
    let aligned = offset & !(V::BYTES - 1);
    let lane = (offset - aligned) as i32;
    let shift = match endianness {
        Endianness::Little => 8 * lane,
        Endianness::Big => 8 * (V::BYTES as i32 - T::BYTES as i32 - lane),
    };
    (aligned, shift)
}

/// Moves `value` down by `shift` bits, or up when `shift` is negative.
#[inline]
fn shift_down(value: u32, shift: i32) -> u32 {
    if shift >= 0 {
        value >> shift
    } else {
        value << -shift
    }
}

#[inline]
fn shift_up(value: u32, shift: i32) -> u32 {
    shift_down(value, -shift)
}

/// Bit shift of part `index` (in ascending address order) of a value built from `parts` parts.
#[inline]
fn part_shift<V: BusValue>(index: u64, parts: u64, endianness: Endianness) -> u32 {
    let position = match endianness {
        Endianness::Little => index,
        Endianness::Big => parts - 1 - index,
    };
    (8 * V::BYTES * position) as u32
}

pub(crate) fn narrow_read<T: BusValue, V: BusValue>(
    wide: ReadFn<V>,
    endianness: Endianness,
) -> ReadFn<T> {
    Arc::new(move |offset: u64| {
        let (aligned, shift) = lane::<T, V>(offset, endianness);
        T::from_u32(shift_down(wide(aligned).to_u32(), shift))
    })
}

pub(crate) fn narrow_write<T: BusValue, V: BusValue>(
    wide_read: ReadFn<V>,
    wide_write: WriteFn<V>,
    endianness: Endianness,
) -> WriteFn<T> {
    Arc::new(move |offset: u64, value: T| {
        let (aligned, shift) = lane::<T, V>(offset, endianness);
        let mask = shift_up(T::WIDTH.value_mask(), shift);
        let merged = (wide_read(aligned).to_u32() & !mask) | (shift_up(value.to_u32(), shift) & mask);
        wide_write(aligned, V::from_u32(merged));
    })
}

pub(crate) fn widen_read<T: BusValue, V: BusValue>(
    narrow: ReadFn<V>,
    endianness: Endianness,
) -> ReadFn<T> {
    let parts = T::BYTES / V::BYTES;
    Arc::new(move |offset: u64| {
        let mut value = 0u32;
        for index in 0..parts {
            let part = narrow(offset.wrapping_add(index * V::BYTES)).to_u32();
            value |= part << part_shift::<V>(index, parts, endianness);
        }
        T::from_u32(value)
    })
}

pub(crate) fn widen_write<T: BusValue, V: BusValue>(
    narrow: WriteFn<V>,
    endianness: Endianness,
) -> WriteFn<T> {
    let parts = T::BYTES / V::BYTES;
    Arc::new(move |offset: u64, value: T| {
        let value = value.to_u32();
        for index in 0..parts {
            let part = value >> part_shift::<V>(index, parts, endianness);
            narrow(offset.wrapping_add(index * V::BYTES), V::from_u32(part));
        }
    })
}
