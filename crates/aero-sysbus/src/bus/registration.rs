use std::sync::Arc;

use super::{Registry, SystemBus, TrackedMapping};
use crate::cpu::CpuRef;
use crate::devices::{Redirector, Silencer};
use crate::error::{BusError, RegistrationError, Result};
use crate::index::Block;
use crate::methods::AccessMethodTable;
use crate::peripheral::{
    peripheral_key, same_peripheral, Endianness, MappedSegment, PeripheralHandle, PeripheralKind,
    PeripheralRef, SegmentMapping,
};
use crate::range::{AddressRange, BusPointRegistration, CpuRegistrationPoint, RegistrationPoint};
use crate::synth::AccessorSynthesizer;
use crate::unmapped::{FallbackDevice, TagEntry, UnhandledAccessBehaviour};

impl SystemBus {
    /// Attaches `peripheral` at `point`.
    ///
    /// Fails without changing anything if the range is empty or overlaps a registered range, if
    /// the peripheral offers no accessor usable through `point`, or if a peripheral with mapped
    /// memory is registered through a region point.
    pub fn register(
        &self,
        peripheral: PeripheralRef,
        point: RegistrationPoint,
    ) -> Result<PeripheralHandle> {
        let range = point.address_range();
        if range.is_empty() {
            return Err(RegistrationError::EmptyRange {
                start: range.start(),
            }
            .into());
        }

        let mut registry = self.registry();
        if let Some(existing) = self.index.first_intersecting(range) {
            return Err(RegistrationError::Overlap {
                range,
                peripheral: peripheral.name().to_owned(),
                existing: existing.range(),
                existing_peripheral: existing.handle().peripheral().name().to_owned(),
            }
            .into());
        }

        let segments = peripheral.mapped_segments();
        let synthesizer = AccessorSynthesizer::new(registry.endianness);
        let table = match point.region() {
            Some(region) if !segments.is_empty() => {
                return Err(RegistrationError::MappedMultiRegion {
                    peripheral: peripheral.name().to_owned(),
                    region: region.to_owned(),
                }
                .into());
            }
            Some(region) => synthesizer.synthesize_tagged(&peripheral, region)?,
            None => synthesizer.synthesize(&peripheral)?,
        };

        let handle = PeripheralHandle::new(peripheral.clone(), point.clone());
        self.index.add(range, handle.clone(), Arc::new(table));
        registry.endianness_locked = true;

        for segment in &segments {
            if let Some(mapping) = SegmentMapping::for_point(segment, &point) {
                install_mapping(&mut registry, peripheral_key(&peripheral), Some(point.clone()), mapping);
            }
        }

        tracing::debug!(peripheral = peripheral.name(), point = %point, "registered peripheral");
        Ok(handle)
    }

    /// Attaches a peripheral that knows its own size at `registration.start`.
    pub fn register_at(
        &self,
        peripheral: PeripheralRef,
        registration: BusPointRegistration,
    ) -> Result<PeripheralHandle> {
        let size = peripheral.size().ok_or_else(|| RegistrationError::UnknownSize {
            peripheral: peripheral.name().to_owned(),
        })?;
        let range = AddressRange::checked_with_size(registration.start, size).ok_or(
            BusError::AddressOverflow {
                start: registration.start,
                len: size,
            },
        )?;
        self.register(
            peripheral,
            RegistrationPoint::range_with_offset(range, registration.offset),
        )
    }

    /// Detaches every registration of `peripheral`, withdrawing its memory mappings from the CPUs
    /// first.
    pub fn unregister(&self, peripheral: &PeripheralRef) -> Result<()> {
        let mut registry = self.registry();
        if !self.index.contains_peripheral(peripheral) {
            return Err(BusError::NotRegistered {
                peripheral: peripheral.name().to_owned(),
            });
        }
        let key = peripheral_key(peripheral);
        withdraw_mappings(&mut registry, |m| m.owner == key);
        let removed = self.index.remove_peripheral(peripheral);
        tracing::debug!(
            peripheral = peripheral.name(),
            registrations = removed.len(),
            "unregistered peripheral"
        );
        Ok(())
    }

    /// Detaches a single registration, leaving other registrations of the same peripheral alone.
    pub fn unregister_point(&self, handle: &PeripheralHandle) -> Result<()> {
        let mut registry = self.registry();
        let registered = self
            .index
            .find(handle.range().start())
            .filter(|b| is_registration(b, handle));
        if registered.is_none() {
            return Err(BusError::NotRegistered {
                peripheral: handle.peripheral().name().to_owned(),
            });
        }
        self.remove_registration(&mut registry, handle);
        Ok(())
    }

    /// Detaches the registration covering `address` and returns it.
    pub fn unregister_from_address(&self, address: u64) -> Result<PeripheralHandle> {
        let mut registry = self.registry();
        let block = self
            .index
            .find(address)
            .ok_or(BusError::NothingAt { address })?;
        let handle = block.handle().clone();
        self.remove_registration(&mut registry, &handle);
        Ok(handle)
    }

    fn remove_registration(&self, registry: &mut Registry, handle: &PeripheralHandle) {
        let key = peripheral_key(handle.peripheral());
        withdraw_mappings(registry, |m| {
            m.owner == key && m.point.as_ref() == Some(handle.point())
        });
        self.index.remove_range(handle.range());
        tracing::debug!(
            peripheral = handle.peripheral().name(),
            point = %handle.point(),
            "unregistered registration point"
        );
    }

    pub fn registration_points(&self, peripheral: &PeripheralRef) -> Vec<RegistrationPoint> {
        self.index
            .blocks()
            .iter()
            .filter(|b| same_peripheral(b.handle().peripheral(), peripheral))
            .map(|b| b.handle().point().clone())
            .collect()
    }

    pub fn is_registered(&self, peripheral: &PeripheralRef) -> bool {
        self.index.contains_peripheral(peripheral)
    }

    pub fn what_is_at(&self, address: u64) -> Option<PeripheralHandle> {
        self.index.find(address).map(|b| b.handle().clone())
    }

    pub fn what_peripheral_is_at(&self, address: u64) -> Option<PeripheralRef> {
        self.index.find(address).map(|b| b.handle().peripheral().clone())
    }

    /// The accessor table currently installed for the registration covering `address`.
    pub fn access_methods_at(&self, address: u64) -> Option<Arc<AccessMethodTable>> {
        self.index.find(address).map(|b| b.methods().clone())
    }

    /// The memory peripheral covering `address`, if that is what is registered there.
    pub fn find_memory(&self, address: u64) -> Option<PeripheralHandle> {
        self.index
            .find(address)
            .filter(|b| b.handle().peripheral().capabilities().kind == PeripheralKind::Memory)
            .map(|b| b.handle().clone())
    }

    /// Every registration, ordered by address.
    pub fn peripherals(&self) -> Vec<PeripheralHandle> {
        self.index
            .blocks()
            .iter()
            .map(|b| b.handle().clone())
            .collect()
    }

    /// Registrations of peripherals exposing memory that CPUs may map directly.
    pub fn mapped_peripherals(&self) -> Vec<PeripheralHandle> {
        self.index
            .blocks()
            .iter()
            .filter(|b| !b.handle().peripheral().mapped_segments().is_empty())
            .map(|b| b.handle().clone())
            .collect()
    }

    /// Hands `segment` to every CPU for direct access.
    ///
    /// A relative segment is placed through each registration point of `owner`, clipped to the
    /// window the point exposes. An absolute segment's start offset is its bus address.
    pub fn map_memory(
        &self,
        segment: Arc<dyn MappedSegment>,
        owner: &PeripheralRef,
        relative: bool,
    ) -> Result<()> {
        let mut registry = self.registry();
        let key = peripheral_key(owner);
        if !relative {
            let start = segment.start_offset();
            let size = segment.size();
            AddressRange::checked_with_size(start, size)
                .ok_or(BusError::AddressOverflow { start, len: size })?;
            let mapping = SegmentMapping {
                segment,
                start,
                segment_offset: 0,
                size,
            };
            install_mapping(&mut registry, key, None, mapping);
            return Ok(());
        }

        let points = self.registration_points(owner);
        if points.is_empty() {
            return Err(BusError::NotRegistered {
                peripheral: owner.name().to_owned(),
            });
        }
        for point in points {
            if let Some(mapping) = SegmentMapping::for_point(&segment, &point) {
                install_mapping(&mut registry, key, Some(point), mapping);
            }
        }
        Ok(())
    }

    /// Withdraws direct mappings intersecting `range` from every CPU.
    pub fn unmap_memory(&self, range: AddressRange) {
        let mut registry = self.registry();
        for cpu in registry.cpus.iter() {
            cpu.unmap_memory(range);
        }
        registry
            .mappings
            .retain(|m| !m.mapping.range().intersects(&range));
    }

    /// Registers a CPU in `point.slot` (or the lowest free slot) and replays every known memory
    /// mapping and watched page into it.
    pub fn register_cpu(&self, cpu: CpuRef, point: CpuRegistrationPoint) -> Result<u32> {
        let mut registry = self.registry();
        let slot = registry.cpus.insert(cpu.clone(), point.slot)?;
        for tracked in &registry.mappings {
            cpu.map_memory(&tracked.mapping);
        }
        for address in self.watchpoints.watched_addresses() {
            cpu.set_page_access_via_io(address);
        }
        tracing::debug!(slot, mappings = registry.mappings.len(), "registered CPU");
        Ok(slot)
    }

    pub fn unregister_cpu(&self, slot: u32) -> Result<CpuRef> {
        let cpu = self
            .registry()
            .cpus
            .remove(slot)
            .ok_or(BusError::CpuNotRegistered { slot })?;
        tracing::debug!(slot, "unregistered CPU");
        Ok(cpu)
    }

    pub fn cpus(&self) -> Vec<(u32, CpuRef)> {
        self.registry().cpus.entries()
    }

    pub fn cpu_id(&self, cpu: &CpuRef) -> Option<u32> {
        self.registry().cpus.slot_of(cpu)
    }

    /// Changes the bus endianness. Only allowed before the first peripheral is registered.
    pub fn set_endianness(&self, endianness: Endianness) -> Result<()> {
        let mut registry = self.registry();
        if registry.endianness_locked {
            return Err(RegistrationError::EndiannessLocked.into());
        }
        registry.endianness = endianness;
        Ok(())
    }

    /// Unregisters every peripheral and CPU and drops watchpoints, tags and fallback devices.
    /// The unexpected-access counters keep counting.
    pub fn clear(&self) {
        let mut registry = self.registry();
        withdraw_mappings(&mut registry, |_| true);
        self.index.clear();
        registry.cpus.clear();
        registry.endianness_locked = false;
        self.watchpoints.clear();
        self.unmapped.clear();
        tracing::debug!("cleared system bus");
    }

    /// Makes `range` read as zero and ignore writes, without reporting.
    pub fn silence_range(&self, range: AddressRange) -> Result<PeripheralHandle> {
        self.register(
            Arc::new(Silencer::new(range.size())),
            RegistrationPoint::range(range),
        )
    }

    /// Forwards every access to `[from, from + size)` to the same offset from `to`. The target
    /// range must fit in the address space and must not overlap the redirected range.
    pub fn redirect(&self, from: u64, to: u64, size: u64) -> Result<PeripheralHandle> {
        let range = AddressRange::checked_with_size(from, size)
            .ok_or(BusError::AddressOverflow { start: from, len: size })?;
        let miss = |reason: &'static str| BusError::RedirectMiss {
            from: range,
            target: to,
            reason,
        };
        let target = AddressRange::checked_with_size(to, size)
            .ok_or_else(|| miss("target leaves the address space"))?;
        if target.intersects(&range) {
            return Err(miss("target overlaps the redirected range"));
        }
        let redirector = Redirector::new(self.this.clone(), to, size);
        self.register(Arc::new(redirector), RegistrationPoint::range(range))
    }

    /// Names `range` for unmapped-access reports; reads of it return `default_value`. A range
    /// inside an existing tag splits it and is named `parent/name`.
    pub fn tag(
        &self,
        range: AddressRange,
        name: impl Into<String>,
        default_value: u32,
        pausing: bool,
    ) -> Result<()> {
        let entry = TagEntry {
            name: name.into(),
            default_value,
            pausing,
        };
        self.unmapped.tags().tag(range, entry)
    }

    pub fn remove_tag(&self, address: u64) -> Result<TagEntry> {
        self.unmapped.tags().remove_at(address)
    }

    pub fn tags(&self) -> Vec<(AddressRange, TagEntry)> {
        self.unmapped.tag_entries()
    }

    pub fn add_fallback(&self, device: Arc<dyn FallbackDevice>) {
        self.unmapped.add_fallback(device);
    }

    /// Installs the callback run when an access hits a pausing tag.
    pub fn set_pause_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.unmapped.set_pause_handler(Some(Arc::new(handler)));
    }

    pub fn clear_pause_handler(&self) {
        self.unmapped.set_pause_handler(None);
    }

    pub fn set_unhandled_access(&self, behaviour: UnhandledAccessBehaviour) {
        self.unmapped.set_behaviour(behaviour);
    }

    pub fn unhandled_access(&self) -> UnhandledAccessBehaviour {
        self.unmapped.behaviour()
    }

    pub fn unexpected_reads(&self) -> u64 {
        self.unmapped.unexpected_reads()
    }

    pub fn unexpected_writes(&self) -> u64 {
        self.unmapped.unexpected_writes()
    }
}

fn is_registration(block: &Block, handle: &PeripheralHandle) -> bool {
    same_peripheral(block.handle().peripheral(), handle.peripheral())
        && block.handle().point() == handle.point()
}

fn install_mapping(
    registry: &mut Registry,
    owner: usize,
    point: Option<RegistrationPoint>,
    mapping: SegmentMapping,
) {
    mapping.segment.touch();
    for cpu in registry.cpus.iter() {
        cpu.map_memory(&mapping);
    }
    tracing::trace!(range = %mapping.range(), "mapped memory segment");
    registry.mappings.push(TrackedMapping {
        owner,
        point,
        mapping,
    });
}

fn withdraw_mappings(registry: &mut Registry, mut matches: impl FnMut(&TrackedMapping) -> bool) {
    let (withdrawn, kept): (Vec<_>, Vec<_>) =
        std::mem::take(&mut registry.mappings).into_iter().partition(|m| matches(m));
    registry.mappings = kept;
    for tracked in withdrawn {
        for cpu in registry.cpus.iter() {
            cpu.unmap_memory(tracked.mapping.range());
        }
    }
}
