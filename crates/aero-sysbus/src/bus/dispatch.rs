use std::sync::Arc;

use super::SystemBus;
use crate::access::{Access, BusValue, Direction, Operation, WidthMask};
use crate::cpu::CpuRef;
use crate::error::{BusError, Result};
use crate::hooks::{transform_read, transform_write, DisableLogging, EnableLogging, HookFn, WatchpointFn};
use crate::index::{Block, LookupCache, LookupStatistics};
use crate::methods::{AccessMethodTable, StageKind};
use crate::peripheral::PeripheralRef;
use crate::range::AddressRange;
use crate::unmapped::AccessOrigin;

fn origin(cpu: Option<&(u32, CpuRef)>) -> Option<AccessOrigin> {
    cpu.map(|(slot, cpu)| AccessOrigin {
        cpu: *slot,
        pc: cpu.pc(),
    })
}

impl SystemBus {
    #[inline]
    pub(crate) fn read_with<T: BusValue>(
        &self,
        address: u64,
        cache: &mut LookupCache,
        cpu: Option<&(u32, CpuRef)>,
    ) -> Result<T> {
        self.watchpoints
            .fire(address, T::WIDTH, Direction::Read, || self.update_context(cpu));

        let Some(block) = self.index.lookup(address, cache) else {
            let value = self.unmapped.read(address, T::WIDTH, origin(cpu));
            return Ok(T::from_u32(value));
        };
        let methods = block.methods();
        let Some(read) = T::read_slot(methods).effective() else {
            return Err(unsupported(block, Operation::new(T::WIDTH, Direction::Read), address));
        };
        let offset = block.local_offset(address);

        let _guard = methods.lock();
        if let Some(set_absolute_address) = &methods.set_absolute_address {
            set_absolute_address(address);
        }
        Ok(read(offset))
    }

    #[inline]
    pub(crate) fn write_with<T: BusValue>(
        &self,
        address: u64,
        value: T,
        cache: &mut LookupCache,
        cpu: Option<&(u32, CpuRef)>,
    ) -> Result<()> {
        let result = match self.index.lookup(address, cache) {
            None => {
                self.unmapped
                    .write(address, value.to_u32(), T::WIDTH, origin(cpu));
                Ok(())
            }
            Some(block) => {
                let methods = block.methods();
                match T::write_slot(methods).effective() {
                    None => Err(unsupported(
                        block,
                        Operation::new(T::WIDTH, Direction::Write),
                        address,
                    )),
                    Some(write) => {
                        let offset = block.local_offset(address);
                        let _guard = methods.lock();
                        if let Some(set_absolute_address) = &methods.set_absolute_address {
                            set_absolute_address(address);
                        }
                        write(offset, value);
                        Ok(())
                    }
                }
            }
        };

        // Write hooks see failed accesses too, as read hooks do.
        self.watchpoints
            .fire(address, T::WIDTH, Direction::Write, || self.update_context(cpu));
        result
    }

    pub fn read<T: BusValue>(&self, address: u64) -> Result<T> {
        self.read_with(address, &mut LookupCache::default(), None)
    }

    pub fn write<T: BusValue>(&self, address: u64, value: T) -> Result<()> {
        self.write_with(address, value, &mut LookupCache::default(), None)
    }

    pub fn read_byte(&self, address: u64) -> Result<u8> {
        self.read(address)
    }

    pub fn read_word(&self, address: u64) -> Result<u16> {
        self.read(address)
    }

    pub fn read_double_word(&self, address: u64) -> Result<u32> {
        self.read(address)
    }

    pub fn write_byte(&self, address: u64, value: u8) -> Result<()> {
        self.write(address, value)
    }

    pub fn write_word(&self, address: u64, value: u16) -> Result<()> {
        self.write(address, value)
    }

    pub fn write_double_word(&self, address: u64, value: u32) -> Result<()> {
        self.write(address, value)
    }

    /// An access handle with its own lookup cache, not bound to any CPU.
    pub fn handle(self: &Arc<Self>) -> BusHandle {
        BusHandle {
            bus: self.clone(),
            cache: LookupCache::default(),
            cpu: None,
        }
    }

    /// An access handle for the CPU in `slot`. Unmapped accesses through it are reported with the
    /// CPU's slot and program counter, and watchpoints update only that CPU's context.
    pub fn cpu_handle(self: &Arc<Self>, slot: u32) -> Result<BusHandle> {
        let cpu = self
            .registry()
            .cpus
            .get(slot)
            .cloned()
            .ok_or(BusError::CpuNotRegistered { slot })?;
        Ok(BusHandle {
            bus: self.clone(),
            cache: LookupCache::default(),
            cpu: Some((slot, cpu)),
        })
    }

    /// Runs `action` on every `widths` access in `access` directions at `address`: before the
    /// accessor for reads, after it for writes. With `update_context` the accessing CPU's state is
    /// brought up to date first.
    pub fn add_watchpoint(
        &self,
        address: u64,
        widths: WidthMask,
        access: Access,
        update_context: bool,
        action: WatchpointFn,
    ) -> Result<()> {
        if widths.is_empty() {
            return Err(BusError::InvalidWatchpoint {
                address,
                reason: "no access width selected",
            });
        }
        if access.is_empty() {
            return Err(BusError::InvalidWatchpoint {
                address,
                reason: "no access direction selected",
            });
        }
        self.watchpoints
            .add(address, widths, access, update_context, action, || {
                for cpu in self.cpu_snapshot() {
                    cpu.set_page_access_via_io(address);
                }
            });
        Ok(())
    }

    /// Removes the watchpoints at `address` installed with `action` (compared by identity).
    pub fn remove_watchpoint(&self, address: u64, action: &WatchpointFn) {
        self.watchpoints
            .remove(address, action, || self.release_page(address));
    }

    pub fn remove_all_watchpoints(&self, address: u64) {
        self.watchpoints
            .remove_all(address, || self.release_page(address));
    }

    fn release_page(&self, address: u64) {
        for cpu in self.cpu_snapshot() {
            cpu.clear_page_access_via_io(address);
        }
    }

    pub fn is_watchpoint_at(&self, address: u64, access: Access) -> bool {
        self.watchpoints.is_watched(address, access)
    }

    /// Swaps the accessor table of every registration of `peripheral` for an edited copy.
    fn redecorate(
        &self,
        peripheral: &PeripheralRef,
        mut edit: impl FnMut(&mut AccessMethodTable),
    ) -> Result<()> {
        let visited = self.index.visit(peripheral, |table| {
            let mut table = table.clone();
            edit(&mut table);
            table
        });
        if visited == 0 {
            return Err(BusError::NotRegistered {
                peripheral: peripheral.name().to_owned(),
            });
        }
        Ok(())
    }

    /// Logs every access to `peripheral` at `info` level under the `aero_sysbus::access` target.
    /// Enabling twice is the same as enabling once; disabling restores the undecorated accessors.
    pub fn log_peripheral_access(&self, peripheral: &PeripheralRef, enable: bool) -> Result<()> {
        self.redecorate(peripheral, |table| {
            if enable {
                let mut visitor = EnableLogging {
                    peripheral: table.shared_name(),
                };
                table.for_each_slot(&mut visitor);
            } else {
                table.for_each_slot(&mut DisableLogging);
            }
        })?;
        tracing::debug!(peripheral = peripheral.name(), enable, "peripheral access logging");
        Ok(())
    }

    /// Passes every `T`-wide value read from `peripheral` through `hook`, replacing any previous
    /// read hook of that width. With `subrange`, only peripheral-local offsets inside it are
    /// transformed.
    pub fn set_hook_after_read<T: BusValue>(
        &self,
        peripheral: &PeripheralRef,
        hook: HookFn<T>,
        subrange: Option<AddressRange>,
    ) -> Result<()> {
        self.redecorate(peripheral, |table| {
            let slot = T::read_slot_mut(table);
            slot.pop_stage(StageKind::Transform);
            slot.push_stage(StageKind::Transform, transform_read(hook.clone(), subrange));
        })
    }

    pub fn clear_hook_after_read<T: BusValue>(&self, peripheral: &PeripheralRef) -> Result<()> {
        self.redecorate(peripheral, |table| {
            T::read_slot_mut(table).pop_stage(StageKind::Transform);
        })
    }

    /// Passes every `T`-wide value written to `peripheral` through `hook` before the peripheral
    /// sees it.
    pub fn set_hook_before_write<T: BusValue>(
        &self,
        peripheral: &PeripheralRef,
        hook: HookFn<T>,
        subrange: Option<AddressRange>,
    ) -> Result<()> {
        self.redecorate(peripheral, |table| {
            let slot = T::write_slot_mut(table);
            slot.pop_stage(StageKind::Transform);
            slot.push_stage(StageKind::Transform, transform_write(hook.clone(), subrange));
        })
    }

    pub fn clear_hook_before_write<T: BusValue>(&self, peripheral: &PeripheralRef) -> Result<()> {
        self.redecorate(peripheral, |table| {
            T::write_slot_mut(table).pop_stage(StageKind::Transform);
        })
    }
}

#[cold]
fn unsupported(block: &Block, operation: Operation, address: u64) -> BusError {
    let methods = block.methods();
    let offset = block.local_offset(address);
    if methods.first_unsupported(operation) {
        tracing::warn!(
            peripheral = methods.peripheral_name(),
            address = %crate::access::Hex(address),
            "{} does not implement {operation} and no translation is allowed",
            methods.peripheral_name()
        );
    }
    BusError::Unsupported {
        peripheral: methods.peripheral_name().to_owned(),
        operation,
        offset,
    }
}

/// Access path of one CPU or thread. Owns the lookup cache that makes repeated accesses to the
/// same registration skip the index.
pub struct BusHandle {
    bus: Arc<SystemBus>,
    cache: LookupCache,
    cpu: Option<(u32, CpuRef)>,
}

impl BusHandle {
    pub fn bus(&self) -> &Arc<SystemBus> {
        &self.bus
    }

    pub fn cpu_slot(&self) -> Option<u32> {
        self.cpu.as_ref().map(|(slot, _)| *slot)
    }

    pub fn statistics(&self) -> LookupStatistics {
        self.cache.statistics()
    }

    #[inline]
    pub fn read<T: BusValue>(&mut self, address: u64) -> Result<T> {
        self.bus.read_with(address, &mut self.cache, self.cpu.as_ref())
    }

    #[inline]
    pub fn write<T: BusValue>(&mut self, address: u64, value: T) -> Result<()> {
        self.bus
            .write_with(address, value, &mut self.cache, self.cpu.as_ref())
    }

    pub fn read_byte(&mut self, address: u64) -> Result<u8> {
        self.read(address)
    }

    pub fn read_word(&mut self, address: u64) -> Result<u16> {
        self.read(address)
    }

    pub fn read_double_word(&mut self, address: u64) -> Result<u32> {
        self.read(address)
    }

    pub fn write_byte(&mut self, address: u64, value: u8) -> Result<()> {
        self.write(address, value)
    }

    pub fn write_word(&mut self, address: u64, value: u16) -> Result<()> {
        self.write(address, value)
    }

    pub fn write_double_word(&mut self, address: u64, value: u32) -> Result<()> {
        self.write(address, value)
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("cpu", &self.cpu_slot())
            .field("statistics", &self.cache.statistics())
            .finish()
    }
}
