use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RegistrationError;
use crate::peripheral::SegmentMapping;
use crate::range::AddressRange;

/// The bus-facing side of a simulated CPU.
pub trait Cpu: Send + Sync {
    /// Lets the CPU access `mapping` directly instead of dispatching through the bus.
    fn map_memory(&self, mapping: &SegmentMapping);

    fn unmap_memory(&self, range: AddressRange);

    /// Brings externally observable state (such as the program counter) up to date.
    fn update_context(&self) {}

    /// Forces accesses to the page containing `address` back through the bus.
    fn set_page_access_via_io(&self, _address: u64) {}

    fn clear_page_access_via_io(&self, _address: u64) {}

    fn pc(&self) -> Option<u64> {
        None
    }
}

pub type CpuRef = Arc<dyn Cpu>;

fn cpu_key(cpu: &CpuRef) -> usize {
    Arc::as_ptr(cpu).cast::<()>() as usize
}

#[derive(Default)]
pub(crate) struct CpuRegistry {
    by_slot: BTreeMap<u32, CpuRef>,
}

impl CpuRegistry {
    /// Registers `cpu` in `slot`, or in the lowest free slot.
    pub fn insert(&mut self, cpu: CpuRef, slot: Option<u32>) -> Result<u32, RegistrationError> {
        if let Some(existing) = self.slot_of(&cpu) {
            return Err(RegistrationError::CpuAlreadyRegistered { slot: existing });
        }
        let slot = match slot {
            Some(slot) if self.by_slot.contains_key(&slot) => {
                return Err(RegistrationError::CpuSlotTaken { slot });
            }
            Some(slot) => slot,
            None => (0..).find(|s| !self.by_slot.contains_key(s)).unwrap_or(u32::MAX),
        };
        self.by_slot.insert(slot, cpu);
        Ok(slot)
    }

    pub fn remove(&mut self, slot: u32) -> Option<CpuRef> {
        self.by_slot.remove(&slot)
    }

    pub fn get(&self, slot: u32) -> Option<&CpuRef> {
        self.by_slot.get(&slot)
    }

    pub fn slot_of(&self, cpu: &CpuRef) -> Option<u32> {
        let key = cpu_key(cpu);
        self.by_slot
            .iter()
            .find_map(|(slot, c)| (cpu_key(c) == key).then_some(*slot))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuRef> + '_ {
        self.by_slot.values()
    }

    pub fn entries(&self) -> Vec<(u32, CpuRef)> {
        self.by_slot.iter().map(|(s, c)| (*s, c.clone())).collect()
    }

    pub fn clear(&mut self) {
        self.by_slot.clear();
    }
}
