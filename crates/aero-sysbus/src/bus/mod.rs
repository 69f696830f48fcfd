//! The system bus: registration, dispatch and bulk transfer over one address space.
//!
//! Dispatch never takes the registry lock. It reads the [`AddressSpaceIndex`] through a
//! caller-owned [`LookupCache`] and serializes only on the per-registration lock of the
//! [`AccessMethodTable`](crate::AccessMethodTable) it resolved. The registry lock is held by
//! registration, unregistration and CPU management, which are rare.

mod bulk;
mod dispatch;
mod registration;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub use dispatch::BusHandle;

use crate::config::BusConfig;
use crate::cpu::{CpuRef, CpuRegistry};
use crate::hooks::Watchpoints;
use crate::index::AddressSpaceIndex;
use crate::peripheral::{Endianness, SegmentMapping};
use crate::range::RegistrationPoint;
use crate::unmapped::UnmappedAccess;

/// A direct memory mapping handed to CPUs, remembered so it can be replayed to CPUs registered
/// later and withdrawn when its owner goes away.
struct TrackedMapping {
    owner: usize,
    /// Registration point the mapping was derived from; `None` for absolute mappings.
    point: Option<RegistrationPoint>,
    mapping: SegmentMapping,
}

struct Registry {
    endianness: Endianness,
    /// Set by the first registration; endianness is fixed from then on.
    endianness_locked: bool,
    cpus: CpuRegistry,
    mappings: Vec<TrackedMapping>,
}

pub struct SystemBus {
    index: AddressSpaceIndex,
    registry: Mutex<Registry>,
    watchpoints: Watchpoints,
    unmapped: UnmappedAccess,
    this: Weak<SystemBus>,
}

impl SystemBus {
    pub fn new() -> Arc<Self> {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            index: AddressSpaceIndex::new(),
            registry: Mutex::new(Registry {
                endianness: config.endianness,
                endianness_locked: false,
                cpus: CpuRegistry::default(),
                mappings: Vec::new(),
            }),
            watchpoints: Watchpoints::default(),
            unmapped: UnmappedAccess::new(config.unhandled_access, config.unmapped_read_value),
            this: this.clone(),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Read access to the index, mostly useful for inspection and tests.
    pub fn index(&self) -> &AddressSpaceIndex {
        &self.index
    }

    pub fn endianness(&self) -> Endianness {
        self.registry().endianness
    }

    fn cpu_snapshot(&self) -> Vec<CpuRef> {
        self.registry().cpus.iter().cloned().collect()
    }

    /// Brings the accessing CPU's observable state up to date before a watchpoint inspects it.
    /// Accesses that do not come from a CPU update every registered CPU.
    fn update_context(&self, cpu: Option<&(u32, CpuRef)>) {
        match cpu {
            Some((_, cpu)) => cpu.update_context(),
            None => {
                for cpu in self.cpu_snapshot() {
                    cpu.update_context();
                }
            }
        }
    }
}

impl std::fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("SystemBus")
            .field("endianness", &registry.endianness)
            .field("registrations", &self.index.blocks().len())
            .field("cpus", &registry.cpus.entries().len())
            .finish()
    }
}
