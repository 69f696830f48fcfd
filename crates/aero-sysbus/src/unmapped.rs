//! Accesses that hit no registered peripheral.
//!
//! An unmapped access is not an error. The address is looked up in the tag table (which may pause
//! the machine and supplies a default read value), then in the fallback devices, and finally
//! reported according to [`UnhandledAccessBehaviour`]. The unexpected-access counters count every
//! such access, reported or not.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::access::{Hex, Width};
use crate::error::{BusError, Result};
use crate::range::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnhandledAccessBehaviour {
    #[default]
    ReportAll,
    DoNotReport,
    ReportIfTagged,
    ReportIfNotTagged,
}

impl UnhandledAccessBehaviour {
    fn reports(self, tagged: bool) -> bool {
        match self {
            Self::ReportAll => true,
            Self::DoNotReport => false,
            Self::ReportIfTagged => tagged,
            Self::ReportIfNotTagged => !tagged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub name: String,
    pub default_value: u32,
    /// Hitting the tag pauses the machine through the pause handler.
    pub pausing: bool,
}

/// Something that can answer accesses to otherwise unmapped addresses, such as a register-file
/// model built from a device description.
pub trait FallbackDevice: Send + Sync {
    fn try_read(&self, address: u64, width: Width) -> Option<u32>;

    /// Returns `true` if the write was handled.
    fn try_write(&self, address: u64, value: u32, width: Width) -> bool;
}

pub type PauseFn = Arc<dyn Fn() + Send + Sync>;

/// Range-sorted, non-overlapping tags.
#[derive(Debug, Default)]
pub(crate) struct TagTable {
    tags: Vec<(AddressRange, TagEntry)>,
}

impl TagTable {
    fn insert_disjoint(&mut self, range: AddressRange, entry: TagEntry) {
        let idx = self.tags.partition_point(|(r, _)| r.start() < range.start());
        self.tags.insert(idx, (range, entry));
    }

    /// Tags `range`. A range inside exactly one existing tag splits that tag around it and is
    /// named `parent/name`.
    pub fn tag(&mut self, range: AddressRange, entry: TagEntry) -> Result<()> {
        let intersecting: Vec<usize> = self
            .tags
            .iter()
            .enumerate()
            .filter(|(_, (r, _))| r.intersects(&range))
            .map(|(i, _)| i)
            .collect();
        let parent = match intersecting.as_slice() {
            [] => {
                self.insert_disjoint(range, entry);
                return Ok(());
            }
            [idx] if self.tags[*idx].0.contains_range(&range) => *idx,
            _ => {
                return Err(BusError::TagConflict {
                    name: entry.name,
                    range,
                })
            }
        };

        let (parent_range, parent_entry) = self.tags.remove(parent);
        let left = AddressRange::new(parent_range.start(), range.start());
        let right = AddressRange::new(range.end(), parent_range.end());
        for part in [left, right] {
            if !part.is_empty() {
                self.insert_disjoint(part, parent_entry.clone());
            }
        }
        let name = format!("{}/{}", parent_entry.name, entry.name);
        self.insert_disjoint(range, TagEntry { name, ..entry });
        Ok(())
    }

    pub fn remove_at(&mut self, address: u64) -> Result<TagEntry> {
        let idx = self
            .tags
            .iter()
            .position(|(r, _)| r.contains(address))
            .ok_or(BusError::NoTag { address })?;
        Ok(self.tags.remove(idx).1)
    }

    pub fn find(&self, address: u64) -> Option<&TagEntry> {
        let idx = self.tags.partition_point(|(r, _)| r.start() <= address);
        let (range, entry) = self.tags.get(idx.checked_sub(1)?)?;
        range.contains(address).then_some(entry)
    }

    pub fn entries(&self) -> Vec<(AddressRange, TagEntry)> {
        self.tags.clone()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

/// CPU context that decorates unmapped-access reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AccessOrigin {
    pub cpu: u32,
    pub pc: Option<u64>,
}

struct Prefix(Option<AccessOrigin>);

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => Ok(()),
            Some(AccessOrigin { cpu, pc: None }) => write!(f, "[CPU{cpu}] "),
            Some(AccessOrigin { cpu, pc: Some(pc) }) => write!(f, "[CPU{cpu}: {pc:#x}] "),
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct UnmappedAccess {
    behaviour: RwLock<UnhandledAccessBehaviour>,
    default_read_value: u32,
    tags: RwLock<TagTable>,
    fallbacks: RwLock<Vec<Arc<dyn FallbackDevice>>>,
    pause: RwLock<Option<PauseFn>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl UnmappedAccess {
    pub fn new(behaviour: UnhandledAccessBehaviour, default_read_value: u32) -> Self {
        Self {
            behaviour: RwLock::new(behaviour),
            default_read_value,
            tags: RwLock::default(),
            fallbacks: RwLock::default(),
            pause: RwLock::default(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn behaviour(&self) -> UnhandledAccessBehaviour {
        *read_lock(&self.behaviour)
    }

    pub fn set_behaviour(&self, behaviour: UnhandledAccessBehaviour) {
        *write_lock(&self.behaviour) = behaviour;
    }

    pub fn tags(&self) -> RwLockWriteGuard<'_, TagTable> {
        write_lock(&self.tags)
    }

    pub fn tag_entries(&self) -> Vec<(AddressRange, TagEntry)> {
        read_lock(&self.tags).entries()
    }

    pub fn add_fallback(&self, device: Arc<dyn FallbackDevice>) {
        write_lock(&self.fallbacks).push(device);
    }

    pub fn set_pause_handler(&self, pause: Option<PauseFn>) {
        *write_lock(&self.pause) = pause;
    }

    pub fn unexpected_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn unexpected_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Looks up the tag at `address` and pauses the machine if it asks to.
    fn enter_tag(&self, address: u64) -> Option<TagEntry> {
        let tag = read_lock(&self.tags).find(address).cloned()?;
        if tag.pausing {
            let pause = read_lock(&self.pause).clone();
            match pause {
                Some(pause) => pause(),
                None => tracing::debug!(tag = %tag.name, "pausing tag hit without a pause handler"),
            }
        }
        Some(tag)
    }

    fn fallbacks(&self) -> Vec<Arc<dyn FallbackDevice>> {
        read_lock(&self.fallbacks).clone()
    }

    pub fn read(&self, address: u64, width: Width, origin: Option<AccessOrigin>) -> u32 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tag = self.enter_tag(address);
        if tag.is_none() {
            if let Some(value) = self.fallbacks().iter().find_map(|f| f.try_read(address, width)) {
                return value & width.value_mask();
            }
        }

        let value = tag
            .as_ref()
            .map_or(self.default_read_value, |t| t.default_value)
            & width.value_mask();
        if self.behaviour().reports(tag.is_some()) {
            let prefix = Prefix(origin);
            match &tag {
                Some(tag) => tracing::warn!(
                    address = %Hex(address),
                    tag = %tag.name,
                    "{prefix}(tag: '{}') read {width} from non-existing peripheral at {address:#x}, returning {value:#x}",
                    tag.name
                ),
                None => tracing::warn!(
                    address = %Hex(address),
                    "{prefix}read {width} from non-existing peripheral at {address:#x}, returning {value:#x}"
                ),
            }
        }
        value
    }

    pub fn write(&self, address: u64, value: u32, width: Width, origin: Option<AccessOrigin>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let tag = self.enter_tag(address);
        if tag.is_none() && self.fallbacks().iter().any(|f| f.try_write(address, value, width)) {
            return;
        }

        if self.behaviour().reports(tag.is_some()) {
            let prefix = Prefix(origin);
            match &tag {
                Some(tag) => tracing::warn!(
                    address = %Hex(address),
                    tag = %tag.name,
                    "{prefix}(tag: '{}') write {width} {value:#x} to non-existing peripheral at {address:#x}",
                    tag.name
                ),
                None => tracing::warn!(
                    address = %Hex(address),
                    "{prefix}write {width} {value:#x} to non-existing peripheral at {address:#x}"
                ),
            }
        }
    }

    pub fn clear(&self) {
        write_lock(&self.tags).clear();
        write_lock(&self.fallbacks).clear();
    }
}
