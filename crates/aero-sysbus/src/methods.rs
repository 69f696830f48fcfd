//! Per-registration accessor tables and their decorator stages.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::access::{BusValue, Operation};

pub type ReadFn<T> = Arc<dyn Fn(u64) -> T + Send + Sync>;
pub type WriteFn<T> = Arc<dyn Fn(u64, T) + Send + Sync>;
pub type AbsoluteAddressFn = Arc<dyn Fn(u64) + Send + Sync>;

pub type ReadSlot<T> = Slot<ReadFn<T>>;
pub type WriteSlot<T> = Slot<WriteFn<T>>;

/// How the synthesizer filled a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Native,
    /// Tagged accessor of the registration's region.
    Region,
    Translated {
        via: crate::access::Width,
    },
    /// Nothing can serve the access; dispatching it is a capability error.
    NotTranslated,
}

/// Decorator kinds, in the order they wrap the base accessor (innermost first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Logging,
    Transform,
}

pub(crate) type Decorator<F> = Arc<dyn Fn(F) -> F + Send + Sync>;

#[derive(Clone)]
struct Stage<F> {
    kind: StageKind,
    wrap: Decorator<F>,
}

/// One accessor slot: the synthesized base accessor plus a stack of named decorators.
///
/// `effective` is the composed accessor the dispatcher calls. With no stages it is the base
/// accessor itself (the same `Arc`), so popping the last stage restores the original reference.
#[derive(Clone)]
pub struct Slot<F> {
    resolution: Resolution,
    base: Option<F>,
    stages: Vec<Stage<F>>,
    effective: Option<F>,
}

impl<F: Clone> Slot<F> {
    pub(crate) fn new(resolution: Resolution, base: Option<F>) -> Self {
        Self {
            resolution,
            effective: base.clone(),
            base,
            stages: Vec::new(),
        }
    }

    pub(crate) fn unresolved() -> Self {
        Self::new(Resolution::NotTranslated, None)
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn base(&self) -> Option<&F> {
        self.base.as_ref()
    }

    #[inline]
    pub fn effective(&self) -> Option<&F> {
        self.effective.as_ref()
    }

    pub fn has_stage(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|s| s.kind == kind)
    }

    pub fn stages(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.iter().map(|s| s.kind)
    }

    /// Returns `false` (and changes nothing) if a stage of this kind is already present.
    pub(crate) fn push_stage(&mut self, kind: StageKind, wrap: Decorator<F>) -> bool {
        if self.has_stage(kind) {
            return false;
        }
        let at = self.stages.partition_point(|s| s.kind < kind);
        self.stages.insert(at, Stage { kind, wrap });
        self.recompose();
        true
    }

    pub(crate) fn pop_stage(&mut self, kind: StageKind) -> bool {
        let before = self.stages.len();
        self.stages.retain(|s| s.kind != kind);
        if self.stages.len() == before {
            return false;
        }
        self.recompose();
        true
    }

    fn recompose(&mut self) {
        let mut accessor = self.base.clone();
        for stage in &self.stages {
            accessor = accessor.map(|inner| (stage.wrap)(inner));
        }
        self.effective = accessor;
    }
}

/// The six accessors of one registration, its absolute-address setter and its lock.
///
/// Tables are never mutated once installed in the index; toggling a decorator clones the table,
/// edits the clone and swaps it in. Clones share the lock, so accesses that straddle a swap are
/// still serialized.
#[derive(Clone)]
pub struct AccessMethodTable {
    pub(crate) read_byte: ReadSlot<u8>,
    pub(crate) write_byte: WriteSlot<u8>,
    pub(crate) read_word: ReadSlot<u16>,
    pub(crate) write_word: WriteSlot<u16>,
    pub(crate) read_double_word: ReadSlot<u32>,
    pub(crate) write_double_word: WriteSlot<u32>,
    pub(crate) set_absolute_address: Option<AbsoluteAddressFn>,
    lock: Arc<Mutex<()>>,
    unsupported_reported: Arc<AtomicU8>,
    peripheral_name: Arc<str>,
}

impl AccessMethodTable {
    pub(crate) fn empty(peripheral_name: &str) -> Self {
        Self {
            read_byte: Slot::unresolved(),
            write_byte: Slot::unresolved(),
            read_word: Slot::unresolved(),
            write_word: Slot::unresolved(),
            read_double_word: Slot::unresolved(),
            write_double_word: Slot::unresolved(),
            set_absolute_address: None,
            lock: Arc::new(Mutex::new(())),
            unsupported_reported: Arc::new(AtomicU8::new(0)),
            peripheral_name: Arc::from(peripheral_name),
        }
    }

    pub fn peripheral_name(&self) -> &str {
        &self.peripheral_name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.peripheral_name.clone()
    }

    pub fn read_slot<T: BusValue>(&self) -> &ReadSlot<T> {
        T::read_slot(self)
    }

    pub fn write_slot<T: BusValue>(&self) -> &WriteSlot<T> {
        T::write_slot(self)
    }

    pub fn resolution(&self, operation: Operation) -> Resolution {
        match operation {
            Operation::ReadByte => self.read_byte.resolution(),
            Operation::WriteByte => self.write_byte.resolution(),
            Operation::ReadWord => self.read_word.resolution(),
            Operation::WriteWord => self.write_word.resolution(),
            Operation::ReadDoubleWord => self.read_double_word.resolution(),
            Operation::WriteDoubleWord => self.write_double_word.resolution(),
        }
    }

    pub fn has_absolute_address_setter(&self) -> bool {
        self.set_absolute_address.is_some()
    }

    /// Acquires the registration lock. A peripheral that panicked while holding it does not
    /// poison later accesses.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns `true` the first time an unsupported `operation` is reported for this
    /// registration.
    pub(crate) fn first_unsupported(&self, operation: Operation) -> bool {
        let bit = operation.bit();
        self.unsupported_reported.fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    /// Hands each of the six slots to `visitor`.
    pub(crate) fn for_each_slot<V: SlotVisitor>(&mut self, visitor: &mut V) {
        visitor.read(&mut self.read_byte);
        visitor.write(&mut self.write_byte);
        visitor.read(&mut self.read_word);
        visitor.write(&mut self.write_word);
        visitor.read(&mut self.read_double_word);
        visitor.write(&mut self.write_double_word);
    }
}

/// Visits slots of every width; see [`AccessMethodTable::for_each_slot`].
pub(crate) trait SlotVisitor {
    fn read<T: BusValue>(&mut self, slot: &mut ReadSlot<T>);
    fn write<T: BusValue>(&mut self, slot: &mut WriteSlot<T>);
}

impl fmt::Debug for AccessMethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AccessMethodTable");
        s.field("peripheral", &self.peripheral_name);
        for operation in Operation::ALL {
            s.field(&operation.to_string(), &self.resolution(operation));
        }
        s.field("absolute_address_aware", &self.has_absolute_address_setter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubling() -> Decorator<ReadFn<u8>> {
        Arc::new(|inner: ReadFn<u8>| -> ReadFn<u8> { Arc::new(move |o: u64| inner(o).wrapping_mul(2)) })
    }

    fn plus_one() -> Decorator<ReadFn<u8>> {
        Arc::new(|inner: ReadFn<u8>| -> ReadFn<u8> { Arc::new(move |o: u64| inner(o).wrapping_add(1)) })
    }

    #[test]
    fn popping_last_stage_restores_base_reference() {
        let base: ReadFn<u8> = Arc::new(|o: u64| o as u8);
        let mut slot = Slot::new(Resolution::Native, Some(base.clone()));

        assert!(slot.push_stage(StageKind::Logging, doubling()));
        let wrapped = slot.effective().unwrap().clone();
        assert!(!Arc::ptr_eq(&wrapped, &base));

        assert!(!slot.push_stage(StageKind::Logging, doubling()));
        assert!(Arc::ptr_eq(slot.effective().unwrap(), &wrapped));

        assert!(slot.pop_stage(StageKind::Logging));
        assert!(Arc::ptr_eq(slot.effective().unwrap(), &base));
        assert!(!slot.pop_stage(StageKind::Logging));
    }

    #[test]
    fn stages_compose_in_kind_order() {
        let base: ReadFn<u8> = Arc::new(|_: u64| 3);
        let mut slot = Slot::new(Resolution::Native, Some(base));

        // Pushed out of order; logging still wraps the base first.
        slot.push_stage(StageKind::Transform, plus_one());
        slot.push_stage(StageKind::Logging, doubling());
        assert_eq!(
            slot.stages().collect::<Vec<_>>(),
            [StageKind::Logging, StageKind::Transform]
        );
        assert_eq!((slot.effective().unwrap())(0), 7);
    }

    #[test]
    fn unresolved_slot_stays_empty_under_decorators() {
        let mut slot: ReadSlot<u8> = Slot::unresolved();
        slot.push_stage(StageKind::Logging, doubling());
        assert!(slot.effective().is_none());
        assert_eq!(slot.resolution(), Resolution::NotTranslated);
    }

    #[test]
    fn unsupported_is_reported_once_per_operation() {
        let table = AccessMethodTable::empty("dev");
        assert!(table.first_unsupported(Operation::ReadWord));
        assert!(!table.first_unsupported(Operation::ReadWord));
        assert!(table.clone().first_unsupported(Operation::WriteWord));
        assert!(!table.first_unsupported(Operation::WriteWord));
    }
}
