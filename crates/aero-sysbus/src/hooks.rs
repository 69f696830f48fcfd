//! Watchpoints and accessor decorators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::access::{Access, BusValue, Direction, Hex, Width, WidthMask};
use crate::methods::{Decorator, ReadFn, ReadSlot, SlotVisitor, StageKind, WriteFn, WriteSlot};
use crate::range::AddressRange;

/// Watchpoint callback, invoked with the accessed address and width.
pub type WatchpointFn = Arc<dyn Fn(u64, Width) + Send + Sync>;

/// Value transform installed with `set_hook_after_read` / `set_hook_before_write`. Receives the
/// value and the peripheral-local offset and returns the value to pass on.
pub type HookFn<T> = Arc<dyn Fn(T, u64) -> T + Send + Sync>;

#[derive(Clone)]
struct Watchpoint {
    widths: WidthMask,
    update_context: bool,
    action: WatchpointFn,
}

type WatchMap = HashMap<u64, Vec<Watchpoint>>;

#[derive(Default)]
pub(crate) struct Watchpoints {
    reads: RwLock<WatchMap>,
    writes: RwLock<WatchMap>,
    /// Total number of installed hooks; zero lets accesses skip the maps entirely.
    armed: AtomicUsize,
    /// Serializes edits together with the page-routing updates they trigger.
    edits: Mutex<()>,
}

fn read_map(lock: &RwLock<WatchMap>) -> RwLockReadGuard<'_, WatchMap> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_map(lock: &RwLock<WatchMap>) -> RwLockWriteGuard<'_, WatchMap> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Watchpoints {
    fn map(&self, direction: Direction) -> &RwLock<WatchMap> {
        match direction {
            Direction::Read => &self.reads,
            Direction::Write => &self.writes,
        }
    }

    /// Both maps, locked for writing in a fixed order.
    fn write_maps(&self) -> [RwLockWriteGuard<'_, WatchMap>; 2] {
        [write_map(&self.reads), write_map(&self.writes)]
    }

    fn edit(&self) -> MutexGuard<'_, ()> {
        match self.edits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Installs a hook. If `address` had no hooks before, runs `on_watched` before any other edit
    /// can run. Returns whether `address` was newly watched.
    pub fn add(
        &self,
        address: u64,
        widths: WidthMask,
        access: Access,
        update_context: bool,
        action: WatchpointFn,
        on_watched: impl FnOnce(),
    ) -> bool {
        let _edit = self.edit();
        let hook = Watchpoint {
            widths,
            update_context,
            action,
        };
        let newly_watched = {
            let mut maps = self.write_maps();
            let newly_watched = maps.iter().all(|map| !map.contains_key(&address));
            for (direction, map) in [Direction::Read, Direction::Write].into_iter().zip(&mut maps) {
                if access.contains(direction.access()) {
                    map.entry(address).or_default().push(hook.clone());
                    self.armed.fetch_add(1, Ordering::Release);
                }
            }
            newly_watched
        };
        if newly_watched {
            on_watched();
        }
        newly_watched
    }

    /// Removes every hook at `address` whose action is `action`. If that leaves `address`
    /// unwatched, runs `on_unwatched` before any other edit can run. Returns whether it did.
    pub fn remove(&self, address: u64, action: &WatchpointFn, on_unwatched: impl FnOnce()) -> bool {
        self.remove_matching(address, |hook| Arc::ptr_eq(&hook.action, action), on_unwatched)
    }

    pub fn remove_all(&self, address: u64, on_unwatched: impl FnOnce()) -> bool {
        self.remove_matching(address, |_| true, on_unwatched)
    }

    fn remove_matching(
        &self,
        address: u64,
        matches: impl Fn(&Watchpoint) -> bool,
        on_unwatched: impl FnOnce(),
    ) -> bool {
        let _edit = self.edit();
        let unwatched = {
            let mut maps = self.write_maps();
            let mut removed = 0;
            for map in &mut maps {
                if let Some(hooks) = map.get_mut(&address) {
                    let before = hooks.len();
                    hooks.retain(|hook| !matches(hook));
                    removed += before - hooks.len();
                    if hooks.is_empty() {
                        map.remove(&address);
                    }
                }
            }
            self.armed.fetch_sub(removed, Ordering::Release);
            removed > 0 && maps.iter().all(|map| !map.contains_key(&address))
        };
        if unwatched {
            on_unwatched();
        }
        unwatched
    }

    pub fn is_watched(&self, address: u64, access: Access) -> bool {
        [Direction::Read, Direction::Write]
            .into_iter()
            .filter(|d| access.contains(d.access()))
            .any(|d| read_map(self.map(d)).contains_key(&address))
    }

    pub fn watched_addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = read_map(&self.reads).keys().copied().collect();
        addresses.extend(read_map(&self.writes).keys().copied());
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    pub fn clear(&self) {
        let _edit = self.edit();
        for map in &mut self.write_maps() {
            map.clear();
        }
        self.armed.store(0, Ordering::Release);
    }

    /// Runs the hooks at `address` matching `width`, in installation order. Hooks are cloned out
    /// of the map first, so they may add or remove watchpoints.
    #[inline]
    pub fn fire(
        &self,
        address: u64,
        width: Width,
        direction: Direction,
        update_context: impl Fn(),
    ) {
        if self.armed.load(Ordering::Acquire) == 0 {
            return;
        }
        let hooks: Vec<Watchpoint> = match read_map(self.map(direction)).get(&address) {
            Some(hooks) => hooks.iter().filter(|h| h.widths.has(width)).cloned().collect(),
            None => return,
        };
        for hook in hooks {
            if hook.update_context {
                update_context();
            }
            (hook.action)(address, width);
        }
    }
}

pub(crate) struct EnableLogging {
    pub peripheral: Arc<str>,
}

impl SlotVisitor for EnableLogging {
    fn read<T: BusValue>(&mut self, slot: &mut ReadSlot<T>) {
        slot.push_stage(StageKind::Logging, logging_read::<T>(self.peripheral.clone()));
    }

    fn write<T: BusValue>(&mut self, slot: &mut WriteSlot<T>) {
        slot.push_stage(StageKind::Logging, logging_write::<T>(self.peripheral.clone()));
    }
}

pub(crate) struct DisableLogging;

impl SlotVisitor for DisableLogging {
    fn read<T: BusValue>(&mut self, slot: &mut ReadSlot<T>) {
        slot.pop_stage(StageKind::Logging);
    }

    fn write<T: BusValue>(&mut self, slot: &mut WriteSlot<T>) {
        slot.pop_stage(StageKind::Logging);
    }
}

fn logging_read<T: BusValue>(peripheral: Arc<str>) -> Decorator<ReadFn<T>> {
    Arc::new(move |inner: ReadFn<T>| -> ReadFn<T> {
        let peripheral = peripheral.clone();
        Arc::new(move |offset: u64| {
            let value = inner(offset);
            tracing::info!(
                target: "aero_sysbus::access",
                peripheral = %peripheral,
                offset = %Hex(offset),
                value = %Hex(value),
                "read {}",
                T::WIDTH
            );
            value
        })
    })
}

fn logging_write<T: BusValue>(peripheral: Arc<str>) -> Decorator<WriteFn<T>> {
    Arc::new(move |inner: WriteFn<T>| -> WriteFn<T> {
        let peripheral = peripheral.clone();
        Arc::new(move |offset: u64, value: T| {
            tracing::info!(
                target: "aero_sysbus::access",
                peripheral = %peripheral,
                offset = %Hex(offset),
                value = %Hex(value),
                "write {}",
                T::WIDTH
            );
            inner(offset, value)
        })
    })
}

/// Applies `hook` to values read at local offsets inside `subrange` (everywhere if `None`).
pub(crate) fn transform_read<T: BusValue>(
    hook: HookFn<T>,
    subrange: Option<AddressRange>,
) -> Decorator<ReadFn<T>> {
    Arc::new(move |inner: ReadFn<T>| -> ReadFn<T> {
        let hook = hook.clone();
        Arc::new(move |offset: u64| {
            let value = inner(offset);
            if subrange.map_or(true, |r| r.contains(offset)) {
                hook(value, offset)
            } else {
                value
            }
        })
    })
}

/// Applies `hook` to values written at local offsets inside `subrange` (everywhere if `None`).
pub(crate) fn transform_write<T: BusValue>(
    hook: HookFn<T>,
    subrange: Option<AddressRange>,
) -> Decorator<WriteFn<T>> {
    Arc::new(move |inner: WriteFn<T>| -> WriteFn<T> {
        let hook = hook.clone();
        Arc::new(move |offset: u64, value: T| {
            let value = if subrange.map_or(true, |r| r.contains(offset)) {
                hook(value, offset)
            } else {
                value
            };
            inner(offset, value)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<(u64, Width)>>>, WatchpointFn) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let action: WatchpointFn = Arc::new(move |address: u64, width: Width| {
            sink.lock().unwrap().push((address, width));
        });
        (seen, action)
    }

    #[test]
    fn hooks_filter_by_width_and_direction() {
        let watchpoints = Watchpoints::default();
        let (seen, action) = recorder();
        assert!(watchpoints.add(0x10, WidthMask::BYTE, Access::READ, false, action, || {}));

        watchpoints.fire(0x10, Width::Byte, Direction::Read, || {});
        watchpoints.fire(0x10, Width::DoubleWord, Direction::Read, || {});
        watchpoints.fire(0x10, Width::Byte, Direction::Write, || {});
        watchpoints.fire(0x11, Width::Byte, Direction::Read, || {});

        assert_eq!(*seen.lock().unwrap(), [(0x10, Width::Byte)]);
    }

    #[test]
    fn update_context_runs_before_the_action() {
        let watchpoints = Watchpoints::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        watchpoints.add(
            0x20,
            WidthMask::all(),
            Access::WRITE,
            true,
            Arc::new(move |_: u64, _: Width| sink.lock().unwrap().push("hook")),
            || {},
        );
        watchpoints.fire(0x20, Width::Word, Direction::Write, || {
            order.lock().unwrap().push("context")
        });
        assert_eq!(*order.lock().unwrap(), ["context", "hook"]);
    }

    #[test]
    fn removal_matches_by_identity() {
        let watchpoints = Watchpoints::default();
        let (_, first) = recorder();
        let (_, second) = recorder();
        watchpoints.add(0x30, WidthMask::all(), Access::all(), false, first.clone(), || {});
        let newly_watched =
            watchpoints.add(0x30, WidthMask::all(), Access::READ, false, second.clone(), || {});
        assert!(!newly_watched);

        assert!(!watchpoints.remove(0x30, &first, || {}));
        assert!(watchpoints.is_watched(0x30, Access::READ));
        assert!(!watchpoints.is_watched(0x30, Access::WRITE));
        assert!(watchpoints.remove(0x30, &second, || {}));
        assert!(!watchpoints.is_watched(0x30, Access::all()));
        assert_eq!(watchpoints.armed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn hooks_may_remove_themselves_while_firing() {
        let watchpoints = Arc::new(Watchpoints::default());
        let inner = watchpoints.clone();
        watchpoints.add(
            0x40,
            WidthMask::all(),
            Access::READ,
            false,
            Arc::new(move |address: u64, _: Width| {
                inner.remove_all(address, || {});
            }),
            || {},
        );
        watchpoints.fire(0x40, Width::Byte, Direction::Read, || {});
        assert!(watchpoints.watched_addresses().is_empty());
    }

    #[test]
    fn transform_respects_subrange() {
        let base: ReadFn<u8> = Arc::new(|offset: u64| offset as u8);
        let hook: HookFn<u8> = Arc::new(|value: u8, _: u64| value | 0x80);
        let read = transform_read(hook, Some(AddressRange::new(4, 8)))(base);
        assert_eq!(read(3), 3);
        assert_eq!(read(4), 0x84);
        assert_eq!(read(8), 8);
    }
}
