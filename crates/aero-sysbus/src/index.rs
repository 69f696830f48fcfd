//! Address-to-registration lookup.
//!
//! Small page-aligned registrations are reachable through a page dictionary with O(1) lookups;
//! everything else lives in a start-sorted array searched by bisection. A registration whose
//! start is page-aligned and which spans at most [`DICTIONARY_PAGE_THRESHOLD`] whole pages gets
//! one dictionary entry per whole page. If its size is not a multiple of [`PAGE_SIZE`], the tail
//! is only reachable through the array, so it is inserted there as well.
//!
//! Both views live in an immutable [`Layout`] snapshot that mutations replace wholesale. Lookups
//! go through a caller-owned [`LookupCache`] remembering the last hit; the cache is invalidated by
//! a generation counter that removals and table replacements bump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::methods::AccessMethodTable;
use crate::peripheral::{peripheral_key, same_peripheral, PeripheralHandle, PeripheralRef};
use crate::range::AddressRange;

pub const PAGE_SIZE: u64 = 1 << 11;
const PAGE_MASK: u64 = PAGE_SIZE - 1;
/// Registrations spanning more whole pages than this are kept out of the dictionary.
pub const DICTIONARY_PAGE_THRESHOLD: u64 = 4;

/// An index record binding a range to its registration and accessor table.
pub struct Block {
    range: AddressRange,
    methods: Arc<AccessMethodTable>,
    handle: PeripheralHandle,
}

impl Block {
    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn methods(&self) -> &Arc<AccessMethodTable> {
        &self.methods
    }

    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Peripheral-local offset of bus address `address`.
    #[inline]
    pub fn local_offset(&self, address: u64) -> u64 {
        (address - self.range.start()).wrapping_add(self.handle.point().offset())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("range", &self.range)
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Clone, Default)]
struct Layout {
    /// Array view, sorted by start.
    array: Vec<Arc<Block>>,
    /// Dictionary view, keyed by page address.
    pages: HashMap<u64, Arc<Block>>,
    /// Every block exactly once, sorted by start.
    all: Vec<Arc<Block>>,
}

impl Layout {
    fn search(&self, address: u64) -> Option<&Arc<Block>> {
        let idx = self.array.partition_point(|b| b.range.start() <= address);
        let candidate = self.array.get(idx.checked_sub(1)?)?;
        candidate.range.contains(address).then_some(candidate)
    }

    /// Rebuilds both views of every block through `f`, keeping blocks shared between views
    /// shared.
    fn map_blocks(&mut self, mut f: impl FnMut(&Arc<Block>) -> Option<Arc<Block>>) {
        let mut replaced: HashMap<usize, Option<Arc<Block>>> = HashMap::new();
        let mut apply = |block: &Arc<Block>| {
            replaced
                .entry(Arc::as_ptr(block) as usize)
                .or_insert_with(|| f(block))
                .clone()
        };
        self.array = self.array.iter().filter_map(&mut apply).collect();
        self.pages = self
            .pages
            .iter()
            .filter_map(|(page, block)| Some((*page, apply(block)?)))
            .collect();
        self.all = self.all.iter().filter_map(&mut apply).collect();
    }
}

/// Per-thread (or per-CPU) lookup state: the last block hit and access statistics.
#[derive(Debug, Default)]
pub struct LookupCache {
    last: Option<Arc<Block>>,
    generation: u64,
    stats: LookupStatistics,
}

impl LookupCache {
    pub fn statistics(&self) -> LookupStatistics {
        self.stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStatistics {
    pub queries: u64,
    pub cache_hits: u64,
    pub dictionary_hits: u64,
    pub array_hits: u64,
    pub misses: u64,
}

#[derive(Default)]
pub struct AddressSpaceIndex {
    layout: RwLock<Arc<Layout>>,
    generation: AtomicU64,
}

impl AddressSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Layout> {
        match self.layout.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies `f` to a copy of the current layout and publishes the result.
    fn update<R>(&self, f: impl FnOnce(&mut Layout) -> R) -> R {
        let mut guard = match self.layout.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = Layout::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }

    fn invalidate_caches(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Resolves `address`, trying the cache, then the dictionary, then the array.
    #[inline]
    pub fn lookup<'c>(&self, address: u64, cache: &'c mut LookupCache) -> Option<&'c Arc<Block>> {
        cache.stats.queries += 1;
        let generation = self.generation.load(Ordering::Acquire);
        if cache.generation != generation {
            cache.last = None;
            cache.generation = generation;
        }
        if cache.last.as_ref().is_some_and(|b| b.range.contains(address)) {
            cache.stats.cache_hits += 1;
            return cache.last.as_ref();
        }

        let layout = self.snapshot();
        let hit = if let Some(block) = layout
            .pages
            .get(&(address & !PAGE_MASK))
            .filter(|b| b.range.contains(address))
        {
            cache.stats.dictionary_hits += 1;
            block.clone()
        } else if let Some(block) = layout.search(address) {
            cache.stats.array_hits += 1;
            block.clone()
        } else {
            cache.stats.misses += 1;
            return None;
        };
        cache.last = Some(hit);
        cache.last.as_ref()
    }

    /// Inserts a registration. The caller guarantees `range` does not overlap any registered
    /// range.
    pub fn add(
        &self,
        range: AddressRange,
        handle: PeripheralHandle,
        methods: Arc<AccessMethodTable>,
    ) {
        let pages = range.size() / PAGE_SIZE;
        let dictionary = range.start() & PAGE_MASK == 0 && pages <= DICTIONARY_PAGE_THRESHOLD;
        let array = !dictionary || range.size() % PAGE_SIZE != 0;
        let block = Arc::new(Block {
            range,
            methods,
            handle,
        });

        self.update(|layout| {
            debug_assert!(
                layout.all.iter().all(|b| !b.range.intersects(&range)),
                "overlapping registration {range}"
            );
            if array {
                let idx = layout.array.partition_point(|b| b.range.start() < range.start());
                layout.array.insert(idx, block.clone());
            }
            if dictionary {
                for page in 0..pages {
                    layout.pages.insert(range.start() + page * PAGE_SIZE, block.clone());
                }
            }
            let idx = layout.all.partition_point(|b| b.range.start() < range.start());
            layout.all.insert(idx, block);
        });
        tracing::trace!(
            range = %range,
            dictionary_pages = if dictionary { pages } else { 0 },
            array,
            "indexed registration"
        );
    }

    /// Removes every registration of `peripheral`, returning the removed blocks.
    pub fn remove_peripheral(&self, peripheral: &PeripheralRef) -> Vec<Arc<Block>> {
        self.remove_where(|b| same_peripheral(b.handle.peripheral(), peripheral))
    }

    /// Removes every registration intersecting `range`, returning the removed blocks.
    pub fn remove_range(&self, range: AddressRange) -> Vec<Arc<Block>> {
        self.remove_where(|b| b.range.intersects(&range))
    }

    fn remove_where(&self, predicate: impl Fn(&Block) -> bool) -> Vec<Arc<Block>> {
        let removed = self.update(|layout| {
            let removed: Vec<_> = layout.all.iter().filter(|b| predicate(b)).cloned().collect();
            if !removed.is_empty() {
                layout.map_blocks(|b| (!predicate(b)).then(|| b.clone()));
            }
            removed
        });
        if !removed.is_empty() {
            self.invalidate_caches();
        }
        removed
    }

    /// Replaces the accessor table of every registration of `peripheral` with `f(old)`.
    ///
    /// The dictionary and array views of a registration keep sharing one new table. Returns the
    /// number of registrations visited.
    pub fn visit(
        &self,
        peripheral: &PeripheralRef,
        mut f: impl FnMut(&AccessMethodTable) -> AccessMethodTable,
    ) -> usize {
        let key = peripheral_key(peripheral);
        let visited = self.update(|layout| {
            let visited = layout
                .all
                .iter()
                .filter(|b| peripheral_key(b.handle.peripheral()) == key)
                .count();
            if visited > 0 {
                layout.map_blocks(|b| {
                    if peripheral_key(b.handle.peripheral()) != key {
                        return Some(b.clone());
                    }
                    Some(Arc::new(Block {
                        range: b.range,
                        methods: Arc::new(f(&b.methods)),
                        handle: b.handle.clone(),
                    }))
                });
            }
            visited
        });
        if visited > 0 {
            self.invalidate_caches();
        }
        visited
    }

    /// All registrations, sorted by start.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.snapshot().all.clone()
    }

    /// The block containing `address`, bypassing any cache.
    pub fn find(&self, address: u64) -> Option<Arc<Block>> {
        let layout = self.snapshot();
        let idx = layout.all.partition_point(|b| b.range.start() <= address);
        let candidate = layout.all.get(idx.checked_sub(1)?)?;
        candidate.range.contains(address).then(|| candidate.clone())
    }

    /// Start of the first registration beginning after `address`.
    pub fn next_start_after(&self, address: u64) -> Option<u64> {
        let layout = self.snapshot();
        let idx = layout.all.partition_point(|b| b.range.start() <= address);
        layout.all.get(idx).map(|b| b.range.start())
    }

    pub fn first_intersecting(&self, range: AddressRange) -> Option<Arc<Block>> {
        self.snapshot()
            .all
            .iter()
            .find(|b| b.range.intersects(&range))
            .cloned()
    }

    pub fn contains_peripheral(&self, peripheral: &PeripheralRef) -> bool {
        self.snapshot()
            .all
            .iter()
            .any(|b| same_peripheral(b.handle.peripheral(), peripheral))
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().all.is_empty()
    }

    pub fn dictionary_len(&self) -> usize {
        self.snapshot().pages.len()
    }

    pub fn array_len(&self) -> usize {
        self.snapshot().array.len()
    }

    pub fn clear(&self) {
        self.update(|layout| *layout = Layout::default());
        self.invalidate_caches();
    }

    /// Drops the array view, leaving only dictionary entries reachable.
    #[cfg(test)]
    pub(crate) fn clear_array(&self) {
        self.update(|layout| layout.array.clear());
        self.invalidate_caches();
    }
}
