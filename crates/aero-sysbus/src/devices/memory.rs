use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::access::WidthMask;
use crate::peripheral::{
    BulkAccess, BusPeripheral, Capabilities, Endianness, MappedSegment, PeripheralKind,
};

/// Backing store of an [`ArrayMemory`], shared with CPUs that map it.
struct Storage {
    bytes: Box<[AtomicU8]>,
}

impl MappedSegment for Storage {
    fn start_offset(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn bytes(&self) -> &[AtomicU8] {
        &self.bytes
    }
}

/// Byte-addressable little-endian RAM.
///
/// Cells are atomic, so CPUs that map the storage directly and bus accesses may race without
/// tearing individual bytes. Accesses past the end read as zero and drop writes.
pub struct ArrayMemory {
    storage: Arc<Storage>,
}

impl ArrayMemory {
    pub fn new(size: usize) -> Self {
        let bytes = (0..size).map(|_| AtomicU8::new(0)).collect();
        Self {
            storage: Arc::new(Storage { bytes }),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let bytes = data.iter().map(|&b| AtomicU8::new(b)).collect();
        Self {
            storage: Arc::new(Storage { bytes }),
        }
    }

    pub fn len(&self) -> usize {
        self.storage.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.bytes.is_empty()
    }

    fn cell(&self, offset: u64) -> Option<&AtomicU8> {
        self.storage.bytes.get(usize::try_from(offset).ok()?)
    }

    fn load<const N: usize>(&self, offset: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        for (i, byte) in buf.iter_mut().enumerate() {
            if let Some(cell) = self.cell(offset.wrapping_add(i as u64)) {
                *byte = cell.load(Ordering::Relaxed);
            }
        }
        buf
    }

    fn store(&self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            if let Some(cell) = self.cell(offset.wrapping_add(i as u64)) {
                cell.store(byte, Ordering::Relaxed);
            }
        }
    }
}

impl BusPeripheral for ArrayMemory {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::native(WidthMask::all())
            .with_endianness(Endianness::Little)
            .with_kind(PeripheralKind::Memory)
    }

    fn read_byte(&self, offset: u64) -> u8 {
        self.load::<1>(offset)[0]
    }

    fn write_byte(&self, offset: u64, value: u8) {
        self.store(offset, &[value]);
    }

    fn read_word(&self, offset: u64) -> u16 {
        u16::from_le_bytes(self.load(offset))
    }

    fn write_word(&self, offset: u64, value: u16) {
        self.store(offset, &value.to_le_bytes());
    }

    fn read_double_word(&self, offset: u64) -> u32 {
        u32::from_le_bytes(self.load(offset))
    }

    fn write_double_word(&self, offset: u64, value: u32) {
        self.store(offset, &value.to_le_bytes());
    }

    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn mapped_segments(&self) -> Vec<Arc<dyn MappedSegment>> {
        vec![self.storage.clone() as Arc<dyn MappedSegment>]
    }

    fn bulk(&self) -> Option<&dyn BulkAccess> {
        Some(self)
    }
}

impl BulkAccess for ArrayMemory {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self
                .cell(offset.wrapping_add(i as u64))
                .map_or(0, |cell| cell.load(Ordering::Relaxed));
        }
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) {
        self.store(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let memory = ArrayMemory::from_bytes(&[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(memory.read_word(0), 0x2211);
        assert_eq!(memory.read_double_word(0), 0x4433_2211);
        memory.write_word(2, 0xBEEF);
        assert_eq!(memory.read_byte(2), 0xEF);
        assert_eq!(memory.read_byte(3), 0xBE);
    }

    #[test]
    fn accesses_past_the_end_are_clipped() {
        let memory = ArrayMemory::new(2);
        memory.write_double_word(0, 0xAABB_CCDD);
        assert_eq!(memory.read_double_word(0), 0xCCDD);
        assert_eq!(memory.read_byte(u64::MAX), 0);
    }

    #[test]
    fn mapped_segment_aliases_storage() {
        let memory = ArrayMemory::new(16);
        let segment = memory.mapped_segments().remove(0);
        segment.bytes()[5].store(0x5A, Ordering::Relaxed);
        assert_eq!(memory.read_byte(5), 0x5A);
        assert_eq!(segment.size(), 16);
    }
}
