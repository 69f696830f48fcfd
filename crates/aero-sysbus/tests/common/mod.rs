#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use aero_sysbus::{
    AddressRange, AllowedTranslation, BusPeripheral, Capabilities, Cpu, Endianness, Operation,
    PeripheralRef, SegmentMapping, WidthMask,
};

/// Register file backed by plain bytes, exposing a configurable set of native widths. Every call
/// into the peripheral is recorded.
pub struct Registers {
    caps: Capabilities,
    bytes: Mutex<Vec<u8>>,
    pub calls: Mutex<Vec<(Operation, u64)>>,
    pub absolute: Mutex<Vec<u64>>,
}

impl Registers {
    pub fn new(size: usize, caps: Capabilities) -> Arc<Self> {
        let bytes = (0..size).map(|i| i as u8).collect();
        Arc::new(Self {
            caps,
            bytes: Mutex::new(bytes),
            calls: Mutex::new(Vec::new()),
            absolute: Mutex::new(Vec::new()),
        })
    }

    /// Word-only registers that allow byte accesses to be served with words.
    pub fn word_only(size: usize) -> Arc<Self> {
        Self::new(
            size,
            Capabilities::native(WidthMask::WORD)
                .with_translations(AllowedTranslation::BYTE_TO_WORD),
        )
    }

    pub fn as_peripheral(self: &Arc<Self>) -> PeripheralRef {
        self.clone()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(Operation, u64)> {
        self.calls.lock().unwrap().clone()
    }

    fn big_endian(&self) -> bool {
        self.caps.endianness == Some(Endianness::Big)
    }

    fn get(&self, op: Operation, offset: u64) -> u32 {
        self.calls.lock().unwrap().push((op, offset));
        let len = op.width().bytes() as usize;
        let bytes = self.bytes.lock().unwrap();
        let mut value = 0u32;
        for i in 0..len {
            let byte = bytes.get(offset as usize + i).copied().unwrap_or(0) as u32;
            let shift = if self.big_endian() { len - 1 - i } else { i };
            value |= byte << (8 * shift);
        }
        value
    }

    fn set(&self, op: Operation, offset: u64, value: u32) {
        self.calls.lock().unwrap().push((op, offset));
        let len = op.width().bytes() as usize;
        let mut bytes = self.bytes.lock().unwrap();
        for i in 0..len {
            let shift = if self.big_endian() { len - 1 - i } else { i };
            if let Some(byte) = bytes.get_mut(offset as usize + i) {
                *byte = (value >> (8 * shift)) as u8;
            }
        }
    }
}

impl BusPeripheral for Registers {
    fn name(&self) -> &str {
        "registers"
    }

    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    fn read_byte(&self, offset: u64) -> u8 {
        self.get(Operation::ReadByte, offset) as u8
    }

    fn write_byte(&self, offset: u64, value: u8) {
        self.set(Operation::WriteByte, offset, value.into());
    }

    fn read_word(&self, offset: u64) -> u16 {
        self.get(Operation::ReadWord, offset) as u16
    }

    fn write_word(&self, offset: u64, value: u16) {
        self.set(Operation::WriteWord, offset, value.into());
    }

    fn read_double_word(&self, offset: u64) -> u32 {
        self.get(Operation::ReadDoubleWord, offset)
    }

    fn write_double_word(&self, offset: u64, value: u32) {
        self.set(Operation::WriteDoubleWord, offset, value);
    }

    fn set_absolute_address(&self, address: u64) {
        self.absolute.lock().unwrap().push(address);
    }

    fn size(&self) -> Option<u64> {
        Some(self.bytes.lock().unwrap().len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuEvent {
    Map { start: u64, size: u64 },
    Unmap(AddressRange),
    IoPage(u64),
    ClearIoPage(u64),
    UpdateContext,
}

#[derive(Default)]
pub struct RecordingCpu {
    pub events: Mutex<Vec<CpuEvent>>,
    pub pc: Option<u64>,
}

impl RecordingCpu {
    pub fn with_pc(pc: u64) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            pc: Some(pc),
        })
    }

    pub fn events(&self) -> Vec<CpuEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: CpuEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Cpu for RecordingCpu {
    fn map_memory(&self, mapping: &SegmentMapping) {
        self.push(CpuEvent::Map {
            start: mapping.start,
            size: mapping.size,
        });
    }

    fn unmap_memory(&self, range: AddressRange) {
        self.push(CpuEvent::Unmap(range));
    }

    fn update_context(&self) {
        self.push(CpuEvent::UpdateContext);
    }

    fn set_page_access_via_io(&self, address: u64) {
        self.push(CpuEvent::IoPage(address));
    }

    fn clear_page_access_via_io(&self, address: u64) {
        self.push(CpuEvent::ClearIoPage(address));
    }

    fn pc(&self) -> Option<u64> {
        self.pc
    }
}

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Runs `f` with a fmt subscriber writing into memory and returns what was logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}

pub fn warnings(logs: &str) -> Vec<&str> {
    logs.lines().filter(|l| l.contains("WARN")).collect()
}
