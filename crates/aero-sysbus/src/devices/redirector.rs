use std::sync::Weak;

use crate::access::{BusValue, WidthMask};
use crate::bus::SystemBus;
use crate::peripheral::{BulkAccess, BusPeripheral, Capabilities, PeripheralKind};

/// Forwards every access at offset `o` to bus address `target + o`.
///
/// Holds the bus weakly; accesses after the bus is dropped read as zero.
pub struct Redirector {
    bus: Weak<SystemBus>,
    target: u64,
    size: u64,
}

impl Redirector {
    pub fn new(bus: Weak<SystemBus>, target: u64, size: u64) -> Self {
        Self { bus, target, size }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Bus address an access at `offset` is forwarded to.
    pub fn translate_absolute(&self, offset: u64) -> u64 {
        self.target.wrapping_add(offset)
    }

    fn forward_read<T: BusValue>(&self, offset: u64) -> T {
        let address = self.translate_absolute(offset);
        let Some(bus) = self.bus.upgrade() else {
            return T::from_u32(0);
        };
        match bus.read::<T>(address) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(address = %crate::access::Hex(address), "redirected read failed: {err}");
                T::from_u32(0)
            }
        }
    }

    fn forward_write<T: BusValue>(&self, offset: u64, value: T) {
        let address = self.translate_absolute(offset);
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if let Err(err) = bus.write(address, value) {
            tracing::warn!(address = %crate::access::Hex(address), "redirected write failed: {err}");
        }
    }
}

impl BusPeripheral for Redirector {
    fn name(&self) -> &str {
        "redirector"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::native(WidthMask::all()).with_kind(PeripheralKind::Redirector)
    }

    fn read_byte(&self, offset: u64) -> u8 {
        self.forward_read(offset)
    }

    fn write_byte(&self, offset: u64, value: u8) {
        self.forward_write(offset, value);
    }

    fn read_word(&self, offset: u64) -> u16 {
        self.forward_read(offset)
    }

    fn write_word(&self, offset: u64, value: u16) {
        self.forward_write(offset, value);
    }

    fn read_double_word(&self, offset: u64) -> u32 {
        self.forward_read(offset)
    }

    fn write_double_word(&self, offset: u64, value: u32) {
        self.forward_write(offset, value);
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn bulk(&self) -> Option<&dyn BulkAccess> {
        Some(self)
    }
}

impl BulkAccess for Redirector {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) {
        let address = self.translate_absolute(offset);
        let Some(bus) = self.bus.upgrade() else {
            buf.fill(0);
            return;
        };
        match bus.read_bytes(address, buf.len(), false) {
            Ok(data) => buf.copy_from_slice(&data),
            Err(err) => {
                tracing::warn!(address = %crate::access::Hex(address), "redirected bulk read failed: {err}");
                buf.fill(0);
            }
        }
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) {
        let address = self.translate_absolute(offset);
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if let Err(err) = bus.write_bytes(data, address, false) {
            tracing::warn!(address = %crate::access::Hex(address), "redirected bulk write failed: {err}");
        }
    }
}
