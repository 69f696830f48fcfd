use crate::access::WidthMask;
use crate::peripheral::{BusPeripheral, Capabilities};

/// Reads as zero and ignores writes. Registered by `SystemBus::silence_range` to quiet ranges
/// that software probes but nothing models.
#[derive(Debug, Clone, Copy)]
pub struct Silencer {
    size: u64,
}

impl Silencer {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl BusPeripheral for Silencer {
    fn name(&self) -> &str {
        "silencer"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::native(WidthMask::all())
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}
