use crate::peripheral::Endianness;
use crate::unmapped::UnhandledAccessBehaviour;

/// Construction-time settings of a [`SystemBus`](crate::SystemBus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Endianness used to translate accesses of peripherals that do not declare their own.
    pub endianness: Endianness,
    pub unhandled_access: UnhandledAccessBehaviour,
    /// Value returned by reads of untagged unmapped addresses.
    pub unmapped_read_value: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endianness: Endianness::Little,
            unhandled_access: UnhandledAccessBehaviour::ReportAll,
            unmapped_read_value: 0,
        }
    }
}

impl BusConfig {
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_unhandled_access(mut self, behaviour: UnhandledAccessBehaviour) -> Self {
        self.unhandled_access = behaviour;
        self
    }
}
