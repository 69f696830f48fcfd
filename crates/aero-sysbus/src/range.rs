use std::fmt;

/// Half-open bus address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    start: u64,
    end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(
            start <= end,
            "address range start must not exceed its end: start={start:#x} end={end:#x}"
        );
        Self { start, end }
    }

    /// Builds `[start, start + size)`.
    ///
    /// Panics if the range would wrap past the top of the 64-bit address space; use
    /// [`Self::checked_with_size`] for untrusted sizes.
    pub fn with_size(start: u64, size: u64) -> Self {
        match Self::checked_with_size(start, size) {
            Some(range) => range,
            None => panic!("address range wraps: start={start:#x} size={size:#x}"),
        }
    }

    pub fn checked_with_size(start: u64, size: u64) -> Option<Self> {
        let end = start.checked_add(size)?;
        Some(Self { start, end })
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn end(&self) -> u64 {
        self.end
    }

    pub const fn size(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub const fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub const fn intersects(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &AddressRange) -> Option<AddressRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(AddressRange { start, end })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start, self.end)
    }
}

/// Where and how a peripheral is attached to the bus.
///
/// `offset` is the peripheral-local address that corresponds to the start of the range: an access
/// at bus address `a` reaches the peripheral at `a - range.start() + offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationPoint {
    Range {
        range: AddressRange,
        offset: u64,
    },
    /// Attaches only the accessors a peripheral tagged with `region`.
    MultiRegion {
        range: AddressRange,
        offset: u64,
        region: String,
    },
}

impl RegistrationPoint {
    pub fn range(range: AddressRange) -> Self {
        Self::Range { range, offset: 0 }
    }

    pub fn range_with_offset(range: AddressRange, offset: u64) -> Self {
        Self::Range { range, offset }
    }

    pub fn multi_region(range: AddressRange, region: impl Into<String>) -> Self {
        Self::MultiRegion {
            range,
            offset: 0,
            region: region.into(),
        }
    }

    pub fn address_range(&self) -> AddressRange {
        match self {
            Self::Range { range, .. } | Self::MultiRegion { range, .. } => *range,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Self::Range { offset, .. } | Self::MultiRegion { offset, .. } => *offset,
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Range { .. } => None,
            Self::MultiRegion { region, .. } => Some(region),
        }
    }
}

impl fmt::Display for RegistrationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_range())?;
        if self.offset() != 0 {
            write!(f, " with offset {:#x}", self.offset())?;
        }
        if let Some(region) = self.region() {
            write!(f, " region `{region}`")?;
        }
        Ok(())
    }
}

/// Point registration for peripherals that report their own size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusPointRegistration {
    pub start: u64,
    pub offset: u64,
}

impl BusPointRegistration {
    pub fn new(start: u64) -> Self {
        Self { start, offset: 0 }
    }
}

/// Requested CPU slot; `None` takes the lowest free one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuRegistrationPoint {
    pub slot: Option<u32>,
}

impl CpuRegistrationPoint {
    pub fn slot(slot: u32) -> Self {
        Self { slot: Some(slot) }
    }
}
