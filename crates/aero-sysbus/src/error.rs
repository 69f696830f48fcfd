use thiserror::Error;

use crate::access::Operation;
use crate::range::AddressRange;

pub type Result<T> = std::result::Result<T, BusError>;

/// Rejected registration. The bus is left exactly as it was before the call.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("range {range} of {peripheral} conflicts with {existing} of {existing_peripheral}")]
    Overlap {
        range: AddressRange,
        peripheral: String,
        existing: AddressRange,
        existing_peripheral: String,
    },

    #[error("{peripheral} implements no access method usable by this registration")]
    NoAccessMethods { peripheral: String },

    #[error("{peripheral} declares more than one `{operation}` method for region `{region}`")]
    DuplicateRegionMethod {
        peripheral: String,
        region: String,
        operation: Operation,
    },

    #[error("{peripheral} exposes mapped memory and cannot be registered through region `{region}`")]
    MappedMultiRegion { peripheral: String, region: String },

    #[error("{peripheral} does not report its size; register it with an explicit range")]
    UnknownSize { peripheral: String },

    #[error("empty registration range at {start:#x}")]
    EmptyRange { start: u64 },

    #[error("bus endianness cannot change once a peripheral is registered")]
    EndiannessLocked,

    #[error("CPU slot {slot} is already taken")]
    CpuSlotTaken { slot: u32 },

    #[error("CPU is already registered in slot {slot}")]
    CpuAlreadyRegistered { slot: u32 },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// No native or translated accessor exists for the requested width.
    #[error("{peripheral} does not support {operation} (offset {offset:#x})")]
    Unsupported {
        peripheral: String,
        operation: Operation,
        offset: u64,
    },

    #[error("{peripheral} is not registered")]
    NotRegistered { peripheral: String },

    #[error("no peripheral is registered at {address:#x}")]
    NothingAt { address: u64 },

    #[error("{peripheral} at {address:#x} is not memory")]
    NotMemory { peripheral: String, address: u64 },

    #[error("tag `{name}` at {range} must lie inside exactly one existing tag")]
    TagConflict { name: String, range: AddressRange },

    #[error("no tag at {address:#x}")]
    NoTag { address: u64 },

    #[error("invalid watchpoint at {address:#x}: {reason}")]
    InvalidWatchpoint { address: u64, reason: &'static str },

    #[error("no CPU in slot {slot}")]
    CpuNotRegistered { slot: u32 },

    #[error("{len:#x} bytes at {start:#x} overflow the address space")]
    AddressOverflow { start: u64, len: u64 },

    #[error("redirect of {from} cannot reach {target:#x}: {reason}")]
    RedirectMiss {
        from: AddressRange,
        target: u64,
        reason: &'static str,
    },
}
