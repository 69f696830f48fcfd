//! Access widths, directions and the six primitive bus operations.

use std::fmt;

use bitflags::bitflags;

use crate::methods::{AccessMethodTable, ReadSlot, WriteSlot};
use crate::peripheral::BusPeripheral;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    Byte,
    Word,
    DoubleWord,
}

impl Width {
    pub const ALL: [Width; 3] = [Width::Byte, Width::Word, Width::DoubleWord];

    /// Size of one access in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::DoubleWord => 4,
        }
    }

    pub const fn mask(self) -> WidthMask {
        match self {
            Width::Byte => WidthMask::BYTE,
            Width::Word => WidthMask::WORD,
            Width::DoubleWord => WidthMask::DOUBLE_WORD,
        }
    }

    /// Mask selecting the bits of a `u32` that an access of this width carries.
    pub const fn value_mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::DoubleWord => 0xFFFF_FFFF,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::DoubleWord => "double word",
        })
    }
}

bitflags! {
    /// Set of access widths, used by watchpoints and native capability declarations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WidthMask: u8 {
        const BYTE = 1 << 0;
        const WORD = 1 << 1;
        const DOUBLE_WORD = 1 << 2;
    }
}

impl WidthMask {
    pub fn has(self, width: Width) -> bool {
        self.contains(width.mask())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const fn access(self) -> Access {
        match self {
            Direction::Read => Access::READ,
            Direction::Write => Access::WRITE,
        }
    }
}

/// One of the six primitive accesses a peripheral can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ReadByte,
    WriteByte,
    ReadWord,
    WriteWord,
    ReadDoubleWord,
    WriteDoubleWord,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::ReadByte,
        Operation::WriteByte,
        Operation::ReadWord,
        Operation::WriteWord,
        Operation::ReadDoubleWord,
        Operation::WriteDoubleWord,
    ];

    pub const fn new(width: Width, direction: Direction) -> Self {
        match (width, direction) {
            (Width::Byte, Direction::Read) => Operation::ReadByte,
            (Width::Byte, Direction::Write) => Operation::WriteByte,
            (Width::Word, Direction::Read) => Operation::ReadWord,
            (Width::Word, Direction::Write) => Operation::WriteWord,
            (Width::DoubleWord, Direction::Read) => Operation::ReadDoubleWord,
            (Width::DoubleWord, Direction::Write) => Operation::WriteDoubleWord,
        }
    }

    pub const fn width(self) -> Width {
        match self {
            Operation::ReadByte | Operation::WriteByte => Width::Byte,
            Operation::ReadWord | Operation::WriteWord => Width::Word,
            Operation::ReadDoubleWord | Operation::WriteDoubleWord => Width::DoubleWord,
        }
    }

    pub const fn direction(self) -> Direction {
        match self {
            Operation::ReadByte | Operation::ReadWord | Operation::ReadDoubleWord => Direction::Read,
            Operation::WriteByte | Operation::WriteWord | Operation::WriteDoubleWord => {
                Direction::Write
            }
        }
    }

    pub(crate) const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction() {
            Direction::Read => "read",
            Direction::Write => "write",
        };
        write!(f, "{verb} {}", self.width())
    }
}

/// Formats an address or value as `0x…` in log fields.
#[derive(Clone, Copy)]
pub(crate) struct Hex<T>(pub T);

impl<T: fmt::LowerHex> fmt::Display for Hex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// A value that travels over the bus in a single access: `u8`, `u16` or `u32`.
///
/// The hidden methods tie each width to its native peripheral accessors and to its slots in an
/// [`AccessMethodTable`], which lets the synthesizer and dispatcher be written once over all
/// widths.
pub trait BusValue:
    sealed::Sealed + Copy + Eq + fmt::Debug + fmt::LowerHex + Send + Sync + 'static
{
    const WIDTH: Width;
    const BYTES: u64;

    fn to_u32(self) -> u32;

    /// Truncates `value` to this width.
    fn from_u32(value: u32) -> Self;

    #[doc(hidden)]
    fn read_native(peripheral: &dyn BusPeripheral, offset: u64) -> Self;
    #[doc(hidden)]
    fn write_native(peripheral: &dyn BusPeripheral, offset: u64, value: Self);
    #[doc(hidden)]
    fn read_slot(table: &AccessMethodTable) -> &ReadSlot<Self>;
    #[doc(hidden)]
    fn read_slot_mut(table: &mut AccessMethodTable) -> &mut ReadSlot<Self>;
    #[doc(hidden)]
    fn write_slot(table: &AccessMethodTable) -> &WriteSlot<Self>;
    #[doc(hidden)]
    fn write_slot_mut(table: &mut AccessMethodTable) -> &mut WriteSlot<Self>;
}

macro_rules! impl_bus_value {
    ($ty:ty, $width:expr, $read:ident, $write:ident) => {
        impl BusValue for $ty {
            const WIDTH: Width = $width;
            const BYTES: u64 = $width.bytes();

            #[inline]
            fn to_u32(self) -> u32 {
                u32::from(self)
            }

            #[inline]
            fn from_u32(value: u32) -> Self {
                value as $ty
            }

            fn read_native(peripheral: &dyn BusPeripheral, offset: u64) -> Self {
                peripheral.$read(offset)
            }

            fn write_native(peripheral: &dyn BusPeripheral, offset: u64, value: Self) {
                peripheral.$write(offset, value)
            }

            fn read_slot(table: &AccessMethodTable) -> &ReadSlot<Self> {
                &table.$read
            }

            fn read_slot_mut(table: &mut AccessMethodTable) -> &mut ReadSlot<Self> {
                &mut table.$read
            }

            fn write_slot(table: &AccessMethodTable) -> &WriteSlot<Self> {
                &table.$write
            }

            fn write_slot_mut(table: &mut AccessMethodTable) -> &mut WriteSlot<Self> {
                &mut table.$write
            }
        }
    };
}

impl_bus_value!(u8, Width::Byte, read_byte, write_byte);
impl_bus_value!(u16, Width::Word, read_word, write_word);
impl_bus_value!(u32, Width::DoubleWord, read_double_word, write_double_word);
