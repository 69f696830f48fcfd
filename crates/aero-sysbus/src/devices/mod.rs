//! Peripherals the bus itself registers or that most machines need.

mod memory;
mod redirector;
mod silencer;

pub use memory::ArrayMemory;
pub use redirector::Redirector;
pub use silencer::Silencer;
