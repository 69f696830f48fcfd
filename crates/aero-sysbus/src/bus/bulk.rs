//! Scatter/gather transfers over contiguous bus ranges, used by image loaders.

use std::sync::Arc;

use super::SystemBus;
use crate::error::{BusError, Result};
use crate::index::{Block, LookupCache};
use crate::peripheral::PeripheralKind;
use crate::range::AddressRange;

/// `zero_range` writes at most this many bytes per step.
const ZERO_CHUNK: usize = 1 << 20;

/// A registration and the part of the request it covers.
struct Target {
    block: Arc<Block>,
    clip: AddressRange,
}

fn request_range(address: u64, len: usize) -> Result<AddressRange> {
    let len = len as u64;
    AddressRange::checked_with_size(address, len).ok_or(BusError::AddressOverflow {
        start: address,
        len,
    })
}

impl SystemBus {
    /// Splits `request` into the registrations covering it, warning once for every hole.
    fn find_targets(&self, request: AddressRange) -> Vec<Target> {
        let mut targets = Vec::new();
        let mut position = request.start();
        while position < request.end() {
            match self.index.find(position) {
                Some(block) => {
                    let end = block.range().end().min(request.end());
                    targets.push(Target {
                        clip: AddressRange::new(position, end),
                        block,
                    });
                    position = end;
                }
                None => {
                    let next = self
                        .index
                        .next_start_after(position)
                        .map_or(request.end(), |start| start.min(request.end()));
                    tracing::warn!(
                        hole = %AddressRange::new(position, next),
                        "bulk transfer crosses a range with no peripheral"
                    );
                    position = next;
                }
            }
        }
        targets
    }

    fn check_memory_only(targets: &[Target]) -> Result<()> {
        for target in targets {
            let peripheral = target.block.handle().peripheral();
            match peripheral.capabilities().kind {
                PeripheralKind::Memory | PeripheralKind::Redirector => {}
                PeripheralKind::Device => {
                    return Err(BusError::NotMemory {
                        peripheral: peripheral.name().to_owned(),
                        address: target.clip.start(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Reads `count` bytes starting at `address`. Holes read as zero.
    ///
    /// With `memory_only`, fails before transferring anything if the range touches a peripheral
    /// that is neither memory nor a redirector.
    pub fn read_bytes(&self, address: u64, count: usize, memory_only: bool) -> Result<Vec<u8>> {
        let request = request_range(address, count)?;
        let targets = self.find_targets(request);
        if memory_only {
            Self::check_memory_only(&targets)?;
        }

        let mut buf = vec![0u8; count];
        let mut cache = LookupCache::default();
        for Target { block, clip } in &targets {
            let from = (clip.start() - address) as usize;
            let out = &mut buf[from..from + clip.size() as usize];
            match block.handle().peripheral().bulk() {
                Some(bulk) => {
                    let _guard = block.methods().lock();
                    bulk.read_bytes(block.local_offset(clip.start()), out);
                }
                None => {
                    for (byte, at) in out.iter_mut().zip(clip.start()..) {
                        *byte = self.read_with(at, &mut cache, None)?;
                    }
                }
            }
        }
        Ok(buf)
    }

    /// Writes `data` starting at `address`. Bytes falling into holes are dropped.
    pub fn write_bytes(&self, data: &[u8], address: u64, memory_only: bool) -> Result<()> {
        let request = request_range(address, data.len())?;
        let targets = self.find_targets(request);
        if memory_only {
            Self::check_memory_only(&targets)?;
        }

        let mut cache = LookupCache::default();
        for Target { block, clip } in &targets {
            let from = (clip.start() - address) as usize;
            let chunk = &data[from..from + clip.size() as usize];
            match block.handle().peripheral().bulk() {
                Some(bulk) => {
                    let _guard = block.methods().lock();
                    bulk.write_bytes(block.local_offset(clip.start()), chunk);
                }
                None => {
                    for (&byte, at) in chunk.iter().zip(clip.start()..) {
                        self.write_with(at, byte, &mut cache, None)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn zero_range(&self, range: AddressRange, memory_only: bool) -> Result<()> {
        let zeros = vec![0u8; ZERO_CHUNK.min(range.size() as usize)];
        let mut position = range.start();
        while position < range.end() {
            let len = (range.end() - position).min(zeros.len() as u64);
            self.write_bytes(&zeros[..len as usize], position, memory_only)?;
            position += len;
        }
        Ok(())
    }
}
