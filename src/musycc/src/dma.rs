// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! DMA-visible memory shared with the controller and the buffers carved out of it.
//!
//! The controller only sees a 32-bit bus address space. [`DmaMemory`] is that address space,
//! [`DmaPool`] hands out aligned regions of it and [`MemToken`] is the owning handle of a frame
//! buffer travelling between the engine and a channel user.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use vm_allocator::{AddressAllocator, AllocPolicy, RangeInclusive};
use vm_memory::{Bytes, GuestAddress, GuestMemoryError};

use crate::logger::{extract_guard, warn};

/// Guest memory type backing the DMA address space.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

/// Highest address the controller can put on its bus.
pub const DMA_ADDR_LIMIT: u64 = 1 << 32;

/// Errors associated with DMA memory.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DmaError {
    /// Cannot create DMA memory: {0}
    CreateMemory(String),
    /// DMA range {0:#x}+{1:#x} does not fit the 32-bit bus
    AddressTooWide(u64, u64),
    /// Cannot allocate DMA memory: {0}
    Allocate(#[from] vm_allocator::Error),
    /// DMA memory access failed: {0}
    Access(#[from] GuestMemoryError),
    /// Segment of {0} bytes exceeds the buffer capacity of {1} bytes
    SegmentTooLong(usize, usize),
}

/// Memory the controller reads and writes through DMA.
#[derive(Debug, Clone)]
pub struct DmaMemory {
    mem: Arc<GuestMemoryMmap>,
}

impl DmaMemory {
    /// Creates anonymous DMA memory covering `[base, base + size)` of the bus.
    pub fn anonymous(base: u64, size: usize) -> Result<Self, DmaError> {
        let size_u64 = size as u64;
        if base.checked_add(size_u64).is_none_or(|end| end > DMA_ADDR_LIMIT) {
            return Err(DmaError::AddressTooWide(base, size_u64));
        }
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size)])
            .map_err(|err| DmaError::CreateMemory(format!("{err:?}")))?;
        Ok(Self { mem: Arc::new(mem) })
    }

    /// Wraps already mapped memory.
    pub fn from_guest_memory(mem: Arc<GuestMemoryMmap>) -> Self {
        Self { mem }
    }

    /// Loads a 32-bit word with acquire semantics.
    pub fn read_u32(&self, addr: u32) -> Result<u32, DmaError> {
        Ok(self
            .mem
            .load(GuestAddress(u64::from(addr)), Ordering::Acquire)?)
    }

    /// Stores a 32-bit word with release semantics.
    pub fn write_u32(&self, addr: u32, value: u32) -> Result<(), DmaError> {
        Ok(self
            .mem
            .store(value, GuestAddress(u64::from(addr)), Ordering::Release)?)
    }

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read_slice(&self, addr: u32, buf: &mut [u8]) -> Result<(), DmaError> {
        Ok(self.mem.read_slice(buf, GuestAddress(u64::from(addr)))?)
    }

    /// Copies `buf` to `addr`.
    pub fn write_slice(&self, addr: u32, buf: &[u8]) -> Result<(), DmaError> {
        Ok(self.mem.write_slice(buf, GuestAddress(u64::from(addr)))?)
    }
}

/// Allocator for DMA regions.
#[derive(Debug)]
pub struct DmaPool {
    mem: DmaMemory,
    allocator: Mutex<AddressAllocator>,
}

impl DmaPool {
    /// Creates a pool managing `[base, base + size)` of `mem`.
    pub fn new(mem: DmaMemory, base: u64, size: u64) -> Result<Arc<Self>, DmaError> {
        if base.checked_add(size).is_none_or(|end| end > DMA_ADDR_LIMIT) {
            return Err(DmaError::AddressTooWide(base, size));
        }
        Ok(Arc::new(Self {
            mem,
            allocator: Mutex::new(AddressAllocator::new(base, size)?),
        }))
    }

    /// Memory the regions of this pool live in.
    pub fn memory(&self) -> &DmaMemory {
        &self.mem
    }

    /// Allocates `size` bytes aligned to `alignment`, which must be a power of two.
    pub fn allocate(self: &Arc<Self>, size: usize, alignment: u64) -> Result<DmaRegion, DmaError> {
        let range = extract_guard(self.allocator.lock()).allocate(
            size as u64,
            alignment,
            AllocPolicy::FirstMatch,
        )?;
        Ok(DmaRegion {
            pool: Arc::clone(self),
            range,
        })
    }

    fn free(&self, range: &RangeInclusive) {
        if let Err(err) = extract_guard(self.allocator.lock()).free(range) {
            warn!("Failed to release DMA range {:#x}: {err}", range.start());
        }
    }
}

/// An allocated DMA region, returned to its pool on drop.
#[derive(Debug)]
pub struct DmaRegion {
    pool: Arc<DmaPool>,
    range: RangeInclusive,
}

impl DmaRegion {
    /// Bus address of the first byte.
    pub fn addr(&self) -> u32 {
        // Pools never extend past the 32-bit bus.
        u32::try_from(self.range.start()).unwrap_or(u32::MAX)
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        usize::try_from(self.range.end() - self.range.start() + 1).unwrap_or(usize::MAX)
    }

    /// Always false: the allocator never hands out empty ranges.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Memory backing the region.
    pub fn memory(&self) -> &DmaMemory {
        &self.pool.mem
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.pool.free(&self.range);
    }
}

#[derive(Debug)]
struct Segment {
    region: Option<DmaRegion>,
    len: usize,
}

/// Owning handle of a frame buffer made of one or more DMA segments.
///
/// TX frames may be scattered across several segments; RX buffers always have one. Dropping
/// the token releases every segment to its pool.
#[derive(Debug)]
pub struct MemToken {
    segments: Vec<Segment>,
}

impl MemToken {
    /// Allocates a single-segment buffer able to hold `capacity` bytes.
    pub fn alloc(pool: &Arc<DmaPool>, capacity: usize) -> Result<Self, DmaError> {
        let region = pool.allocate(capacity.max(1), 4)?;
        Ok(Self {
            segments: vec![Segment {
                region: Some(region),
                len: capacity,
            }],
        })
    }

    /// Builds a frame from `parts`, one segment per part. Empty parts become empty segments.
    pub fn from_segments(pool: &Arc<DmaPool>, parts: &[&[u8]]) -> Result<Self, DmaError> {
        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            if part.is_empty() {
                segments.push(Segment {
                    region: None,
                    len: 0,
                });
                continue;
            }
            let region = pool.allocate(part.len(), 4)?;
            region.memory().write_slice(region.addr(), part)?;
            segments.push(Segment {
                region: Some(region),
                len: part.len(),
            });
        }
        Ok(Self { segments })
    }

    /// Total number of payload bytes.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Number of segments, including empty ones.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bus address and length of every non-empty segment, in order.
    pub fn dma_segments(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.segments
            .iter()
            .filter(|s| s.len > 0)
            .filter_map(|s| s.region.as_ref().map(|r| (r.addr(), s.len)))
    }

    /// Bus address of the first segment, 0 if the token has no memory.
    pub fn data_addr(&self) -> u32 {
        self.segments
            .iter()
            .find_map(|s| s.region.as_ref())
            .map_or(0, DmaRegion::addr)
    }

    /// Capacity of the first segment's region.
    pub fn capacity(&self) -> usize {
        self.segments
            .iter()
            .find_map(|s| s.region.as_ref())
            .map_or(0, DmaRegion::len)
    }

    /// Sets the payload length of a single-segment buffer after the device filled it.
    pub fn set_len(&mut self, len: usize) -> Result<(), DmaError> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(DmaError::SegmentTooLong(len, capacity));
        }
        if let Some(first) = self.segments.first_mut() {
            first.len = len;
        }
        Ok(())
    }

    /// Copies the payload out of DMA memory.
    pub fn to_vec(&self) -> Result<Vec<u8>, DmaError> {
        let mut out = vec![0u8; self.total_len()];
        let mut offset = 0;
        for segment in &self.segments {
            if let Some(region) = &segment.region {
                let end = offset + segment.len;
                region
                    .memory()
                    .read_slice(region.addr(), &mut out[offset..end])?;
                offset = end;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u64) -> Arc<DmaPool> {
        let mem = DmaMemory::anonymous(0x10_0000, 0x10_0000).unwrap();
        DmaPool::new(mem, 0x10_0000, size).unwrap()
    }

    #[test]
    fn test_memory_bounds() {
        DmaMemory::anonymous(0xFFFF_F000, 0x2000).unwrap_err();
        let mem = DmaMemory::anonymous(0x1000, 0x1000).unwrap();
        mem.write_u32(0x1004, 0xFEED_FACE).unwrap();
        assert_eq!(mem.read_u32(0x1004).unwrap(), 0xFEED_FACE);
        mem.read_u32(0x2000).unwrap_err();
    }

    #[test]
    fn test_region_freed_on_drop() {
        let pool = pool(0x100);
        let first = pool.allocate(0x100, 16).unwrap();
        assert_eq!(first.addr(), 0x10_0000);
        assert_eq!(first.len(), 0x100);
        pool.allocate(16, 16).unwrap_err();
        drop(first);
        assert_eq!(pool.allocate(16, 16).unwrap().addr(), 0x10_0000);
    }

    #[test]
    fn test_token_segments() {
        let pool = pool(0x1000);
        let token =
            MemToken::from_segments(&pool, &[b"head".as_slice(), b"", b"tail!".as_slice()])
                .unwrap();
        assert_eq!(token.segment_count(), 3);
        assert_eq!(token.total_len(), 9);
        let segs: Vec<_> = token.dma_segments().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].1, 4);
        assert_eq!(segs[1].1, 5);
        assert_eq!(token.to_vec().unwrap(), b"headtail!");
    }

    #[test]
    fn test_rx_buffer_len() {
        let pool = pool(0x1000);
        let mut token = MemToken::alloc(&pool, 64).unwrap();
        assert_eq!(token.capacity(), 64);
        pool.memory()
            .write_slice(token.data_addr(), &[7u8; 10])
            .unwrap();
        token.set_len(10).unwrap();
        assert_eq!(token.to_vec().unwrap(), vec![7u8; 10]);
        token.set_len(65).unwrap_err();
    }
}
