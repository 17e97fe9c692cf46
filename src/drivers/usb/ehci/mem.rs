//! DMA descriptor memory pool
//!
//! Queue heads and transfer descriptors must live at stable, device-visible
//! addresses. The pool carves them out of page blocks that are allocated and
//! mapped once as common buffers; each block tracks its 64-byte units in a
//! bitmap. Blocks are added when no existing block has a long enough free
//! run, and every block except the first is released once it empties.
//!
//! The controller takes the high 32 bits of every descriptor address from
//! CTRLDSSEGMENT, or assumes zero without 64-bit addressing, so every block
//! has to land in one 4 GiB segment. That is checked once when a block is
//! mapped.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use crate::drivers::dma::{DmaMapping, DmaOperation, DmaOps, PAGE_SIZE, pages_for};
use crate::drivers::usb::controller::UsbError;

/// Allocation quantum
pub const MEM_UNIT: usize = 64;

#[inline]
const fn round_to_units(size: usize) -> usize {
    size.div_ceil(MEM_UNIT) * MEM_UNIT
}

/// One mapped page block and its allocation bitmap
struct MemBlock {
    host: NonNull<u8>,
    bus: u64,
    len: usize,
    pages: usize,
    /// One bit per unit; set = allocated
    bits: Vec<u8>,
    mapping: DmaMapping,
}

impl MemBlock {
    fn create<D: DmaOps + ?Sized>(
        dma: &mut D,
        pages: usize,
        which_4g: u32,
    ) -> Result<Self, UsbError> {
        let len = pages * PAGE_SIZE;
        let host = dma.allocate_buffer(pages)?;

        // SAFETY: the pages stay allocated until `release`, which unmaps first.
        let mapping = match unsafe { dma.map(DmaOperation::CommonBuffer, host, len) } {
            Ok(mapping) => mapping,
            Err(err) => {
                unsafe { dma.free_buffer(host, pages) };
                return Err(err.into());
            }
        };

        let wrong_segment = (mapping.device_address >> 32) as u32 != which_4g;
        if mapping.len != len || wrong_segment {
            log::error!(
                "EHCI: pool block at bus {:#x} (len {:#x}) unusable, segment {:#x} required",
                mapping.device_address,
                mapping.len,
                which_4g
            );
            let _ = dma.unmap(mapping);
            unsafe { dma.free_buffer(host, pages) };
            return Err(UsbError::OutOfResources);
        }

        Ok(Self {
            host,
            bus: mapping.device_address,
            len,
            pages,
            bits: vec![0; len / (MEM_UNIT * 8)],
            mapping,
        })
    }

    fn release<D: DmaOps + ?Sized>(self, dma: &mut D) {
        let _ = dma.unmap(self.mapping);
        // SAFETY: the block is unmapped and no descriptor references it.
        unsafe { dma.free_buffer(self.host, self.pages) };
    }

    #[inline]
    fn host_start(&self) -> usize {
        self.host.as_ptr() as usize
    }

    fn contains_host(&self, addr: usize, size: usize) -> bool {
        addr >= self.host_start() && addr + size <= self.host_start() + self.len
    }

    fn contains_bus(&self, addr: u64, size: usize) -> bool {
        addr >= self.bus && addr + size as u64 <= self.bus + self.len as u64
    }

    #[inline]
    fn is_set(&self, unit: usize) -> bool {
        self.bits[unit / 8] & (1 << (unit % 8)) != 0
    }

    #[inline]
    fn units(&self) -> usize {
        self.bits.len() * 8
    }

    /// First-fit search for `count` contiguous free units
    fn alloc_units(&mut self, count: usize) -> Option<NonNull<u8>> {
        let mut run_start = 0;
        let mut run_len = 0;

        for unit in 0..self.units() {
            if self.is_set(unit) {
                run_len = 0;
                run_start = unit + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for u in run_start..run_start + count {
                    self.bits[u / 8] |= 1 << (u % 8);
                }
                // SAFETY: run_start * MEM_UNIT is inside the block.
                return Some(unsafe { self.host.add(run_start * MEM_UNIT) });
            }
        }
        None
    }

    fn free_units(&mut self, addr: usize, count: usize) {
        let first = (addr - self.host_start()) / MEM_UNIT;
        for u in first..first + count {
            debug_assert!(self.is_set(u), "EHCI: double free of pool unit {}", u);
            self.bits[u / 8] &= !(1 << (u % 8));
        }
    }

    fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    fn used_units(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Pool of DMA-mapped memory for hardware descriptors
pub struct MemPool {
    /// `blocks[0]` is the head block and lives as long as the pool
    blocks: Vec<MemBlock>,
    which_4g: u32,
    default_pages: usize,
}

impl MemPool {
    /// Create a pool with one head block of `default_pages`
    ///
    /// Every block must map into the 4 GiB segment `which_4g`.
    pub fn new<D: DmaOps + ?Sized>(
        dma: &mut D,
        which_4g: u32,
        default_pages: usize,
    ) -> Result<Self, UsbError> {
        let default_pages = default_pages.max(1);
        let head = MemBlock::create(dma, default_pages, which_4g)?;
        log::debug!(
            "EHCI: memory pool head block at bus {:#x}, {} pages",
            head.bus,
            default_pages
        );

        Ok(Self {
            blocks: vec![head],
            which_4g,
            default_pages,
        })
    }

    /// Allocate `size` zeroed bytes, aligned to [`MEM_UNIT`]
    pub fn allocate<D: DmaOps + ?Sized>(
        &mut self,
        dma: &mut D,
        size: usize,
    ) -> Result<NonNull<u8>, UsbError> {
        if size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let alloc_size = round_to_units(size);
        let units = alloc_size / MEM_UNIT;

        let found = self.blocks.iter_mut().find_map(|b| b.alloc_units(units));
        let mem = match found {
            Some(mem) => mem,
            None => {
                let pages = if alloc_size > self.default_pages * PAGE_SIZE {
                    pages_for(alloc_size) + 1
                } else {
                    self.default_pages
                };

                let mut block = match MemBlock::create(dma, pages, self.which_4g) {
                    Ok(block) => block,
                    Err(err) => {
                        log::info!("EHCI: failed to grow memory pool by {} pages", pages);
                        return Err(err);
                    }
                };
                let mem = block
                    .alloc_units(units)
                    .ok_or(UsbError::OutOfResources)?;
                // New blocks go right after the head
                self.blocks.insert(1, block);
                mem
            }
        };

        // SAFETY: `mem` covers `alloc_size >= size` bytes of the block.
        unsafe { ptr::write_bytes(mem.as_ptr(), 0, size) };
        Ok(mem)
    }

    /// Allocate a zeroed `T` from the pool
    pub fn allocate_typed<T, D: DmaOps + ?Sized>(
        &mut self,
        dma: &mut D,
    ) -> Result<NonNull<T>, UsbError> {
        debug_assert!(core::mem::align_of::<T>() <= MEM_UNIT);
        Ok(self.allocate(dma, core::mem::size_of::<T>())?.cast())
    }

    /// Return `size` bytes at `mem` to the pool
    ///
    /// A non-head block that becomes empty is unmapped and freed.
    pub fn free<D: DmaOps + ?Sized>(&mut self, dma: &mut D, mem: NonNull<u8>, size: usize) {
        let alloc_size = round_to_units(size);
        let addr = mem.as_ptr() as usize;

        let Some(index) = self
            .blocks
            .iter()
            .position(|b| b.contains_host(addr, alloc_size))
        else {
            log::error!("EHCI: free of {:#x} outside the memory pool", addr);
            debug_assert!(false, "EHCI: free of memory outside the pool");
            return;
        };

        self.blocks[index].free_units(addr, alloc_size / MEM_UNIT);

        if index != 0 && self.blocks[index].is_empty() {
            let block = self.blocks.remove(index);
            log::trace!("EHCI: releasing empty pool block at bus {:#x}", block.bus);
            block.release(dma);
        }
    }

    /// Return a `T` allocated with [`MemPool::allocate_typed`]
    pub fn free_typed<T, D: DmaOps + ?Sized>(&mut self, dma: &mut D, mem: NonNull<T>) {
        self.free(dma, mem.cast(), core::mem::size_of::<T>());
    }

    /// Device address of pool memory at `host`
    ///
    /// Passing memory that the pool does not own is a programming error.
    pub fn device_address(&self, host: *const u8, size: usize) -> u64 {
        let addr = host as usize;
        match self.blocks.iter().find(|b| b.contains_host(addr, size)) {
            Some(block) => block.bus + (addr - block.host_start()) as u64,
            None => {
                log::error!("EHCI: {:#x} is not pool memory", addr);
                debug_assert!(false, "EHCI: address translation outside the pool");
                0
            }
        }
    }

    /// Host address of the pool memory the device sees at `bus`
    pub fn host_address(&self, bus: u64, size: usize) -> Option<NonNull<u8>> {
        let block = self.blocks.iter().find(|b| b.contains_bus(bus, size))?;
        // SAFETY: contained in the block
        Some(unsafe { block.host.add((bus - block.bus) as usize) })
    }

    /// Number of blocks currently backing the pool
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes currently handed out, in whole units
    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().map(MemBlock::used_units).sum::<usize>() * MEM_UNIT
    }

    /// Release every block, head included
    pub fn destroy<D: DmaOps + ?Sized>(mut self, dma: &mut D) {
        for block in self.blocks.drain(..) {
            if !block.is_empty() {
                log::debug!("EHCI: releasing pool block at bus {:#x} with live units", block.bus);
            }
            block.release(dma);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::ehci::testing::FakeDma;

    #[test]
    fn test_allocations_are_zeroed_aligned_and_disjoint() {
        let mut dma = FakeDma::new();
        let mut pool = MemPool::new(&mut dma, 0, 1).unwrap();

        let a = pool.allocate(&mut dma, 100).unwrap();
        unsafe { ptr::write_bytes(a.as_ptr(), 0xAA, 100) };
        let b = pool.allocate(&mut dma, 64).unwrap();
        let c = pool.allocate(&mut dma, 1).unwrap();

        let (a, b, c) = (a.as_ptr() as usize, b.as_ptr() as usize, c.as_ptr() as usize);
        assert_eq!(a % MEM_UNIT, 0);
        assert_eq!(b, a + 128);
        assert_eq!(c, b + 64);

        // Freed memory comes back zeroed on reuse
        pool.free(&mut dma, NonNull::new(a as *mut u8).unwrap(), 100);
        let again = pool.allocate(&mut dma, 100).unwrap();
        assert_eq!(again.as_ptr() as usize, a);
        let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr(), 100) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_device_address_translation_is_stable() {
        let mut dma = FakeDma::new();
        let mut pool = MemPool::new(&mut dma, 0, 1).unwrap();

        let a = pool.allocate(&mut dma, 64).unwrap();
        let bus = pool.device_address(a.as_ptr(), 64);
        assert_eq!(dma.bus_to_host(bus), Some(a.as_ptr()));
        assert_eq!(pool.host_address(bus, 64), Some(a));

        let b = pool.allocate(&mut dma, 256).unwrap();
        assert_eq!(pool.device_address(a.as_ptr(), 64), bus);
        assert_eq!(pool.device_address(b.as_ptr(), 256), bus + 64);
    }

    #[test]
    fn test_pool_grows_and_reclaims_non_head_blocks() {
        let mut dma = FakeDma::new();
        let mut pool = MemPool::new(&mut dma, 0, 1).unwrap();

        // Fill the single-page head block
        let head_units: Vec<_> = (0..PAGE_SIZE / MEM_UNIT)
            .map(|_| pool.allocate(&mut dma, MEM_UNIT).unwrap())
            .collect();
        assert_eq!(pool.block_count(), 1);

        let extra = pool.allocate(&mut dma, MEM_UNIT).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert_eq!(dma.live_allocations(), 2);

        pool.free(&mut dma, extra, MEM_UNIT);
        assert_eq!(pool.block_count(), 1);
        assert_eq!(dma.live_allocations(), 1);
        assert_eq!(dma.live_mappings(), 1);

        // Emptying the head block keeps it
        for unit in head_units {
            pool.free(&mut dma, unit, MEM_UNIT);
        }
        assert_eq!(pool.block_count(), 1);

        pool.destroy(&mut dma);
        assert_eq!(dma.live_allocations(), 0);
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_large_request_gets_dedicated_block() {
        let mut dma = FakeDma::new();
        let mut pool = MemPool::new(&mut dma, 0, 1).unwrap();

        let big = pool.allocate(&mut dma, 3 * PAGE_SIZE).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert_eq!(dma.allocation_pages(big.as_ptr()), Some(4));

        pool.free(&mut dma, big, 3 * PAGE_SIZE);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn test_block_outside_required_segment_is_rejected() {
        let mut dma = FakeDma::with_segment(0x1);
        let mut pool = MemPool::new(&mut dma, 0x1, 1).unwrap();

        let _all: Vec<_> = (0..PAGE_SIZE / MEM_UNIT)
            .map(|_| pool.allocate(&mut dma, MEM_UNIT).unwrap())
            .collect();

        dma.force_next_segment(0x2);
        assert_eq!(
            pool.allocate(&mut dma, MEM_UNIT),
            Err(UsbError::OutOfResources)
        );
        assert_eq!(pool.block_count(), 1);
        // The rejected block was unmapped and freed again
        assert_eq!(dma.live_allocations(), 1);
        assert_eq!(dma.live_mappings(), 1);
    }

    #[test]
    fn test_low_pool_refuses_to_grow_above_4g() {
        let mut dma = FakeDma::new();
        let mut pool = MemPool::new(&mut dma, 0, 1).unwrap();

        let _all: Vec<_> = (0..PAGE_SIZE / MEM_UNIT)
            .map(|_| pool.allocate(&mut dma, MEM_UNIT).unwrap())
            .collect();

        dma.force_next_segment(0x1);
        assert_eq!(
            pool.allocate(&mut dma, MEM_UNIT),
            Err(UsbError::OutOfResources)
        );
        assert_eq!(pool.block_count(), 1);
        assert_eq!(dma.live_allocations(), 1);

        // The next block lands low again and is accepted
        assert!(pool.allocate(&mut dma, MEM_UNIT).is_ok());
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_short_mapping_fails_pool_creation() {
        let mut dma = FakeDma::new();
        dma.set_short_maps(true);
        assert_eq!(
            MemPool::new(&mut dma, 0, 2).err(),
            Some(UsbError::OutOfResources)
        );
        assert_eq!(dma.live_allocations(), 0);
    }
}
