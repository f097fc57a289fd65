//! DMA memory for virtqueue rings.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::collections::BTreeMap;
use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::error::DmaError;

/// A block of DMA-capable memory: the bus address the device uses and the
/// CPU mapping the driver writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    paddr: u64,
    vaddr: NonNull<u8>,
    size: usize,
}

// The region is plain memory shared with the device, not tied to a thread.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `vaddr..vaddr + size` must be mapped, writable and stay valid until the
    /// region is freed, and the device must reach the same memory at `paddr`.
    pub unsafe fn new(paddr: u64, vaddr: NonNull<u8>, size: usize) -> Self {
        DmaRegion { paddr, vaddr, size }
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn vaddr(&self) -> NonNull<u8> {
        self.vaddr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Source of DMA memory for ring allocation.
pub trait DmaAllocator {
    /// Allocates `size` zeroed bytes aligned to `align` (a power of two).
    fn allocate(&mut self, size: usize, align: usize) -> Result<DmaRegion, DmaError>;

    /// Returns a region previously handed out by `allocate`.
    ///
    /// The device must no longer access the memory.
    fn free(&mut self, paddr: u64) -> Result<(), DmaError>;
}

/// First-fit allocator over one identity-mapped DMA window.
///
/// Physical and virtual addresses coincide, which holds for kernels that map
/// their DMA window 1:1 and for the owned arena used with the simulated device.
pub struct HeapDmaAllocator {
    heap: Heap,
    live: BTreeMap<u64, Layout>,
    arena: Option<(NonNull<u8>, Layout)>,
}

unsafe impl Send for HeapDmaAllocator {}

impl HeapDmaAllocator {
    /// # Safety
    ///
    /// `base..base + size` must be identity-mapped DMA memory that nothing else
    /// uses while the allocator is alive.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        HeapDmaAllocator { heap: Heap::new(base, size), live: BTreeMap::new(), arena: None }
    }

    /// An allocator over a freshly allocated, page-aligned arena of `size` bytes.
    pub fn with_capacity(size: usize) -> Result<Self, DmaError> {
        let layout = Layout::from_size_align(size, 4096)
            .map_err(|_| DmaError::InvalidLayout { size, align: 4096 })?;
        if size == 0 {
            return Err(DmaError::InvalidLayout { size, align: 4096 });
        }
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(DmaError::OutOfMemory { size, align: 4096 })?;
        let heap = unsafe { Heap::new(base.as_ptr() as usize, size) };
        Ok(HeapDmaAllocator { heap, live: BTreeMap::new(), arena: Some((base, layout)) })
    }

    /// Number of regions currently handed out.
    pub fn live_regions(&self) -> usize {
        self.live.len()
    }

    /// Bytes currently handed out.
    pub fn allocated(&self) -> usize {
        self.live.values().map(Layout::size).sum()
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Result<DmaRegion, DmaError> {
        if size == 0 {
            return Err(DmaError::InvalidLayout { size, align });
        }
        let layout =
            Layout::from_size_align(size, align).map_err(|_| DmaError::InvalidLayout { size, align })?;
        let ptr = self
            .heap
            .allocate_first_fit(layout)
            .map_err(|_| DmaError::OutOfMemory { size, align })?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        let paddr = ptr.as_ptr() as u64;
        self.live.insert(paddr, layout);
        log::trace!("dma: allocated {} bytes at {:#x}", size, paddr);
        Ok(unsafe { DmaRegion::new(paddr, ptr, size) })
    }

    fn free(&mut self, paddr: u64) -> Result<(), DmaError> {
        let layout = self.live.remove(&paddr).ok_or(DmaError::UnknownRegion { paddr })?;
        let ptr = NonNull::new(paddr as usize as *mut u8).ok_or(DmaError::UnknownRegion { paddr })?;
        unsafe { self.heap.deallocate(ptr, layout) };
        log::trace!("dma: freed {:#x}", paddr);
        Ok(())
    }
}

impl Drop for HeapDmaAllocator {
    fn drop(&mut self) {
        if let Some((base, layout)) = self.arena.take() {
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        let a = dma.allocate(100, 4096).unwrap();
        let b = dma.allocate(3000, 4096).unwrap();
        assert_eq!(a.paddr() % 4096, 0);
        assert_eq!(b.paddr() % 4096, 0);
        assert_ne!(a.paddr(), b.paddr());
        let bytes = unsafe { core::slice::from_raw_parts(b.vaddr().as_ptr(), b.size()) };
        assert!(bytes.iter().all(|&byte| byte == 0));
        assert_eq!(dma.live_regions(), 2);
        assert_eq!(dma.allocated(), 3100);
    }

    #[test]
    fn freed_memory_is_reused() {
        let mut dma = HeapDmaAllocator::with_capacity(16 * 1024).unwrap();
        let first = dma.allocate(8 * 1024, 4096).unwrap();
        assert!(matches!(dma.allocate(12 * 1024, 4096), Err(DmaError::OutOfMemory { .. })));
        dma.free(first.paddr()).unwrap();
        let again = dma.allocate(12 * 1024, 4096).unwrap();
        assert_eq!(dma.live_regions(), 1);
        dma.free(again.paddr()).unwrap();
        assert_eq!(dma.allocated(), 0);
    }

    #[test]
    fn unknown_and_double_free_fail() {
        let mut dma = HeapDmaAllocator::with_capacity(8 * 1024).unwrap();
        let region = dma.allocate(64, 16).unwrap();
        assert_eq!(dma.free(0x1234), Err(DmaError::UnknownRegion { paddr: 0x1234 }));
        dma.free(region.paddr()).unwrap();
        assert_eq!(
            dma.free(region.paddr()),
            Err(DmaError::UnknownRegion { paddr: region.paddr() })
        );
    }

    #[test]
    fn bad_layouts_are_rejected() {
        let mut dma = HeapDmaAllocator::with_capacity(8 * 1024).unwrap();
        assert_eq!(dma.allocate(0, 16), Err(DmaError::InvalidLayout { size: 0, align: 16 }));
        assert_eq!(dma.allocate(64, 3), Err(DmaError::InvalidLayout { size: 64, align: 3 }));
    }
}
