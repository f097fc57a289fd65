//! Split virtqueue memory layout.
//!
//! Ref: 2.7 Split Virtqueues
//!
//! The three areas of a queue live in one allocation: the descriptor table at
//! offset zero, the available ring right after it and the used ring at the next
//! 4-byte boundary. Every multi-byte field is little-endian.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::dma::DmaRegion;

/// Alignment of a whole queue allocation.
pub const QUEUE_ALIGN: usize = 4096;
pub const DESC_ALIGN: usize = 16;
pub const AVAIL_ALIGN: usize = 2;
pub const USED_ALIGN: usize = 4;

bitflags::bitflags! {
    /// Descriptor flags.
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field
        const NEXT = 1;
        /// This marks a buffer as device write-only (otherwise device read-only)
        const WRITE = 2;
        /// This means the buffer contains a list of buffer descriptors
        const INDIRECT = 4;
    }
}

bitflags::bitflags! {
    /// Flags the driver publishes in the available ring.
    pub struct AvailFlags: u16 {
        const NO_INTERRUPT = 1;
    }
}

bitflags::bitflags! {
    /// Flags the device publishes in the used ring.
    pub struct UsedFlags: u16 {
        const NO_NOTIFY = 1;
    }
}

/// One descriptor table entry as laid out in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One used ring entry as laid out in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElem {
    /// Head of the completed descriptor chain
    pub id: u32,
    /// Bytes the device wrote into the chain
    pub len: u32,
}

const DESC_SIZE: usize = size_of::<Descriptor>();
const USED_ELEM_SIZE: usize = size_of::<UsedElem>();
// flags and idx precede each ring
const RING_HEADER: usize = 4;

/// Offsets of the three areas of a queue of `size` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    size: u16,
    avail_offset: usize,
    used_offset: usize,
    total: usize,
}

impl RingLayout {
    pub fn new(size: u16) -> Self {
        let n = usize::from(size);
        let avail_offset = DESC_SIZE * n;
        // ring[n] and used_event
        let avail_len = RING_HEADER + 2 * n + 2;
        let used_offset = align_up(avail_offset + avail_len, USED_ALIGN);
        // ring[n] and avail_event
        let used_len = RING_HEADER + USED_ELEM_SIZE * n + 2;
        RingLayout { size, avail_offset, used_offset, total: used_offset + used_len }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_offset(&self) -> usize {
        0
    }

    pub fn avail_offset(&self) -> usize {
        self.avail_offset
    }

    pub fn used_offset(&self) -> usize {
        self.used_offset
    }

    pub fn total_size(&self) -> usize {
        self.total
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Volatile access to the ring memory of one queue.
///
/// All reads and writes go through volatile operations because the device
/// observes and mutates the same memory concurrently.
#[derive(Debug)]
pub(crate) struct RingMemory {
    region: DmaRegion,
    layout: RingLayout,
}

impl RingMemory {
    /// `region` must be at least `layout.total_size()` bytes, aligned to
    /// [`QUEUE_ALIGN`], and owned by this queue alone on the driver side.
    pub(crate) fn new(region: DmaRegion, layout: RingLayout) -> Self {
        debug_assert!(region.size() >= layout.total_size());
        debug_assert_eq!(region.paddr() as usize % DESC_ALIGN, 0);
        RingMemory { region, layout }
    }

    pub(crate) fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub(crate) fn region(&self) -> DmaRegion {
        self.region
    }

    pub(crate) fn desc_paddr(&self) -> u64 {
        self.region.paddr() + self.layout.desc_offset() as u64
    }

    pub(crate) fn avail_paddr(&self) -> u64 {
        self.region.paddr() + self.layout.avail_offset() as u64
    }

    pub(crate) fn used_paddr(&self) -> u64 {
        self.region.paddr() + self.layout.used_offset() as u64
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + size_of::<T>() <= self.layout.total_size());
        unsafe { self.region.vaddr().as_ptr().add(offset) as *mut T }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le(unsafe { ptr::read_volatile(self.at::<u16>(offset)) })
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le(unsafe { ptr::read_volatile(self.at::<u32>(offset)) })
    }

    fn write_u16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_volatile(self.at::<u16>(offset), value.to_le()) }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.at::<u32>(offset), value.to_le()) }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        unsafe { ptr::write_volatile(self.at::<u64>(offset), value.to_le()) }
    }

    pub(crate) fn write_descriptor(&self, index: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        let base = self.layout.desc_offset() + DESC_SIZE * usize::from(index);
        self.write_u64(base, addr);
        self.write_u32(base + 8, len);
        self.write_u16(base + 12, flags.bits());
        self.write_u16(base + 14, next);
    }

    pub(crate) fn set_avail_flags(&self, flags: AvailFlags) {
        self.write_u16(self.layout.avail_offset(), flags.bits());
    }

    pub(crate) fn write_avail_slot(&self, slot: u16, head: u16) {
        self.write_u16(self.layout.avail_offset() + RING_HEADER + 2 * usize::from(slot), head);
    }

    /// Publishes `idx` after every earlier ring write.
    pub(crate) fn publish_avail_idx(&self, idx: u16) {
        fence(Ordering::Release);
        self.write_u16(self.layout.avail_offset() + 2, idx);
    }

    pub(crate) fn used_flags(&self) -> UsedFlags {
        UsedFlags::from_bits_truncate(self.read_u16(self.layout.used_offset()))
    }

    /// The device-published used index; entries below it are safe to read.
    pub(crate) fn used_idx(&self) -> u16 {
        let idx = self.read_u16(self.layout.used_offset() + 2);
        fence(Ordering::Acquire);
        idx
    }

    pub(crate) fn used_elem(&self, slot: u16) -> UsedElem {
        let base = self.layout.used_offset() + RING_HEADER + USED_ELEM_SIZE * usize::from(slot);
        UsedElem { id: self.read_u32(base), len: self.read_u32(base + 4) }
    }
}
