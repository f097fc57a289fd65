//! Register access over mapped capability regions.

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

use volatile_register::{RO, RW};

use crate::error::RegisterAccessError;
use crate::status::DeviceStatus;

/// A mapped, byte-addressable region of device memory.
///
/// Implementations perform one raw volatile access of exactly the requested
/// width and return whatever the bus delivers. Little-endian normalisation and
/// bounds checking live in [`Registers`], so offsets handed to these methods
/// are always in range and naturally aligned.
pub trait Mmio {
    fn len(&self) -> usize;
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);

    /// Two 32-bit reads, low word first. Each half is returned as the bus
    /// delivered it.
    fn read64(&self, offset: usize) -> (u32, u32) {
        let low = self.read32(offset);
        let high = self.read32(offset + 4);
        (low, high)
    }

    /// Two 32-bit writes, low word first.
    fn write64(&self, offset: usize, low: u32, high: u32) {
        self.write32(offset, low);
        self.write32(offset + 4, high);
    }
}

/// A region mapped into the address space, accessed through volatile cells.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region is device memory; every access is a single volatile operation.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// # Safety
    ///
    /// `base..base + len` must be mapped device memory (uncached) for as long
    /// as the region or any clone of it is alive.
    pub unsafe fn new(base: usize, len: usize) -> Option<Self> {
        NonNull::new(base as *mut u8).map(|base| MmioRegion { base, len })
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn cell<T: Copy>(&self, offset: usize) -> &RW<T> {
        unsafe { &*(self.base.as_ptr().add(offset) as *const RW<T>) }
    }
}

impl Mmio for MmioRegion {
    fn len(&self) -> usize {
        self.len
    }
    fn read8(&self, offset: usize) -> u8 {
        self.cell::<u8>(offset).read()
    }
    fn read16(&self, offset: usize) -> u16 {
        self.cell::<u16>(offset).read()
    }
    fn read32(&self, offset: usize) -> u32 {
        self.cell::<u32>(offset).read()
    }
    fn write8(&self, offset: usize, value: u8) {
        unsafe { self.cell::<u8>(offset).write(value) }
    }
    fn write16(&self, offset: usize, value: u16) {
        unsafe { self.cell::<u16>(offset).write(value) }
    }
    fn write32(&self, offset: usize, value: u32) {
        unsafe { self.cell::<u32>(offset).write(value) }
    }
}

/// Bounds-checked little-endian accessors over an [`Mmio`] region.
///
/// 64-bit fields are accessed as two 32-bit halves, low half first.
#[derive(Debug, Clone)]
pub struct Registers<M> {
    mmio: M,
}

impl<M: Mmio> Registers<M> {
    pub fn new(mmio: M) -> Self {
        Registers { mmio }
    }

    pub fn len(&self) -> usize {
        self.mmio.len()
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    fn check(&self, offset: usize, width: usize, align: usize) -> Result<(), RegisterAccessError> {
        let len = self.mmio.len();
        match offset.checked_add(width) {
            Some(end) if end <= len => {}
            _ => return Err(RegisterAccessError::OutOfRange { offset, width, len }),
        }
        if offset % align != 0 {
            return Err(RegisterAccessError::Misaligned { offset, width });
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, RegisterAccessError> {
        self.check(offset, 1, 1)?;
        Ok(self.mmio.read8(offset))
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, RegisterAccessError> {
        self.check(offset, 2, 2)?;
        Ok(u16::from_le(self.mmio.read16(offset)))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, RegisterAccessError> {
        self.check(offset, 4, 4)?;
        Ok(u32::from_le(self.mmio.read32(offset)))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, RegisterAccessError> {
        self.check(offset, 8, 4)?;
        let (low, high) = self.mmio.read64(offset);
        Ok(u64::from(u32::from_le(high)) << 32 | u64::from(u32::from_le(low)))
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<(), RegisterAccessError> {
        self.check(offset, 1, 1)?;
        self.mmio.write8(offset, value);
        Ok(())
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<(), RegisterAccessError> {
        self.check(offset, 2, 2)?;
        self.mmio.write16(offset, value.to_le());
        Ok(())
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterAccessError> {
        self.check(offset, 4, 4)?;
        self.mmio.write32(offset, value.to_le());
        Ok(())
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<(), RegisterAccessError> {
        self.check(offset, 8, 4)?;
        self.mmio.write64(offset, (value as u32).to_le(), ((value >> 32) as u32).to_le());
        Ok(())
    }
}

/// PCI Device Common Configuration Structure.
///
/// Ref: 4.1.4.3 Common configuration structure layout
///
/// This type is never instantiated over memory by the driver; it pins the wire
/// layout and is the source of the offsets in [`offset`].
#[repr(C)]
#[allow(unused)]
pub struct CommonCfgLayout {
    /// Selects which 32-bit window of the device feature bits `device_feature`
    /// shows: 0 for bits 0 to 31, 1 for bits 32 to 63, and so on.
    device_feature_select: RW<u32>,

    /// Device feature bits in the window chosen by `device_feature_select`
    device_feature: RO<u32>,

    /// Selects the 32-bit window of driver feature bits written through
    /// `driver_feature`
    driver_feature_select: RW<u32>,

    /// Driver feature bits accepted, in the window chosen by
    /// `driver_feature_select`
    driver_feature: RW<u32>,

    /// MSI-X vector for configuration change notifications
    config_msix_vector: RW<u16>,

    /// Maximum number of virtqueues supported by the device
    num_queues: RO<u16>,

    /// Device status
    ///
    /// Writing zero resets the device. Any other write sets the status flags
    /// indicating driver progress.
    device_status: RW<u8>,

    /// Configuration atomicity value, changed by the device whenever the
    /// device-specific configuration changes
    config_generation: RO<u8>,

    /// Queue select
    ///
    /// Selects the virtqueue the following fields up to `queue_reset` refer to.
    queue_select: RW<u16>,

    /// Queue size
    ///
    /// On reset, the maximum queue size supported by the device. The driver
    /// may write a smaller value.
    queue_size: RW<u16>,

    /// MSI-X vector for the selected queue
    queue_msix_vector: RW<u16>,

    /// Writing 1 enables the selected queue
    queue_enable: RW<u16>,

    /// Offset of the doorbell of the selected queue within the notification
    /// region, in units of `notify_off_multiplier`
    queue_notify_off: RO<u16>,

    /// Physical address of the descriptor area
    queue_desc: RW<u64>,

    /// Physical address of the driver (available ring) area
    queue_driver: RW<u64>,

    /// Physical address of the device (used ring) area
    queue_device: RW<u64>,

    /// Notification data the driver uses when VIRTIO_F_NOTIF_CONFIG_DATA
    /// is negotiated
    queue_notif_config_data: RO<u16>,

    /// Per-queue reset, valid with VIRTIO_F_RING_RESET
    queue_reset: RW<u16>,

    /// Index of the administration virtqueue
    admin_queue_index: RO<u16>,

    /// Number of administration virtqueues
    admin_queue_num: RO<u16>,
}

/// Byte offsets of the common configuration fields.
pub mod offset {
    use super::CommonCfgLayout;
    use core::mem::offset_of;

    pub const DEVICE_FEATURE_SELECT: usize = offset_of!(CommonCfgLayout, device_feature_select);
    pub const DEVICE_FEATURE: usize = offset_of!(CommonCfgLayout, device_feature);
    pub const DRIVER_FEATURE_SELECT: usize = offset_of!(CommonCfgLayout, driver_feature_select);
    pub const DRIVER_FEATURE: usize = offset_of!(CommonCfgLayout, driver_feature);
    pub const CONFIG_MSIX_VECTOR: usize = offset_of!(CommonCfgLayout, config_msix_vector);
    pub const NUM_QUEUES: usize = offset_of!(CommonCfgLayout, num_queues);
    pub const DEVICE_STATUS: usize = offset_of!(CommonCfgLayout, device_status);
    pub const CONFIG_GENERATION: usize = offset_of!(CommonCfgLayout, config_generation);
    pub const QUEUE_SELECT: usize = offset_of!(CommonCfgLayout, queue_select);
    pub const QUEUE_SIZE: usize = offset_of!(CommonCfgLayout, queue_size);
    pub const QUEUE_MSIX_VECTOR: usize = offset_of!(CommonCfgLayout, queue_msix_vector);
    pub const QUEUE_ENABLE: usize = offset_of!(CommonCfgLayout, queue_enable);
    pub const QUEUE_NOTIFY_OFF: usize = offset_of!(CommonCfgLayout, queue_notify_off);
    pub const QUEUE_DESC: usize = offset_of!(CommonCfgLayout, queue_desc);
    pub const QUEUE_DRIVER: usize = offset_of!(CommonCfgLayout, queue_driver);
    pub const QUEUE_DEVICE: usize = offset_of!(CommonCfgLayout, queue_device);
    pub const QUEUE_NOTIF_CONFIG_DATA: usize = offset_of!(CommonCfgLayout, queue_notif_config_data);
    pub const QUEUE_RESET: usize = offset_of!(CommonCfgLayout, queue_reset);
    pub const ADMIN_QUEUE_INDEX: usize = offset_of!(CommonCfgLayout, admin_queue_index);
    pub const ADMIN_QUEUE_NUM: usize = offset_of!(CommonCfgLayout, admin_queue_num);
}

/// Size of the common configuration structure.
pub const COMMON_CFG_LEN: usize = size_of::<CommonCfgLayout>();

/// Typed view of the common configuration region.
///
/// The view owns only the mapping handle. Per-queue fields are reachable
/// through [`CommonCfg::select_queue`] alone.
#[derive(Debug, Clone)]
pub struct CommonCfg<M> {
    regs: Registers<M>,
}

impl<M: Mmio> CommonCfg<M> {
    pub fn new(mmio: M) -> Result<Self, RegisterAccessError> {
        let len = mmio.len();
        if len < COMMON_CFG_LEN {
            return Err(RegisterAccessError::OutOfRange { offset: 0, width: COMMON_CFG_LEN, len });
        }
        Ok(CommonCfg { regs: Registers::new(mmio) })
    }

    pub fn registers(&self) -> &Registers<M> {
        &self.regs
    }

    /// Reads the 32-bit window `select` of the device feature bits.
    pub fn device_features(&mut self, select: u32) -> Result<u32, RegisterAccessError> {
        self.regs.write_u32(offset::DEVICE_FEATURE_SELECT, select)?;
        self.regs.read_u32(offset::DEVICE_FEATURE)
    }

    /// Writes the 32-bit window `select` of the driver feature bits.
    pub fn set_driver_features(&mut self, select: u32, bits: u32) -> Result<(), RegisterAccessError> {
        self.regs.write_u32(offset::DRIVER_FEATURE_SELECT, select)?;
        self.regs.write_u32(offset::DRIVER_FEATURE, bits)
    }

    pub fn config_msix_vector(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::CONFIG_MSIX_VECTOR)
    }

    pub fn set_config_msix_vector(&mut self, vector: u16) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset::CONFIG_MSIX_VECTOR, vector)
    }

    pub fn num_queues(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::NUM_QUEUES)
    }

    pub fn device_status(&self) -> Result<DeviceStatus, RegisterAccessError> {
        Ok(DeviceStatus::from_bits_truncate(self.regs.read_u8(offset::DEVICE_STATUS)?))
    }

    pub fn set_device_status(&mut self, status: DeviceStatus) -> Result<(), RegisterAccessError> {
        self.regs.write_u8(offset::DEVICE_STATUS, status.bits())
    }

    pub fn config_generation(&self) -> Result<u8, RegisterAccessError> {
        self.regs.read_u8(offset::CONFIG_GENERATION)
    }

    pub fn admin_queue_index(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::ADMIN_QUEUE_INDEX)
    }

    pub fn admin_queue_num(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::ADMIN_QUEUE_NUM)
    }

    /// Selects queue `index` and returns its per-queue fields.
    ///
    /// The select write is fenced before any per-queue access, and the
    /// returned handle borrows the view so the selection cannot change under it.
    pub fn select_queue(&mut self, index: u16) -> Result<QueueRegs<'_, M>, RegisterAccessError> {
        self.regs.write_u16(offset::QUEUE_SELECT, index)?;
        fence(Ordering::SeqCst);
        Ok(QueueRegs { regs: &self.regs, index })
    }
}

/// Per-queue fields of the queue selected by [`CommonCfg::select_queue`].
pub struct QueueRegs<'a, M> {
    regs: &'a Registers<M>,
    index: u16,
}

impl<M: Mmio> QueueRegs<'_, M> {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::QUEUE_SIZE)
    }

    pub fn set_size(&mut self, size: u16) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset::QUEUE_SIZE, size)
    }

    pub fn msix_vector(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::QUEUE_MSIX_VECTOR)
    }

    pub fn set_msix_vector(&mut self, vector: u16) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset::QUEUE_MSIX_VECTOR, vector)
    }

    pub fn enabled(&self) -> Result<bool, RegisterAccessError> {
        Ok(self.regs.read_u16(offset::QUEUE_ENABLE)? == 1)
    }

    pub fn enable(&mut self) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset::QUEUE_ENABLE, 1)
    }

    pub fn notify_off(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::QUEUE_NOTIFY_OFF)
    }

    pub fn set_desc(&mut self, paddr: u64) -> Result<(), RegisterAccessError> {
        self.regs.write_u64(offset::QUEUE_DESC, paddr)
    }

    pub fn set_driver(&mut self, paddr: u64) -> Result<(), RegisterAccessError> {
        self.regs.write_u64(offset::QUEUE_DRIVER, paddr)
    }

    pub fn set_device(&mut self, paddr: u64) -> Result<(), RegisterAccessError> {
        self.regs.write_u64(offset::QUEUE_DEVICE, paddr)
    }

    pub fn notif_config_data(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::QUEUE_NOTIF_CONFIG_DATA)
    }

    pub fn reset_state(&self) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset::QUEUE_RESET)
    }

    pub fn request_reset(&mut self) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset::QUEUE_RESET, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::cell::RefCell;

    /// Little-endian byte buffer standing in for a mapped region.
    #[derive(Debug)]
    struct Bytes(RefCell<alloc::vec::Vec<u8>>);

    impl Mmio for Bytes {
        fn len(&self) -> usize {
            self.0.borrow().len()
        }
        fn read8(&self, offset: usize) -> u8 {
            self.0.borrow()[offset]
        }
        fn read16(&self, offset: usize) -> u16 {
            let b = self.0.borrow();
            u16::from_ne_bytes([b[offset], b[offset + 1]])
        }
        fn read32(&self, offset: usize) -> u32 {
            let b = self.0.borrow();
            u32::from_ne_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
        }
        fn write8(&self, offset: usize, value: u8) {
            self.0.borrow_mut()[offset] = value;
        }
        fn write16(&self, offset: usize, value: u16) {
            self.0.borrow_mut()[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
        }
        fn write32(&self, offset: usize, value: u32) {
            self.0.borrow_mut()[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
        }
    }

    #[test]
    fn common_cfg_layout_matches_wire_format() {
        assert_eq!(COMMON_CFG_LEN, 0x40);
        assert_eq!(offset::DEVICE_FEATURE_SELECT, 0x00);
        assert_eq!(offset::DEVICE_FEATURE, 0x04);
        assert_eq!(offset::DRIVER_FEATURE_SELECT, 0x08);
        assert_eq!(offset::DRIVER_FEATURE, 0x0c);
        assert_eq!(offset::CONFIG_MSIX_VECTOR, 0x10);
        assert_eq!(offset::NUM_QUEUES, 0x12);
        assert_eq!(offset::DEVICE_STATUS, 0x14);
        assert_eq!(offset::CONFIG_GENERATION, 0x15);
        assert_eq!(offset::QUEUE_SELECT, 0x16);
        assert_eq!(offset::QUEUE_SIZE, 0x18);
        assert_eq!(offset::QUEUE_MSIX_VECTOR, 0x1a);
        assert_eq!(offset::QUEUE_ENABLE, 0x1c);
        assert_eq!(offset::QUEUE_NOTIFY_OFF, 0x1e);
        assert_eq!(offset::QUEUE_DESC, 0x20);
        assert_eq!(offset::QUEUE_DRIVER, 0x28);
        assert_eq!(offset::QUEUE_DEVICE, 0x30);
        assert_eq!(offset::QUEUE_NOTIF_CONFIG_DATA, 0x38);
        assert_eq!(offset::QUEUE_RESET, 0x3a);
        assert_eq!(offset::ADMIN_QUEUE_INDEX, 0x3c);
        assert_eq!(offset::ADMIN_QUEUE_NUM, 0x3e);
    }

    #[test]
    fn accesses_are_little_endian_on_the_wire() {
        let regs = Registers::new(Bytes(RefCell::new(vec![0; 16])));
        regs.write_u32(4, 0x1122_3344).unwrap();
        regs.write_u64(8, 0x0102_0304_0506_0708).unwrap();
        let raw = regs.mmio().0.borrow().clone();
        assert_eq!(&raw[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&raw[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(regs.read_u16(4).unwrap(), 0x3344);
        assert_eq!(regs.read_u64(8).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn out_of_range_and_misaligned_accesses_fail() {
        let regs = Registers::new(Bytes(RefCell::new(vec![0; 8])));
        assert_eq!(
            regs.read_u32(6),
            Err(RegisterAccessError::OutOfRange { offset: 6, width: 4, len: 8 })
        );
        assert_eq!(
            regs.write_u64(usize::MAX - 2, 0),
            Err(RegisterAccessError::OutOfRange { offset: usize::MAX - 2, width: 8, len: 8 })
        );
        assert_eq!(regs.read_u16(3), Err(RegisterAccessError::Misaligned { offset: 3, width: 2 }));
        assert!(regs.read_u8(7).is_ok());
    }

    #[test]
    fn common_cfg_rejects_short_region() {
        let err = CommonCfg::new(Bytes(RefCell::new(vec![0; 0x20]))).unwrap_err();
        assert_eq!(err, RegisterAccessError::OutOfRange { offset: 0, width: 0x40, len: 0x20 });
    }

    #[test]
    fn select_queue_writes_selector_first() {
        let mut cfg = CommonCfg::new(Bytes(RefCell::new(vec![0; COMMON_CFG_LEN]))).unwrap();
        {
            let mut q = cfg.select_queue(3).unwrap();
            q.set_size(64).unwrap();
            q.set_desc(0xdead_beef_0000).unwrap();
        }
        let regs = cfg.registers();
        assert_eq!(regs.read_u16(offset::QUEUE_SELECT).unwrap(), 3);
        assert_eq!(regs.read_u16(offset::QUEUE_SIZE).unwrap(), 64);
        assert_eq!(regs.read_u64(offset::QUEUE_DESC).unwrap(), 0xdead_beef_0000);
    }

    #[test]
    fn mmio_region_over_memory() {
        // u64 storage keeps the buffer 8-byte aligned
        let mut backing = vec![0u64; COMMON_CFG_LEN / 8];
        let base = backing.as_mut_ptr() as usize;
        let region = unsafe { MmioRegion::new(base, COMMON_CFG_LEN) }.unwrap();
        assert_eq!(region.base(), base);
        assert!(unsafe { MmioRegion::new(0, 8) }.is_none());

        let regs = Registers::new(region);
        regs.write_u16(offset::QUEUE_SIZE, 0x0102).unwrap();
        regs.write_u32(offset::DEVICE_FEATURE, 0x1122_3344).unwrap();
        regs.write_u64(offset::QUEUE_DESC, 0x0011_2233_4455_6677).unwrap();
        assert_eq!(regs.read_u16(offset::QUEUE_SIZE).unwrap(), 0x0102);
        assert_eq!(regs.read_u32(offset::DEVICE_FEATURE).unwrap(), 0x1122_3344);
        assert_eq!(regs.read_u64(offset::QUEUE_DESC).unwrap(), 0x0011_2233_4455_6677);
        assert_eq!(
            regs.read_u32(COMMON_CFG_LEN),
            Err(RegisterAccessError::OutOfRange { offset: COMMON_CFG_LEN, width: 4, len: COMMON_CFG_LEN })
        );

        let mut cfg = CommonCfg::new(region).unwrap();
        cfg.select_queue(2).unwrap().set_msix_vector(7).unwrap();

        let bytes = unsafe { core::slice::from_raw_parts(base as *const u8, COMMON_CFG_LEN) };
        assert_eq!(&bytes[offset::QUEUE_SELECT..offset::QUEUE_SELECT + 2], &[2, 0]);
        assert_eq!(&bytes[offset::QUEUE_MSIX_VECTOR..offset::QUEUE_MSIX_VECTOR + 2], &[7, 0]);
        assert_eq!(&bytes[offset::QUEUE_SIZE..offset::QUEUE_SIZE + 2], &[0x02, 0x01]);
        assert_eq!(
            &bytes[offset::QUEUE_DESC..offset::QUEUE_DESC + 8],
            &[0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00]
        );
        drop(backing);
    }
}
